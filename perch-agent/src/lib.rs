// ABOUTME: Handler abstraction for perch chat agents.
// ABOUTME: Provides the AgentHandler trait, invocation context, and reply types.

pub mod context;
pub mod handler;
pub mod registry;
pub mod reply;

pub use context::{AgentContext, ChatInfo, HistoryEntry, UserInfo};
pub use handler::{reply_fn, stream_fn, AgentHandler, ReplyFn, StreamFn};
pub use registry::HandlerRegistry;
pub use reply::{AgentReply, ChunkStream};
