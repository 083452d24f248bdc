// ABOUTME: Root library module exposing all public modules
// ABOUTME: Provides access to client, config, session, dispatch, and transport modules

pub mod client;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod reconnect;
pub mod session;
pub mod testing;
pub mod transport;

// Top-level entrypoints
pub use client::{run_agent, AgentClient, ShutdownHandle};
pub use config::Config;
pub use session::{DisconnectCause, SessionState};

// Re-export perch-agent types for convenience
pub use perch_agent::{
    reply_fn, stream_fn, AgentContext, AgentHandler, AgentReply, ChatInfo, ChunkStream,
    HandlerRegistry, HistoryEntry, UserInfo,
};
