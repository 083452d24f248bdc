// ABOUTME: Core AgentHandler trait that embedding applications implement.
// ABOUTME: Includes closure adapters for plain-text and streaming handlers.

use crate::context::AgentContext;
use crate::reply::{AgentReply, ChunkStream};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};

/// Core trait for agent message handling.
///
/// One handler is registered per client. `on_message` is called once per
/// invocation; errors it returns are reported to the gateway as error
/// envelopes and never tear down the connection. The lifecycle hooks are
/// best-effort: failures are logged by the registry and otherwise ignored.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str {
        "agent"
    }

    /// Produce a reply for one inbound invocation
    async fn on_message(&self, ctx: AgentContext) -> Result<AgentReply>;

    /// Invoked once, before the first connection attempt
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Invoked once, after the client loop exits for any reason
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler backed by an async closure returning a single text reply
pub struct ReplyFn {
    f: Box<dyn Fn(AgentContext) -> BoxFuture<'static, Result<String>> + Send + Sync>,
}

/// Wrap an async closure as a single-shot text handler.
///
/// ```no_run
/// use perch_agent::reply_fn;
///
/// let handler = reply_fn(|ctx| async move {
///     Ok(format!("Hello {}! You said: {}", ctx.user.display(), ctx.prompt))
/// });
/// ```
pub fn reply_fn<F, Fut>(f: F) -> ReplyFn
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String>> + Send + 'static,
{
    ReplyFn {
        f: Box::new(move |ctx| f(ctx).boxed()),
    }
}

#[async_trait]
impl AgentHandler for ReplyFn {
    async fn on_message(&self, ctx: AgentContext) -> Result<AgentReply> {
        Ok(AgentReply::Text((self.f)(ctx).await?))
    }
}

/// Handler backed by a closure producing a chunk stream
pub struct StreamFn {
    f: Box<dyn Fn(AgentContext) -> ChunkStream + Send + Sync>,
}

/// Wrap a closure returning a chunk stream as a streaming handler.
///
/// The stream is drained in production order; the dispatcher emits one
/// `response-chunk` per item and a final envelope once it is exhausted.
pub fn stream_fn<F, S>(f: F) -> StreamFn
where
    F: Fn(AgentContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<String>> + Send + 'static,
{
    StreamFn {
        f: Box::new(move |ctx| f(ctx).boxed()),
    }
}

#[async_trait]
impl AgentHandler for StreamFn {
    async fn on_message(&self, ctx: AgentContext) -> Result<AgentReply> {
        Ok(AgentReply::Stream((self.f)(ctx)))
    }
}

// =============================================================================
// Tests
// =============================================================================
