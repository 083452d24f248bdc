// ABOUTME: Registry holding the single user-registered handler.
// ABOUTME: Runs best-effort lifecycle hooks around the client's connection loop.

use crate::handler::AgentHandler;
use std::sync::Arc;

/// Holds the one registered handler and invokes its lifecycle hooks.
///
/// Hook failures are logged and swallowed: a broken `on_start` must not
/// prevent connection attempts, and a broken `on_stop` must not mask the
/// reason the client exited.
#[derive(Clone)]
pub struct HandlerRegistry {
    handler: Arc<dyn AgentHandler>,
}

impl HandlerRegistry {
    /// Register a handler
    pub fn new(handler: impl AgentHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Register an already-shared handler
    pub fn from_arc(handler: Arc<dyn AgentHandler>) -> Self {
        Self { handler }
    }

    /// The registered handler
    pub fn handler(&self) -> Arc<dyn AgentHandler> {
        Arc::clone(&self.handler)
    }

    /// Run the startup hook, logging any failure
    pub async fn run_start_hook(&self) {
        if let Err(e) = self.handler.on_start().await {
            tracing::warn!(handler = %self.handler.name(), error = %e, "Startup hook failed");
        }
    }

    /// Run the shutdown hook, logging any failure
    pub async fn run_stop_hook(&self) {
        if let Err(e) = self.handler.on_stop().await {
            tracing::warn!(handler = %self.handler.name(), error = %e, "Shutdown hook failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
