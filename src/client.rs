// ABOUTME: Top-level client tying config, transport, reconnection, and dispatch together.
// ABOUTME: run_agent() is the one-call entrypoint for simple agent binaries.

use crate::config::Config;
use crate::dispatch::DispatchConfig;
use crate::reconnect::{BackoffConfig, Reconnector};
use crate::session::{Credentials, SessionConfig};
use crate::transport::{Connector, WsConnector};
use anyhow::{Context, Result};
use perch_agent::{AgentHandler, HandlerRegistry};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Requests shutdown of a running [`AgentClient`].
///
/// Cloneable and usable from any task; the first call wins and later
/// calls are no-ops.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the client to disconnect and stop reconnecting
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Long-lived agent client.
///
/// Owns the handler, credentials, and tuning; `run` drives the
/// connect / serve / backoff cycle until shutdown or a fatal error
/// such as rejected credentials.
pub struct AgentClient {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    session_cfg: SessionConfig,
    dispatch_cfg: DispatchConfig,
    backoff_cfg: BackoffConfig,
    registry: HandlerRegistry,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AgentClient {
    /// Build a client from configuration and a handler.
    ///
    /// Fails fast on configuration that could never connect, so callers
    /// see credential mistakes at startup rather than as rejected
    /// handshakes later.
    pub fn new(config: &Config, handler: impl AgentHandler + 'static) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(WsConnector::new(config.gateway.url.clone()));
        Self::with_connector(config, connector, HandlerRegistry::new(handler))
    }

    /// Build a client on an explicit connector. Used by tests to swap in
    /// in-memory transports.
    pub fn with_connector(
        config: &Config,
        connector: Arc<dyn Connector>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        let credentials = config.credentials();
        credentials.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            connector,
            credentials,
            session_cfg: config.to_session_config(),
            dispatch_cfg: config.to_dispatch_config(),
            backoff_cfg: config.to_backoff_config(),
            registry,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Handle for requesting shutdown from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until shutdown is requested or a fatal disconnect occurs.
    ///
    /// Returns `Ok(())` on requested shutdown. Rejected credentials and
    /// other fatal causes surface as errors since retrying them cannot
    /// succeed.
    pub async fn run(self) -> Result<()> {
        self.registry.run_start_hook().await;

        let mut reconnector = Reconnector::new(
            self.connector,
            self.credentials,
            self.session_cfg,
            self.dispatch_cfg,
            self.backoff_cfg,
            self.registry.clone(),
            self.shutdown_rx,
        );
        let result = reconnector.run().await;

        self.registry.run_stop_hook().await;

        match result {
            Ok(()) => {
                info!("Client stopped");
                Ok(())
            }
            Err(cause) => Err(anyhow::Error::new(cause).context("client stopped with fatal error")),
        }
    }
}

/// Load configuration, wire up ctrl-c, and run the given handler until
/// interrupted. The simplest way to stand up an agent binary.
pub async fn run_agent(handler: impl AgentHandler + 'static) -> Result<()> {
    // A missing .env file is fine; explicit env vars still apply
    let _ = dotenvy::dotenv();

    let config = Config::load().context("failed to load configuration")?;
    let client = AgentClient::new(&config, handler)?;

    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    client.run().await
}

// =============================================================================
// Tests
// =============================================================================
