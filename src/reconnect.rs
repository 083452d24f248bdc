// ABOUTME: Exponential backoff reconnection for the gateway websocket.
// ABOUTME: Retries with 1s, 2s, 4s... up to 30s max delay, jittered, on session drop.

use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::session::{
    run_session, Credentials, DisconnectCause, SessionConfig, SessionHandle, SessionState,
};
use crate::transport::Connector;
use anyhow::Result;
use perch_agent::HandlerRegistry;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Backoff configuration for gateway reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Starting delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failure
    pub growth: f64,
    /// Random jitter fraction applied to each delay (0.2 = up to ±20%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth: 2.0,
            jitter: 0.2,
        }
    }
}

/// Tracks reconnection state with exponential backoff
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    /// Create a new backoff state with the given config
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            consecutive_failures: 0,
            current_delay,
        }
    }

    /// Record a successful connection (resets backoff)
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Record a failure and return the jittered delay before the next retry
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures += 1;

        let delay = self.jittered(self.current_delay);

        // Advance the base delay, capped at max_delay
        self.current_delay = std::cmp::min(
            self.current_delay.mul_f64(self.config.growth),
            self.config.max_delay,
        );

        delay
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let spread = self.config.jitter;
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        delay.mul_f64(factor)
    }

    /// Get the number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Get the base delay that would be used on the next failure
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

/// Drives connect / session / backoff cycles until shutdown or a fatal cause.
///
/// Each attempt gets fresh channels and a fresh dispatcher, so responses for
/// invocations from a dead session have nowhere to go and are discarded.
pub struct Reconnector {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    session_cfg: SessionConfig,
    dispatch_cfg: DispatchConfig,
    registry: HandlerRegistry,
    backoff: BackoffState,
    state_tx: watch::Sender<SessionState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Credentials,
        session_cfg: SessionConfig,
        dispatch_cfg: DispatchConfig,
        backoff_cfg: BackoffConfig,
        registry: HandlerRegistry,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            connector,
            credentials,
            session_cfg,
            dispatch_cfg,
            registry,
            backoff: BackoffState::new(backoff_cfg),
            state_tx,
            shutdown_rx,
        }
    }

    /// Observe the current session state
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown (Ok) or a fatal disconnect cause (Err)
    pub async fn run(&mut self) -> Result<(), DisconnectCause> {
        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            let _ = self.state_tx.send(SessionState::Connecting);
            info!(attempt = self.backoff.consecutive_failures() + 1, "Connecting to gateway");

            let mut shutdown_rx = self.shutdown_rx.clone();
            let connected = tokio::select! {
                // wait_for sees a signal that landed before the clone
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => return Ok(()),
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(transport) => {
                    let outcome = self.run_attempt(transport).await;
                    if outcome.reached_ready {
                        self.backoff.record_success();
                    }
                    match outcome.cause {
                        DisconnectCause::Requested => return Ok(()),
                        cause if cause.is_fatal() => {
                            warn!(cause = %cause, "Giving up: fatal disconnect");
                            return Err(cause);
                        }
                        cause => {
                            warn!(cause = %cause, "Session lost; will reconnect");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                }
            }

            let _ = self.state_tx.send(SessionState::Disconnected);
            let delay = self.backoff.record_failure();
            info!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wire up one session attempt: channels, dispatcher, and the session loop
    async fn run_attempt(
        &mut self,
        transport: Box<dyn crate::transport::Transport>,
    ) -> crate::session::SessionOutcome {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(256);

        let handle = SessionHandle::new(outbound_tx, self.state_tx.subscribe());
        let dispatcher = Dispatcher::new(self.registry.handler(), handle, &self.dispatch_cfg);
        let dispatch_task = tokio::spawn(dispatcher.run(inbound_rx));

        let mut shutdown_rx = self.shutdown_rx.clone();
        let outcome = run_session(
            transport,
            &self.credentials,
            &self.session_cfg,
            &inbound_tx,
            &mut outbound_rx,
            &self.state_tx,
            &mut shutdown_rx,
        )
        .await;

        // Dropping the inbound sender ends the dispatcher's intake; in-flight
        // invocations finish against a closed session and are discarded.
        drop(inbound_tx);
        let _ = dispatch_task.await;

        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================
