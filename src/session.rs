// ABOUTME: Single-connection session: auth handshake, heartbeat liveness, frame pump.
// ABOUTME: One run_session call owns one transport from handshake to teardown.

use crate::envelope::{decode_frame, encode_frame, Envelope, EnvelopeKind};
use crate::transport::Transport;
use anyhow::Result;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Timing knobs for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the auth-ack before giving up
    pub auth_timeout: Duration,
    /// Interval between heartbeat pings once ready
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is declared dead
    pub grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
        }
    }
}

/// Credentials presented in the auth handshake
#[derive(Debug, Clone)]
pub struct Credentials {
    pub agent_key: String,
    pub agent_name: Option<String>,
}

impl Credentials {
    pub fn new(agent_key: impl Into<String>, agent_name: Option<String>) -> Self {
        Self {
            agent_key: agent_key.into(),
            agent_name,
        }
    }

    /// Reject obviously unusable credentials before dialing
    pub fn validate(&self) -> Result<()> {
        if self.agent_key.trim().is_empty() {
            anyhow::bail!("agent key must not be empty");
        }
        Ok(())
    }
}

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
///
/// Fatal causes stop the reconnect loop; everything else is retried
/// with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Connection failed or dropped
    Transport(String),
    /// Gateway refused the credentials
    AuthRejected(String),
    /// No auth-ack arrived within the auth timeout
    AuthTimeout,
    /// No traffic from the gateway within the grace period
    HeartbeatTimeout,
    /// Local shutdown was requested
    Requested,
}

impl DisconnectCause {
    /// Fatal causes must not trigger a reconnect attempt
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::Requested)
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport failure: {}", detail),
            Self::AuthRejected(reason) => write!(f, "authentication rejected: {}", reason),
            Self::AuthTimeout => f.write_str("authentication timed out"),
            Self::HeartbeatTimeout => f.write_str("heartbeat grace period expired"),
            Self::Requested => f.write_str("shutdown requested"),
        }
    }
}

impl std::error::Error for DisconnectCause {}

/// What one session run produced
#[derive(Debug)]
pub struct SessionOutcome {
    /// Whether the handshake completed and the session served traffic
    pub reached_ready: bool,
    pub cause: DisconnectCause,
}

/// Cloneable handle for sending envelopes through the live session.
///
/// Sends fail unless the session is in the ready state, so responses for
/// invocations that outlived their connection are discarded at this seam.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Envelope>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<Envelope>, state: watch::Receiver<SessionState>) -> Self {
        Self { outbound, state }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Queue an envelope for the session writer. Fails when the session
    /// is not ready or has already been torn down.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.state() != SessionState::Ready {
            anyhow::bail!("session not ready");
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("session closed"))
    }
}

/// Drive one connection from handshake to teardown.
///
/// The session task is the transport's only writer; heartbeats, handler
/// responses, and pong replies all funnel through it, so frame writes are
/// never interleaved.
pub async fn run_session(
    mut transport: Box<dyn Transport>,
    credentials: &Credentials,
    cfg: &SessionConfig,
    inbound_tx: &mpsc::Sender<Envelope>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    state_tx: &watch::Sender<SessionState>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    let _ = state_tx.send(SessionState::Authenticating);

    if let Err(cause) = authenticate(transport.as_mut(), credentials, cfg, shutdown_rx).await {
        let _ = state_tx.send(SessionState::Closing);
        transport.close().await;
        let _ = state_tx.send(SessionState::Disconnected);
        return SessionOutcome {
            reached_ready: false,
            cause,
        };
    }

    let _ = state_tx.send(SessionState::Ready);
    info!("Session ready");

    let cause = ready_loop(transport.as_mut(), cfg, inbound_tx, outbound_rx, shutdown_rx).await;

    let _ = state_tx.send(SessionState::Closing);
    transport.close().await;
    let _ = state_tx.send(SessionState::Disconnected);
    info!(cause = %cause, "Session ended");

    SessionOutcome {
        reached_ready: true,
        cause,
    }
}

/// Run the auth handshake: send credentials, wait for the verdict
async fn authenticate(
    transport: &mut dyn Transport,
    credentials: &Credentials,
    cfg: &SessionConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> std::result::Result<(), DisconnectCause> {
    let request = Envelope::auth_request(&credentials.agent_key, credentials.agent_name.as_deref());
    write_envelope(transport, &request).await?;
    debug!("Sent auth request");

    let deadline = sleep(cfg.auth_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(timeout_secs = cfg.auth_timeout.as_secs(), "Auth ack did not arrive in time");
                return Err(DisconnectCause::AuthTimeout);
            }
            // wait_for inspects the current value, so a shutdown signaled
            // before this receiver was cloned is still observed
            // the async block drops the watch guard so the future stays Send
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                return Err(DisconnectCause::Requested);
            }
            received = transport.recv() => {
                let frame = match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        return Err(DisconnectCause::Transport(
                            "connection closed during authentication".to_string(),
                        ));
                    }
                    Err(e) => return Err(DisconnectCause::Transport(e.to_string())),
                };
                let envelope = match decode_frame(&frame) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed frame during authentication");
                        continue;
                    }
                };
                match envelope.kind {
                    EnvelopeKind::AuthAck => {
                        let ack = match envelope.auth_ack_payload() {
                            Ok(ack) => ack,
                            Err(e) => {
                                warn!(error = %e, "Discarding malformed auth ack");
                                continue;
                            }
                        };
                        if ack.accepted {
                            debug!(agent_id = ?ack.agent_id, "Authentication accepted");
                            return Ok(());
                        }
                        let reason = ack.reason.unwrap_or_else(|| "no reason given".to_string());
                        return Err(DisconnectCause::AuthRejected(reason));
                    }
                    // An uncorrelated error during the handshake is the
                    // gateway refusing the connection
                    EnvelopeKind::Error if envelope.id.is_none() => {
                        let reason = envelope
                            .error_payload()
                            .map(|p| p.message)
                            .unwrap_or_else(|_| "no reason given".to_string());
                        return Err(DisconnectCause::AuthRejected(reason));
                    }
                    kind => {
                        warn!(kind = %kind, "Discarding envelope received before session is ready");
                    }
                }
            }
        }
    }
}

/// Serve traffic until the connection dies or shutdown is requested
async fn ready_loop(
    transport: &mut dyn Transport,
    cfg: &SessionConfig,
    inbound_tx: &mpsc::Sender<Envelope>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> DisconnectCause {
    let mut heartbeat = interval_at(Instant::now() + cfg.heartbeat_interval, cfg.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_frame = Instant::now();

    loop {
        let liveness_deadline = last_frame + cfg.grace;

        tokio::select! {
            // the async block drops the watch guard so the future stays Send
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                return DisconnectCause::Requested;
            }
            _ = sleep_until(liveness_deadline) => {
                warn!(grace_secs = cfg.grace.as_secs(), "No traffic from gateway within grace period");
                return DisconnectCause::HeartbeatTimeout;
            }
            _ = heartbeat.tick() => {
                if let Err(cause) = write_envelope(transport, &Envelope::heartbeat_ping()).await {
                    return cause;
                }
                trace!("Sent heartbeat ping");
            }
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    // Every sender dropped; the client is shutting down
                    return DisconnectCause::Requested;
                };
                if let Err(cause) = write_envelope(transport, &envelope).await {
                    return cause;
                }
            }
            received = transport.recv() => {
                let frame = match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        return DisconnectCause::Transport(
                            "connection closed by gateway".to_string(),
                        );
                    }
                    Err(e) => return DisconnectCause::Transport(e.to_string()),
                };
                last_frame = Instant::now();

                let envelope = match decode_frame(&frame) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed frame");
                        continue;
                    }
                };
                match envelope.kind {
                    EnvelopeKind::HeartbeatPing => {
                        if let Err(cause) = write_envelope(transport, &Envelope::heartbeat_pong()).await {
                            return cause;
                        }
                    }
                    EnvelopeKind::HeartbeatPong => {
                        trace!("Received heartbeat pong");
                    }
                    _ => {
                        if inbound_tx.send(envelope).await.is_err() {
                            warn!("Dispatcher gone; closing session");
                            return DisconnectCause::Requested;
                        }
                    }
                }
            }
        }
    }
}

async fn write_envelope(
    transport: &mut dyn Transport,
    envelope: &Envelope,
) -> std::result::Result<(), DisconnectCause> {
    let frame = encode_frame(envelope).map_err(|e| DisconnectCause::Transport(e.to_string()))?;
    transport
        .send(frame)
        .await
        .map_err(|e| DisconnectCause::Transport(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
