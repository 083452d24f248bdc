// ABOUTME: In-memory mock gateway for exercising the client without a network.
// ABOUTME: Drives the envelope protocol from the gateway's side of a MockTransport.

use crate::envelope::{
    decode_frame, encode_frame, AuthRequestPayload, Envelope, EnvelopeKind, InvocationPayload,
};
use crate::transport::{Frame, MockRemote, MockTransport};
use anyhow::{Context, Result};
use perch_agent::{ChatInfo, UserInfo};
use uuid::Uuid;

/// Gateway-side test double speaking the envelope protocol.
///
/// Created joined to a [`MockTransport`] that is handed to the client under
/// test. Dropping the gateway reads to the client as the connection dropping.
pub struct MockGateway {
    remote: MockRemote,
}

impl MockGateway {
    /// Create a gateway and the client-side transport wired to it
    pub fn new() -> (Self, MockTransport) {
        let (transport, remote) = MockTransport::pair();
        (Self { remote }, transport)
    }

    /// Send a raw envelope to the client
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode_frame(envelope)?;
        self.remote
            .to_client
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("client side closed"))
    }

    /// Send a raw text frame, for malformed-input tests
    pub async fn send_raw(&self, text: &str) -> Result<()> {
        self.remote
            .to_client
            .send(Frame::Text(text.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("client side closed"))
    }

    /// Receive the next envelope of any kind from the client
    pub async fn recv_any(&mut self) -> Option<Envelope> {
        let frame = self.remote.from_client.recv().await?;
        decode_frame(&frame).ok()
    }

    /// Receive the next envelope, answering heartbeat pings along the way
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.recv_any().await?;
            match envelope.kind {
                EnvelopeKind::HeartbeatPing => {
                    // Keep the client's liveness check satisfied
                    let _ = self.send_envelope(&Envelope::heartbeat_pong()).await;
                }
                EnvelopeKind::HeartbeatPong => {}
                _ => return Some(envelope),
            }
        }
    }

    /// Read the client's auth request and return its payload
    pub async fn expect_auth(&mut self) -> Result<AuthRequestPayload> {
        let envelope = self
            .recv_any()
            .await
            .context("client closed before authenticating")?;
        if envelope.kind != EnvelopeKind::AuthRequest {
            anyhow::bail!("expected auth-request, got {}", envelope.kind);
        }
        serde_json::from_value(envelope.payload).context("malformed auth-request payload")
    }

    /// Consume the auth request and accept it
    pub async fn accept_auth(&mut self) -> Result<()> {
        self.expect_auth().await?;
        self.send_envelope(&Envelope::auth_ack(true, None)).await
    }

    /// Consume the auth request and reject it
    pub async fn reject_auth(&mut self, reason: &str) -> Result<()> {
        self.expect_auth().await?;
        self.send_envelope(&Envelope::auth_ack(false, Some(reason)))
            .await
    }

    /// Send an invocation with a fresh id and return the id
    pub async fn send_invocation(&self, chat_id: &str, prompt: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.send_invocation_with_id(&id, chat_id, prompt).await?;
        Ok(id)
    }

    /// Send an invocation with a caller-chosen id
    pub async fn send_invocation_with_id(
        &self,
        id: &str,
        chat_id: &str,
        prompt: &str,
    ) -> Result<()> {
        let payload = InvocationPayload {
            chat: ChatInfo {
                id: chat_id.to_string(),
                name: None,
                participants: Vec::new(),
            },
            user: UserInfo::new("user-1", "tester"),
            prompt: prompt.to_string(),
            history: Vec::new(),
            created_at: None,
        };
        self.send_envelope(&Envelope::invocation(id, &payload))
            .await
    }
}
