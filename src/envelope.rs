// ABOUTME: Wire envelope types and frame codec for the gateway protocol.
// ABOUTME: Envelopes are JSON objects {type, id?, payload} carried in text frames.

use crate::transport::Frame;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use perch_agent::{ChatInfo, HistoryEntry, UserInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope kinds exchanged with the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Client → gateway: credentials, first envelope on every connection
    AuthRequest,
    /// Gateway → client: handshake verdict
    AuthAck,
    /// Liveness probe (either direction)
    HeartbeatPing,
    /// Liveness probe reply
    HeartbeatPong,
    /// Gateway → client: run the handler for one chat message
    Invocation,
    /// Client → gateway: one incremental piece of a streaming response
    ResponseChunk,
    /// Client → gateway: terminal envelope of a successful invocation
    ResponseFinal,
    /// Invocation failure (client → gateway), or auth rejection detail
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth-request",
            Self::AuthAck => "auth-ack",
            Self::HeartbeatPing => "heartbeat-ping",
            Self::HeartbeatPong => "heartbeat-pong",
            Self::Invocation => "invocation",
            Self::ResponseChunk => "response-chunk",
            Self::ResponseFinal => "response-final",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed, optionally-correlated unit of exchange with the gateway.
///
/// `id` correlates request/response pairs: required for `invocation` and
/// everything sent back for it, absent for heartbeats and auth envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Payload of `auth-request`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequestPayload {
    pub agent_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// Payload of `auth-ack`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthAckPayload {
    /// Missing field means accepted, so a bare ack is a success
    #[serde(default = "default_accepted")]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_accepted() -> bool {
    true
}

/// Payload of `heartbeat-ping` / `heartbeat-pong`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub timestamp_ms: i64,
}

/// Payload of `invocation`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationPayload {
    pub chat: ChatInfo,
    pub user: UserInfo,
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Payload of `response-chunk`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub text: String,
}

/// Payload of `response-final`.
///
/// For streaming replies `text` carries the full concatenated response so
/// consumers that ignore chunks still see the complete answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalPayload {
    pub text: String,
}

/// Payload of `error`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

impl Envelope {
    fn with_payload<T: Serialize>(kind: EnvelopeKind, id: Option<String>, payload: &T) -> Self {
        Self {
            kind,
            id,
            // Serializing these plain structs cannot fail
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn auth_request(agent_key: &str, agent_name: Option<&str>) -> Self {
        Self::with_payload(
            EnvelopeKind::AuthRequest,
            None,
            &AuthRequestPayload {
                agent_key: agent_key.to_string(),
                agent_name: agent_name.map(str::to_string),
            },
        )
    }

    pub fn auth_ack(accepted: bool, reason: Option<&str>) -> Self {
        Self::with_payload(
            EnvelopeKind::AuthAck,
            None,
            &AuthAckPayload {
                accepted,
                agent_id: None,
                reason: reason.map(str::to_string),
            },
        )
    }

    pub fn heartbeat_ping() -> Self {
        Self::with_payload(
            EnvelopeKind::HeartbeatPing,
            None,
            &HeartbeatPayload {
                timestamp_ms: Utc::now().timestamp_millis(),
            },
        )
    }

    pub fn heartbeat_pong() -> Self {
        Self::with_payload(
            EnvelopeKind::HeartbeatPong,
            None,
            &HeartbeatPayload {
                timestamp_ms: Utc::now().timestamp_millis(),
            },
        )
    }

    pub fn invocation(id: &str, payload: &InvocationPayload) -> Self {
        Self::with_payload(EnvelopeKind::Invocation, Some(id.to_string()), payload)
    }

    pub fn chunk(id: &str, text: &str) -> Self {
        Self::with_payload(
            EnvelopeKind::ResponseChunk,
            Some(id.to_string()),
            &ChunkPayload {
                text: text.to_string(),
            },
        )
    }

    pub fn final_reply(id: &str, text: &str) -> Self {
        Self::with_payload(
            EnvelopeKind::ResponseFinal,
            Some(id.to_string()),
            &FinalPayload {
                text: text.to_string(),
            },
        )
    }

    pub fn error(id: &str, message: &str) -> Self {
        Self::with_payload(
            EnvelopeKind::Error,
            Some(id.to_string()),
            &ErrorPayload {
                message: message.to_string(),
            },
        )
    }

    /// Deserialize the payload as an auth-ack
    pub fn auth_ack_payload(&self) -> Result<AuthAckPayload> {
        serde_json::from_value(self.payload.clone()).context("malformed auth-ack payload")
    }

    /// Deserialize the payload as an invocation
    pub fn invocation_payload(&self) -> Result<InvocationPayload> {
        serde_json::from_value(self.payload.clone()).context("malformed invocation payload")
    }

    /// Deserialize the payload as a chunk
    pub fn chunk_payload(&self) -> Result<ChunkPayload> {
        serde_json::from_value(self.payload.clone()).context("malformed response-chunk payload")
    }

    /// Deserialize the payload as a final reply
    pub fn final_payload(&self) -> Result<FinalPayload> {
        serde_json::from_value(self.payload.clone()).context("malformed response-final payload")
    }

    /// Deserialize the payload as an error
    pub fn error_payload(&self) -> Result<ErrorPayload> {
        serde_json::from_value(self.payload.clone()).context("malformed error payload")
    }
}

/// Decode a transport frame into an envelope.
///
/// Binary frames are accepted as UTF-8 JSON, matching gateways that switch
/// to binary frames for large payloads.
pub fn decode_frame(frame: &Frame) -> Result<Envelope> {
    match frame {
        Frame::Text(text) => serde_json::from_str(text).context("failed to parse envelope"),
        Frame::Binary(bytes) => {
            let text = std::str::from_utf8(bytes).context("invalid utf-8 envelope")?;
            serde_json::from_str(text).context("failed to parse envelope")
        }
    }
}

/// Encode an envelope into a text frame
pub fn encode_frame(envelope: &Envelope) -> Result<Frame> {
    Ok(Frame::Text(
        serde_json::to_string(envelope).context("failed to encode envelope")?,
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_uses_kebab_case_on_wire() {
        let env = Envelope::auth_request("key-123", Some("demo"));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"auth-request\""));
        assert!(json.contains("\"agent_key\":\"key-123\""));
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::chunk("inv-1", "partial");
        let frame = encode_frame(&env).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.chunk_payload().unwrap().text, "partial");
    }

    #[test]
    fn test_decode_binary_frame() {
        let env = Envelope::final_reply("inv-2", "done");
        let Frame::Text(text) = encode_frame(&env).unwrap() else {
            panic!("expected text frame");
        };
        let decoded = decode_frame(&Frame::Binary(text.into_bytes())).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::ResponseFinal);
        assert_eq!(decoded.id.as_deref(), Some("inv-2"));
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(decode_frame(&Frame::Text("{not json".to_string())).is_err());
        assert!(decode_frame(&Frame::Binary(vec![0xff, 0xfe])).is_err());
    }

    #[test]
    fn test_unknown_kind_is_error() {
        let result = decode_frame(&Frame::Text(
            r#"{"type":"unknown-kind","payload":{}}"#.to_string(),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_bare_auth_ack_is_accepted() {
        let env = decode_frame(&Frame::Text(r#"{"type":"auth-ack"}"#.to_string())).unwrap();
        let ack = env.auth_ack_payload().unwrap();
        assert!(ack.accepted);
    }

    #[test]
    fn test_rejected_auth_ack() {
        let env = decode_frame(&Frame::Text(
            r#"{"type":"auth-ack","payload":{"accepted":false,"reason":"bad key"}}"#.to_string(),
        ))
        .unwrap();
        let ack = env.auth_ack_payload().unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.reason.as_deref(), Some("bad key"));
    }

    #[test]
    fn test_invocation_payload_defaults() {
        let env = decode_frame(&Frame::Text(
            r#"{"type":"invocation","id":"inv-3","payload":{
                "chat":{"id":"chat-1"},
                "user":{"id":"u1","username":"harper"},
                "prompt":"ping"}}"#
                .to_string(),
        ))
        .unwrap();
        let payload = env.invocation_payload().unwrap();
        assert_eq!(payload.prompt, "ping");
        assert!(payload.history.is_empty());
        assert!(payload.created_at.is_none());
    }
}
