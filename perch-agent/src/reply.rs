// ABOUTME: Reply types produced by agent handlers.
// ABOUTME: A reply is either one final text or a finite ordered stream of chunks.

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;

/// Finite, ordered, pull-based stream of response chunks.
///
/// Not restartable: once the dispatcher has drained it, the invocation is
/// complete. An `Err` item aborts the stream and is reported to the gateway
/// as an error envelope.
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Output of one handler call.
///
/// Which variant a handler produces is fixed at registration time by the
/// adapter it was registered through (`reply_fn` vs `stream_fn`); the
/// dispatcher never inspects handler types at runtime.
pub enum AgentReply {
    /// Single-shot response, sent as one `response-final` envelope
    Text(String),
    /// Incremental response, sent as `response-chunk` envelopes followed by
    /// one `response-final` carrying the full concatenated text
    Stream(ChunkStream),
}

impl AgentReply {
    /// Build a single-shot text reply
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Build a streaming reply from any chunk stream
    pub fn stream<S>(chunks: S) -> Self
    where
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        Self::Stream(chunks.boxed())
    }

    /// Build a streaming reply from pre-computed chunks (mostly for tests)
    pub fn chunks<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<String>,
    {
        Self::Stream(stream::iter(chunks.into_iter().map(|c| Ok(c.into()))).boxed())
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl fmt::Debug for AgentReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<String> for AgentReply {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for AgentReply {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_yields_in_order() {
        let AgentReply::Stream(mut s) = AgentReply::chunks(["a", "b", "c"]) else {
            panic!("expected streaming reply");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = s.next().await {
            collected.push(chunk.unwrap());
        }
        assert_eq!(collected, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_text_is_not_streaming() {
        assert!(!AgentReply::text("pong").is_streaming());
        assert!(AgentReply::chunks(["a"]).is_streaming());
    }

    #[test]
    fn test_from_str() {
        match AgentReply::from("hi") {
            AgentReply::Text(t) => assert_eq!(t, "hi"),
            other => panic!("expected Text, got {:?}", other),
        }
    }
}
