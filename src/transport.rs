// ABOUTME: Transport abstraction over the websocket link to the gateway.
// ABOUTME: Provides the production tungstenite transport plus in-memory mocks for tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// One websocket frame, reduced to the two payload-bearing variants.
/// Control frames (ping, pong, close) are handled inside the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A connected, bidirectional frame pipe to the gateway.
///
/// `recv` returning `Ok(None)` means the peer closed the connection cleanly;
/// `Err` means the link failed. Either way the transport is dead and the
/// session must be torn down.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn recv(&mut self) -> Result<Option<Frame>>;
    async fn close(&mut self);
}

/// Factory producing fresh transports, one per connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector dialing a ws:// or wss:// gateway URL
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (stream, _response) = connect_async(&self.url)
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (sink, source) = stream.split();
        Ok(Box::new(WsTransport { sink, source }))
    }
}

/// Websocket transport over tokio-tungstenite
pub struct WsTransport {
    sink: SplitSink<WsStream, Message>,
    source: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.sink
            .send(message)
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            let message = match self.source.next().await {
                Some(result) => result.context("websocket receive failed")?,
                None => return Ok(None),
            };
            match message {
                Message::Text(text) => return Ok(Some(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => return Ok(Some(Frame::Binary(bytes.to_vec()))),
                Message::Close(_) => return Ok(None),
                // Protocol-level keepalives are answered by tungstenite
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// In-memory transport for tests, wired to a [`MockRemote`]
pub struct MockTransport {
    incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

/// Test-side handle to the other end of a [`MockTransport`].
///
/// Dropping it makes the transport's `recv` return `Ok(None)`, which looks
/// to the session like the gateway closing the connection.
pub struct MockRemote {
    pub to_client: mpsc::Sender<Frame>,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MockTransport {
    /// Create a connected transport/remote pair
    pub fn pair() -> (Self, MockRemote) {
        let (to_client, incoming) = mpsc::channel(64);
        let (outgoing, from_client) = mpsc::unbounded_channel();
        (
            Self { incoming, outgoing },
            MockRemote {
                to_client,
                from_client,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| anyhow::anyhow!("mock transport closed"))
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

/// Connector handing out pre-queued transports, one per connect call
#[derive(Clone, Default)]
pub struct MockConnector {
    transports: Arc<Mutex<VecDeque<Box<dyn Transport>>>>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport to be returned by the next connect call
    pub async fn push(&self, transport: Box<dyn Transport>) {
        self.transports.lock().await.push_back(transport);
    }

    /// Number of connect calls made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.transports
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("mock gateway unreachable"))
    }
}

// =============================================================================
// Tests
// =============================================================================
