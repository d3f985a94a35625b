//! The wire-level abstraction a [`crate::connection::Connection`] actor
//! drives.
//!
//! Grounded in `bevy_simplenet`'s use of `async_trait` to hide a concrete
//! socket implementation behind a small capability trait; here the seam lets
//! connection-state-machine tests run against [`MockTransport`] instead of a
//! live `tokio-tungstenite` socket, per `SPEC_FULL.md` §2.4.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::error::GatewayError;

/// How a [`crate::connection::Connection`] actor opens its transport for one
/// connect attempt. Defaults to [`default_ws_factory`]; swapped for a
/// [`MockTransport`]-producing factory in tests so the state machine runs
/// without a live socket (`SPEC_FULL.md` §2.4).
pub type TransportFactory = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, GatewayError>> + Send>>
        + Send
        + Sync,
>;

/// The production factory: open a real `ws://`/`wss://` socket via
/// [`WsTransport::connect`].
pub fn default_ws_factory() -> TransportFactory {
    Arc::new(|url: String| Box::pin(async move { Ok(Box::new(WsTransport::connect(&url).await?) as Box<dyn Transport>) }))
}

/// One inbound event from the transport: a text frame, or a close with its
/// code (`None` if the peer gave none — treated as an unclean close per
/// `spec.md` §6).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Text(String),
    Closed(Option<u16>),
}

/// A full-duplex message stream. One instance backs exactly one
/// [`crate::connection::Connection`] for the lifetime of a single underlying
/// socket — a reconnect creates a fresh `Transport`, it never reopens itself.
#[async_trait]
pub trait Transport: Send {
    /// Send one UTF-8 JSON frame.
    async fn send(&mut self, text: String) -> Result<(), GatewayError>;

    /// Wait for the next inbound event. `None` means the stream ended
    /// without an explicit close frame (treated like an unclean close).
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Close the stream, if still open. Idempotent.
    async fn close(&mut self);
}

/// Real transport: a `ws://`/`wss://` connection via `tokio-tungstenite`,
/// matching `trailsd-trails/client-rust`'s `ws_task`'s use of
/// `tokio_tungstenite::connect_async`.
pub struct WsTransport {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| GatewayError::StreamError(e.to_string()))?;
        Ok(Self { inner: stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::StreamError(e.to_string()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Some(TransportEvent::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    return Some(TransportEvent::Closed(code));
                }
                Some(Ok(_)) => continue, // ping/pong/binary — transport-level, not protocol
                Some(Err(_)) => return Some(TransportEvent::Closed(None)),
                None => return Some(TransportEvent::Closed(None)),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self
            .inner
            .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: CloseCode::Normal,
                reason: "client closed".into(),
            }))
            .await;
    }
}

/// In-memory stand-in for [`WsTransport`], grounded in the same
/// `async_trait` seam, backed by `tokio::sync::mpsc` channels rather than a
/// socket — used by unit and `tests/` integration tests to drive a
/// [`crate::connection::Connection`] deterministically.
///
/// A [`MockTransport`] and its [`MockTransportHandle`] are created together
/// by [`MockTransport::pair`]; the handle lets a test act as the "server"
/// side, feeding frames in and observing frames sent out.
pub struct MockTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: mpsc::UnboundedReceiver<TransportEvent>,
    closed: bool,
}

pub struct MockTransportHandle {
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    pub inbound_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn pair() -> (Self, MockTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self { outbound_tx, inbound_rx, closed: false },
            MockTransportHandle { outbound_rx, inbound_tx },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::StreamError("transport closed".into()));
        }
        self.outbound_tx
            .send(text)
            .map_err(|_| GatewayError::StreamError("mock transport receiver dropped".into()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        self.inbound_rx.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

impl MockTransportHandle {
    /// Feed a raw text frame as if the server had sent it.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound_tx.send(TransportEvent::Text(text.into()));
    }

    /// Feed a structured JSON frame as if the server had sent it.
    pub fn send_json(&self, value: serde_json::Value) {
        self.send_text(value.to_string());
    }

    /// Simulate the server closing the stream with the given code.
    pub fn close_with_code(&self, code: Option<u16>) {
        let _ = self.inbound_tx.send(TransportEvent::Closed(code));
    }

    /// Drain the next frame the [`Connection`](crate::connection::Connection)
    /// sent, parsed as JSON, with a short deadline so a test never hangs on a
    /// frame that never comes.
    pub async fn next_sent_json(&mut self) -> Option<serde_json::Value> {
        let text = tokio::time::timeout(std::time::Duration::from_secs(1), self.outbound_rx.recv())
            .await
            .ok()
            .flatten()?;
        serde_json::from_str(&text).ok()
    }
}
