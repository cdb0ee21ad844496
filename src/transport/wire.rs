//! Raw duplex links between contexts.
//!
//! The bus never touches sockets directly; it speaks to a [`Wire`], an
//! ordered, framed text duplex. [`WsWire`] is the production rendering over
//! WebSocket; [`PairWire`] is an in-memory rendering for tests and
//! same-process contexts, so the whole transport stack runs without a host
//! platform.
//!
//! [`Connector`] establishes wires: the persistent channel holds one wire
//! for its lifetime, the one-shot path requests a fresh wire per call.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Wire
// ============================================================================

/// An ordered, framed text duplex between two contexts.
///
/// Frames are delivered in send order. `recv` returning `None` means the
/// peer closed cleanly; an `Err` frame means the link failed.
#[async_trait]
pub trait Wire: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receives the next text frame. `None` on clean close.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Closes the link.
    async fn close(&mut self);
}

// ============================================================================
// Connector
// ============================================================================

/// Establishes a [`Wire`] to a peer context.
///
/// The connection monitor uses one connector for the persistent channel;
/// the one-shot transport uses the same trait to open a fresh wire per call.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new wire.
    async fn connect(&self) -> Result<Box<dyn Wire>>;
}

// ============================================================================
// WsWire
// ============================================================================

/// WebSocket rendering of a [`Wire`].
///
/// Generic over the underlying stream so it covers both the client side
/// (possibly TLS) and the server's accepted plain TCP streams.
pub struct WsWire<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsWire<S> {
    /// Wraps an established WebSocket stream.
    #[inline]
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Wire for WsWire<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(Error::from)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(WsMessage::Close(_)) => {
                    debug!("WebSocket closed by remote");
                    return None;
                }
                // Ignore Binary, Ping, Pong, Frame
                Ok(_) => {}
                Err(e) => return Some(Err(Error::from(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ============================================================================
// WsConnector
// ============================================================================

/// Connects to a peer context's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Creates a connector for the given `ws://` or `wss://` endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the URL is malformed or uses a
    /// non-WebSocket scheme.
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())
            .map_err(|e| Error::protocol(format!("Invalid endpoint URL: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::protocol(format!(
                "Unsupported endpoint scheme: {other}"
            ))),
        }
    }

    /// Returns the endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Wire>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

        debug!(url = %self.url, "Wire established");

        let stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>> = stream;
        Ok(Box::new(WsWire::new(stream)))
    }
}

// ============================================================================
// PairWire
// ============================================================================

/// In-memory duplex for tests and same-process contexts.
///
/// [`pair`] creates two connected ends; frames sent on one end arrive on
/// the other in order. Dropping or closing an end ends the peer's stream.
pub struct PairWire {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Creates a connected pair of in-memory wires.
#[must_use]
pub fn pair() -> (PairWire, PairWire) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        PairWire {
            tx: Some(a_tx),
            rx: b_rx,
        },
        PairWire {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl Wire for PairWire {
    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(text).map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
