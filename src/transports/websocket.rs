//! WebSocket transport built on `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries rendezvous frames as WebSocket text
//! messages over `ws://` or `wss://`. [`WebSocketConnector`] is the
//! [`Connector`] the session uses to (re)open it.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), pairchat_client::PairChatError> {
//! use pairchat_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:8000/ws").await?;
//! transport.send(r#"{"type":"skip"}"#.to_string()).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::PairChatError;
use crate::transport::{Connector, Transport};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// Non-text frames are skipped; a close frame ends the stream.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) only awaits the next frame of the underlying
/// stream, so dropping it mid-flight loses nothing.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::Io`] if the URL is invalid or the server is
    /// unreachable. I/O error kinds are preserved; other failures map to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, PairChatError> {
        tracing::debug!(%url, "dialing rendezvous server");
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(dial_error)?;
        tracing::info!(%url, "rendezvous connection established");
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Like [`connect`](Self::connect), bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PairChatError::Timeout`] if the deadline elapses, or any
    /// error [`connect`](Self::connect) returns.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, PairChatError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| PairChatError::Timeout)?
    }
}

/// Keep the I/O error kind when there is one so callers can tell a refused
/// connection from a bad handshake.
fn dial_error(e: tokio_tungstenite::tungstenite::Error) -> PairChatError {
    let kind = match &e {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    PairChatError::Io(std::io::Error::new(kind, e))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), PairChatError> {
        if self.closed {
            return Err(PairChatError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| PairChatError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, PairChatError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(close)) => {
                    tracing::debug!(?close, "rendezvous server closed the socket");
                    return None;
                }
                Ok(Message::Binary(payload)) => {
                    tracing::warn!(len = payload.len(), "rendezvous frames are JSON text; ignoring binary");
                }
                // Control frames; tungstenite answers pings itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(PairChatError::TransportReceive(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), PairChatError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| PairChatError::TransportSend(e.to_string()))
    }
}

/// Opens a [`WebSocketTransport`] to a fixed URL.
///
/// ```
/// use pairchat_client::WebSocketConnector;
/// use std::time::Duration;
///
/// let connector = WebSocketConnector::new("ws://localhost:8000/ws")
///     .with_connect_timeout(Duration::from_secs(5));
/// assert_eq!(connector.url(), "ws://localhost:8000/ws");
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Option<Duration>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: None,
        }
    }

    /// Fail a connection attempt that takes longer than `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, PairChatError> {
        let transport = match self.connect_timeout {
            Some(timeout) => WebSocketTransport::connect_with_timeout(&self.url, timeout).await?,
            None => WebSocketTransport::connect(&self.url).await?,
        };
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one WebSocket connection on a loopback port, run `handler` on
    /// it, and return the URL to dial.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, PairChatError::Io(_)));
    }

    #[tokio::test]
    async fn connector_reports_unreachable_server() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, PairChatError::Io(_)));
    }

    #[tokio::test]
    async fn connector_honours_timeout() {
        // The kernel completes the TCP handshake but nobody answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = WebSocketConnector::new(format!("ws://{addr}"))
            .with_connect_timeout(Duration::from_millis(50));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, PairChatError::Timeout));
        drop(listener);
    }

    #[tokio::test]
    async fn recv_skips_binary_and_returns_text() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"remote-left"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let text = transport.recv().await.unwrap().unwrap();
        assert_eq!(text, r#"{"type":"remote-left"}"#);
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn frames_sent_reach_the_server() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let url = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = seen_tx.send(text.to_string());
            }
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let connector = WebSocketConnector::new(url);
        let mut transport = connector.connect().await.unwrap();
        transport.send(r#"{"type":"skip"}"#.to_string()).await.unwrap();
        assert_eq!(seen_rx.await.unwrap(), r#"{"type":"skip"}"#);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_is_rejected_and_close_is_idempotent() {
        let url = serve_once(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} }).await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, PairChatError::TransportClosed));
    }
}
