//! WebSocket connection
//!
//! One physical duplex link to the stream server: connect, send, receive,
//! close. Knows nothing about subscriptions.
//!
//! The supervisor is generic over [`Connector`] so tests can inject
//! failures without a network; [`WsConnector`] is the tokio-tungstenite
//! implementation used in production.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};

/// Errors that can occur with WebSocket connections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Inbound frame, transport-neutral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// Live duplex link
///
/// `recv` must be cancel-safe: the supervisor polls it inside `select!`
/// alongside timers and the outbound command queue.
pub trait Transport: Send + 'static {
    /// Send a text frame
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<()>> + Send;

    /// Send a protocol ping
    fn send_ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Receive next frame, `Ok(None)` on graceful close
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>>> + Send;

    /// Close the link
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Factory for live links
pub trait Connector: Send + Sync + 'static {
    type Conn: Transport;

    /// Open a new link to `url`
    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and ready
    Connected,
    /// Disconnected
    Disconnected,
}

/// WebSocket connection over tokio-tungstenite
pub struct WebSocketConnection {
    /// Underlying WebSocket stream
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Connection state
    state: ConnectionState,
}

impl WebSocketConnection {
    /// Connect to WebSocket endpoint
    ///
    /// # Arguments
    /// * `url` - WebSocket URL (wss:// or ws://)
    /// * `connect_timeout` - Upper bound for TCP + TLS + upgrade
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| WebSocketError::Timeout)?
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;

        if let MaybeTlsStream::Plain(ref tcp) = ws_stream.get_ref() {
            Self::optimize_tcp_stream(tcp)?;
        }

        Ok(Self {
            stream: ws_stream,
            state: ConnectionState::Connected,
        })
    }

    /// Disable Nagle's algorithm - send packets immediately
    fn optimize_tcp_stream(stream: &TcpStream) -> Result<()> {
        stream
            .set_nodelay(true)
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))
    }

    /// Send a message
    async fn send(&mut self, msg: Message) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(WebSocketError::NotConnected);
        }

        self.stream
            .send(msg)
            .await
            .map_err(|e| WebSocketError::SendFailed(e.to_string()))
    }

    /// Receive a frame, skipping raw protocol fragments
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.state != ConnectionState::Connected {
            return Err(WebSocketError::NotConnected);
        }

        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(WebSocketError::ReceiveFailed(e.to_string())),
                None => {
                    self.state = ConnectionState::Disconnected;
                    return Ok(None);
                }
            };

            let frame = match msg {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(data) => Frame::Binary(data.to_vec()),
                // tungstenite queues the pong reply itself
                Message::Ping(_) => Frame::Ping,
                Message::Pong(_) => Frame::Pong,
                Message::Close(_) => {
                    self.state = ConnectionState::Disconnected;
                    Frame::Close
                }
                Message::Frame(_) => continue,
            };
            return Ok(Some(frame));
        }
    }
}

impl Transport for WebSocketConnection {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Message::text(text.to_owned())).await
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.send(Message::Ping(Bytes::new())).await
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        self.next_frame().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            self.stream
                .close(None)
                .await
                .map_err(|e| WebSocketError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// Production connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    type Conn = WebSocketConnection;

    async fn connect(&self, url: &str) -> Result<WebSocketConnection> {
        WebSocketConnection::connect(url, self.connect_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_error_display() {
        assert_eq!(WebSocketError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            WebSocketError::ConnectionFailed("refused".into()).to_string(),
            "Connection failed: refused"
        );
    }

    #[test]
    fn test_connector_default_timeout() {
        let connector = WsConnector::default();
        assert_eq!(connector.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on port 1
        let result = WebSocketConnection::connect("ws://127.0.0.1:1/ws", Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(WebSocketError::ConnectionFailed(_)) | Err(WebSocketError::Timeout)
        ));
    }
}

// Read Path Checklist:
// ✓ recv is cancel-safe (StreamExt::next)
// ✓ No logging in send/recv
// ✓ TCP_NODELAY enabled
// ✓ Close frames surface as Frame::Close, never as errors
