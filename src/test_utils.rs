//! Test utilities: in-memory connector and server handles
//!
//! `mock_connector()` returns a [`MockConnector`] for the client and a
//! [`MockHarness`] for the test. Every successful connect hands the test a
//! [`MockServer`] that reads what the client sent and pushes frames back.
//! Dropping a `MockServer` drops the connection.

use crate::engine::ClientEvent;
use crate::infrastructure::config::StreamConfig;
use crate::ws::connection::{Connector, Frame, Transport, WebSocketError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Upper bound for any single wait in tests
const WAIT: Duration = Duration::from_secs(10);

/// Client configuration for mock-driven tests
///
/// Zero jitter keeps backoff delays exact under a paused clock.
pub fn test_config() -> StreamConfig {
    StreamConfig {
        base_url: "ws://mock.local".to_string(),
        ping_interval_ms: 5_000,
        pong_timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        backoff_base_ms: 10,
        backoff_cap_ms: 200,
        backoff_jitter: 0.0,
        ack_timeout_ms: 2_000,
        max_command_retries: 1,
        ..StreamConfig::default()
    }
}

/// Frame written by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Ping,
    Close,
}

struct Shared {
    /// Connect attempts left to fail
    failures: AtomicUsize,
    /// Answer pings on new connections
    auto_pong: AtomicBool,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<MockServer>,
}

/// Client-side connector
pub struct MockConnector {
    shared: Arc<Shared>,
}

/// Test-side control of the connector
pub struct MockHarness {
    shared: Arc<Shared>,
    servers: mpsc::UnboundedReceiver<MockServer>,
}

/// Create a connected connector/harness pair
pub fn mock_connector() -> (MockConnector, MockHarness) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        failures: AtomicUsize::new(0),
        auto_pong: AtomicBool::new(true),
        attempts: AtomicUsize::new(0),
        servers: tx,
    });
    (
        MockConnector { shared: shared.clone() },
        MockHarness { shared, servers: rx },
    )
}

impl Connector for MockConnector {
    type Conn = MockTransport;

    async fn connect(&self, _url: &str) -> Result<MockTransport, WebSocketError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(WebSocketError::ConnectionFailed("injected failure".to_string()));
        }

        let (to_server, sent) = mpsc::unbounded_channel();
        let (inbound, from_server) = mpsc::unbounded_channel();
        self.shared
            .servers
            .send(MockServer { inbound, sent })
            .map_err(|_| WebSocketError::ConnectionFailed("harness dropped".to_string()))?;

        Ok(MockTransport {
            to_server,
            from_server,
            auto_pong: self.shared.auto_pong.load(Ordering::SeqCst),
            pong_due: false,
        })
    }
}

impl MockHarness {
    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }

    /// Answer pings on connections opened from now on
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the client's next successful connect
    pub async fn accept(&mut self) -> MockServer {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("no connection within timeout")
            .expect("connector dropped")
    }
}

/// Server end of one mock connection
pub struct MockServer {
    inbound: mpsc::UnboundedSender<Frame>,
    sent: mpsc::UnboundedReceiver<Sent>,
}

impl MockServer {
    /// Push a text frame to the client
    pub fn push_text(&self, text: &str) {
        self.push_frame(Frame::Text(text.to_string()));
    }

    pub fn push_frame(&self, frame: Frame) {
        let _ = self.inbound.send(frame);
    }

    /// Next frame the client wrote, `None` once the client side is gone
    pub async fn next_sent(&mut self) -> Option<Sent> {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("nothing sent within timeout")
    }

    /// Next text frame, skipping pings
    pub async fn next_text(&mut self) -> String {
        loop {
            match self.next_sent().await {
                Some(Sent::Text(text)) => return text,
                Some(Sent::Ping) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    /// Next text frame parsed as a JSON command
    pub async fn next_command(&mut self) -> serde_json::Value {
        let text = self.next_text().await;
        serde_json::from_str(&text).expect("command is not JSON")
    }

    /// Text frame already written, without waiting
    pub fn try_next_text(&mut self) -> Option<String> {
        while let Ok(sent) = self.sent.try_recv() {
            if let Sent::Text(text) = sent {
                return Some(text);
            }
        }
        None
    }

    /// Wait until the client closes; `true` on close frame or hang-up
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match self.next_sent().await {
                Some(Sent::Close) | None => return true,
                Some(_) => continue,
            }
        }
    }
}

/// Client end of one mock connection
pub struct MockTransport {
    to_server: mpsc::UnboundedSender<Sent>,
    from_server: mpsc::UnboundedReceiver<Frame>,
    auto_pong: bool,
    pong_due: bool,
}

impl MockTransport {
    fn send(&self, sent: Sent) -> Result<(), WebSocketError> {
        self.to_server
            .send(sent)
            .map_err(|_| WebSocketError::SendFailed("peer gone".to_string()))
    }
}

impl Transport for MockTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), WebSocketError> {
        self.send(Sent::Text(text.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), WebSocketError> {
        self.send(Sent::Ping)?;
        if self.auto_pong {
            self.pong_due = true;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, WebSocketError> {
        if self.pong_due {
            self.pong_due = false;
            return Ok(Some(Frame::Pong));
        }
        Ok(self.from_server.recv().await)
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        let _ = self.to_server.send(Sent::Close);
        Ok(())
    }
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("event not seen within timeout")
}

/// Poll `cond` until it holds
pub async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool,
{
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("condition not met within timeout")
}
