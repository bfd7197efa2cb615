//! Outbound command channel
//!
//! Single ordering point for SUBSCRIBE / UNSUBSCRIBE commands. Each live
//! connection gets a fresh FIFO queue; the reconnect replay and caller
//! commands are enqueued under the engine lock, so whatever lands after the
//! replay snapshot is sent after the replay.
//!
//! Also tracks commands awaiting acknowledgement. Acks carry the command id
//! (the subscription id), and a server answers in order, so pending
//! commands are kept FIFO per id.

use crate::core::{Streams, SubscriptionId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Command type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
}

impl CommandKind {
    /// Wire method name
    pub fn method(&self) -> &'static str {
        match self {
            CommandKind::Subscribe => "SUBSCRIBE",
            CommandKind::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: SubscriptionId,
    pub kind: CommandKind,
    pub streams: Streams,
}

impl Command {
    pub fn subscribe(id: SubscriptionId, streams: Streams) -> Self {
        Self {
            id,
            kind: CommandKind::Subscribe,
            streams,
        }
    }

    pub fn unsubscribe(id: SubscriptionId, streams: Streams) -> Self {
        Self {
            id,
            kind: CommandKind::Unsubscribe,
            streams,
        }
    }

    /// Encode as a wire frame
    ///
    /// `{"method":"SUBSCRIBE","params":["btcusdt@aggTrade"],"id":1}`
    pub fn to_wire(&self) -> String {
        serde_json::json!({
            "method": self.kind.method(),
            "params": &self.streams[..],
            "id": self.id,
        })
        .to_string()
    }
}

/// Command sent and awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: Command,
    pub sent_at: Instant,
    pub retry_count: u32,
}

impl PendingCommand {
    /// Total sends so far
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Outcome of an ack timeout check
#[derive(Debug, Clone)]
pub enum Expiry {
    /// Send again; the pending entry was re-armed
    Retry(Command),
    /// Retries exhausted; the pending entry was dropped
    Exhausted(PendingCommand),
}

/// Command channel
pub struct CommandChannel {
    /// Queue into the live connection's session, `None` while disconnected
    outbound: Option<mpsc::UnboundedSender<Command>>,
    /// Sent commands awaiting ack, FIFO per id
    pending: HashMap<SubscriptionId, VecDeque<PendingCommand>>,
}

impl CommandChannel {
    /// Create detached channel
    pub fn new() -> Self {
        Self {
            outbound: None,
            pending: HashMap::new(),
        }
    }

    /// Open a fresh queue for a new connection
    ///
    /// Pending acks from any previous connection are discarded.
    pub fn attach(&mut self) -> mpsc::UnboundedReceiver<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.pending.clear();
        rx
    }

    /// Close the queue after the connection is gone
    ///
    /// Returns the number of commands that were still awaiting ack.
    pub fn detach(&mut self) -> usize {
        self.outbound = None;
        let dropped = self.pending_count();
        self.pending.clear();
        dropped
    }

    /// Check if a connection is taking commands
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.outbound.is_some()
    }

    /// Queue a command for the live connection
    ///
    /// Returns `false` when detached; the registry replay covers it later.
    pub fn enqueue(&mut self, command: Command) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Start waiting for the ack of a command just written to the wire
    pub fn record_sent(&mut self, command: Command, now: Instant) {
        self.pending
            .entry(command.id)
            .or_default()
            .push_back(PendingCommand {
                command,
                sent_at: now,
                retry_count: 0,
            });
    }

    /// Match an ack to the oldest pending command with this id
    pub fn acknowledge(&mut self, id: SubscriptionId) -> Option<PendingCommand> {
        let queue = self.pending.get_mut(&id)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&id);
        }
        pending
    }

    /// Collect commands whose ack is overdue
    ///
    /// Commands below `max_retries` are re-armed and returned for resend;
    /// the rest are dropped and returned as exhausted.
    pub fn expire(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> Vec<Expiry> {
        let mut expired = Vec::new();

        for queue in self.pending.values_mut() {
            queue.retain_mut(|pending| {
                if now.saturating_duration_since(pending.sent_at) < timeout {
                    return true;
                }
                if pending.retry_count < max_retries {
                    pending.retry_count += 1;
                    pending.sent_at = now;
                    expired.push(Expiry::Retry(pending.command.clone()));
                    true
                } else {
                    expired.push(Expiry::Exhausted(pending.clone()));
                    false
                }
            });
        }
        self.pending.retain(|_, queue| !queue.is_empty());

        expired
    }

    /// Drop every pending command of one id
    pub fn forget(&mut self, id: SubscriptionId) -> usize {
        self.pending.remove(&id).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Check if any command for `id` awaits ack
    pub fn is_pending(&self, id: SubscriptionId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of commands awaiting ack
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}
