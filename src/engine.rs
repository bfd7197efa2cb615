//! Stream client engine
//!
//! Owns the state shared between caller threads and the connection
//! supervisor: the subscription registry and the command channel, kept
//! behind one lock so that caller commands, the reconnect replay and ack
//! handling always see one consistent view.
//!
//! [`StreamClient`] is the public lifecycle surface: `start`, `subscribe`,
//! `unsubscribe`, `stop`.

use crate::core::{Callback, Payload, SubscriptionId, SubscriptionRegistry, SubscriptionState};
use crate::hot_path::AckError;
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics::{MetricsSnapshot, StreamMetrics};
use crate::ws::command::{Command, CommandChannel, CommandKind, Expiry};
use crate::ws::connection::{Connector, WsConnector};
use crate::ws::supervisor::{ConnectionSupervisor, SupervisorState};
use crate::{Result, StreamError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Engine state shared by callers and the supervisor
pub type SharedState = Arc<Mutex<EngineState>>;

/// Registry and command channel under a single lock
///
/// Never held across an await point.
pub struct EngineState {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) commands: CommandChannel,
    /// Set once `stop` has begun
    closed: bool,
    /// Commands wait for server acknowledgement
    require_ack: bool,
}

impl EngineState {
    pub fn new(require_ack: bool) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            commands: CommandChannel::new(),
            closed: false,
            require_ack,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn require_ack(&self) -> bool {
        self.require_ack
    }

    /// Register a subscription and queue its SUBSCRIBE if a connection is live
    ///
    /// While disconnected the entry stays `Pending` and goes out with the
    /// next replay.
    pub fn subscribe(
        &mut self,
        id: SubscriptionId,
        streams: Vec<String>,
        callback: Callback,
    ) -> Result<()> {
        if self.closed {
            return Err(StreamError::ClientClosed);
        }
        self.registry.add(id, streams, callback)?;

        if self.commands.is_attached() {
            if let Some(streams) = self.registry.streams(id) {
                self.commands.enqueue(Command::subscribe(id, streams));
            }
        }
        Ok(())
    }

    /// Start removing a subscription
    ///
    /// Connected: marks it `Unsubscribing` and queues UNSUBSCRIBE; the entry
    /// is purged on ack (or right away without acks). Disconnected: purged
    /// immediately, nothing is sent.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        if self.closed {
            return Err(StreamError::ClientClosed);
        }
        match self.registry.state(id) {
            None => return Err(StreamError::UnknownSubscriptionId(id)),
            Some(SubscriptionState::Unsubscribing) => return Ok(()),
            Some(_) => {}
        }

        if !self.commands.is_attached() {
            self.registry.remove(id)?;
            self.commands.forget(id);
            return Ok(());
        }

        let streams = self.registry.begin_unsubscribe(id)?;
        self.commands.enqueue(Command::unsubscribe(id, streams));
        if !self.require_ack {
            self.registry.purge(id);
        }
        Ok(())
    }

    /// Open the command queue of a new connection and replay the registry into it
    ///
    /// Runs under the lock, so every caller command issued afterwards is
    /// queued behind the replay.
    pub fn attach(&mut self) -> (mpsc::UnboundedReceiver<Command>, usize) {
        let rx = self.commands.attach();
        let snapshot = self.registry.snapshot();
        let replayed = snapshot.len();
        for subscription in snapshot {
            self.commands
                .enqueue(Command::subscribe(subscription.id, subscription.streams));
        }
        (rx, replayed)
    }

    /// Connection gone: drop the queue and pending acks
    ///
    /// Subscriptions that were being removed are purged; the server forgot
    /// them along with the connection. Returns the purged ids.
    pub fn detach(&mut self) -> Vec<SubscriptionId> {
        self.commands.detach();
        self.registry.purge_unsubscribing()
    }

    /// Record a command the session just wrote to the wire
    pub fn on_sent(&mut self, command: Command, now: Instant) {
        if self.require_ack {
            self.commands.record_sent(command, now);
        } else if command.kind == CommandKind::Subscribe {
            self.registry.activate(command.id);
        }
    }

    /// Apply an acknowledgement
    ///
    /// Returns the acknowledged command kind and its outcome, or `None` if
    /// nothing was waiting for this id.
    pub fn acknowledge(
        &mut self,
        id: SubscriptionId,
        error: Option<AckError>,
    ) -> Option<(CommandKind, Result<()>)> {
        if !self.require_ack {
            return None;
        }
        let pending = self.commands.acknowledge(id)?;
        let kind = pending.command.kind;

        let outcome = match error {
            None => {
                match kind {
                    CommandKind::Subscribe => {
                        self.registry.activate(id);
                    }
                    CommandKind::Unsubscribe => {
                        self.registry.purge(id);
                    }
                }
                Ok(())
            }
            Some(error) => {
                self.roll_back(id, kind);
                Err(StreamError::CommandRejected {
                    id,
                    kind,
                    code: error.code,
                    message: error.msg,
                })
            }
        };
        Some((kind, outcome))
    }

    /// Check pending commands against the ack timeout
    ///
    /// Returns commands to resend and failures to report.
    pub fn expire(
        &mut self,
        now: Instant,
        timeout: Duration,
        max_retries: u32,
    ) -> (Vec<Command>, Vec<StreamError>) {
        let mut resend = Vec::new();
        let mut failures = Vec::new();

        for expiry in self.commands.expire(now, timeout, max_retries) {
            match expiry {
                Expiry::Retry(command) => {
                    // A resent SUBSCRIBE must not undo a later UNSUBSCRIBE,
                    // and an UNSUBSCRIBE is moot once the entry is gone
                    let state = self.registry.state(command.id);
                    let still_needed = match command.kind {
                        CommandKind::Subscribe => state.is_some_and(|state| state.is_wanted()),
                        CommandKind::Unsubscribe => state == Some(SubscriptionState::Unsubscribing),
                    };
                    if still_needed {
                        resend.push(command);
                    }
                }
                Expiry::Exhausted(pending) => {
                    let id = pending.command.id;
                    let kind = pending.command.kind;
                    self.roll_back(id, kind);
                    failures.push(StreamError::CommandTimeout {
                        id,
                        kind,
                        attempts: pending.attempts(),
                    });
                }
            }
        }

        (resend, failures)
    }

    /// Undo the local effect of a failed command
    ///
    /// A never-confirmed subscription is dropped so the caller can retry
    /// with the same id. That includes one already being removed: the
    /// server never had it, and the UNSUBSCRIBE in flight stays pending so
    /// its answer cannot match a later command reusing the id. A failed
    /// removal restores the subscription to what the server last confirmed.
    fn roll_back(&mut self, id: SubscriptionId, kind: CommandKind) {
        match kind {
            CommandKind::Subscribe => match self.registry.state(id) {
                Some(SubscriptionState::Pending) => {
                    self.registry.purge(id);
                    self.commands.forget(id);
                }
                Some(SubscriptionState::Unsubscribing) if !self.registry.is_confirmed(id) => {
                    self.registry.purge(id);
                }
                _ => {}
            },
            CommandKind::Unsubscribe => {
                if let Some(state) = self.registry.restore(id) {
                    tracing::debug!(id, state = ?state, "unsubscribe failed, subscription restored");
                }
            }
        }
    }

    /// Refuse further caller commands
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Final teardown: close and drop every subscription
    ///
    /// Returns the number of subscriptions removed.
    pub fn shutdown(&mut self) -> usize {
        self.closed = true;
        self.commands.detach();
        self.registry.clear()
    }
}

/// Client lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Supervisor entered a new state
    StateChanged(SupervisorState),
    /// Live connection dropped; reconnection follows
    ConnectionLost(String),
    /// Asynchronous failure (malformed frame, rejected or timed out command)
    Error(StreamError),
}

/// Parts consumed by `start`
struct Idle<C> {
    connector: C,
    status: watch::Sender<SupervisorState>,
}

/// Market data stream client
///
/// Multiple independent clients may live in one process. Must be started
/// from within a tokio runtime.
pub struct StreamClient<C: Connector = WsConnector> {
    config: StreamConfig,
    state: SharedState,
    metrics: Arc<StreamMetrics>,
    status: watch::Receiver<SupervisorState>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    idle: Mutex<Option<Idle<C>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Create a client that connects over tokio-tungstenite
    ///
    /// # Errors
    /// `StreamError::Config` if the configuration is invalid
    pub fn new(config: StreamConfig) -> Result<Self> {
        let connector = WsConnector::new(config.connect_timeout());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> StreamClient<C> {
    /// Create a client over a custom connector
    ///
    /// # Errors
    /// `StreamError::Config` if the configuration is invalid
    pub fn with_connector(config: StreamConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let (status_tx, status_rx) = watch::channel(SupervisorState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            state: Arc::new(Mutex::new(EngineState::new(config.require_ack))),
            metrics: Arc::new(StreamMetrics::new()),
            status: status_rx,
            events,
            cancel: CancellationToken::new(),
            idle: Mutex::new(Some(Idle {
                connector,
                status: status_tx,
            })),
            task: Mutex::new(None),
            config,
        })
    }

    /// Begin connecting
    ///
    /// Calling it again while running is a no-op.
    ///
    /// # Errors
    /// `ClientClosed` after `stop`
    pub fn start(&self) -> Result<()> {
        if self.state.lock().is_closed() {
            return Err(StreamError::ClientClosed);
        }
        let Some(idle) = self.idle.lock().take() else {
            return Ok(());
        };

        let supervisor = ConnectionSupervisor::new(
            idle.connector,
            self.config.clone(),
            self.state.clone(),
            self.metrics.clone(),
            idle.status,
            self.events.clone(),
            self.cancel.clone(),
        );
        *self.task.lock() = Some(tokio::spawn(supervisor.run()));

        tracing::info!(endpoint = %self.config.endpoint(), "stream client started");
        Ok(())
    }

    /// Subscribe `callback` to one or more streams under `id`
    ///
    /// Returns once the subscription is recorded locally; the server round
    /// trip happens in the background.
    ///
    /// # Errors
    /// - `DuplicateSubscriptionId` if `id` is in use
    /// - `InvalidRequest` if no stream name is given
    /// - `ClientClosed` after `stop`
    pub fn subscribe<I, S, F>(&self, id: SubscriptionId, streams: I, callback: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let streams: Vec<String> = streams.into_iter().map(Into::into).collect();
        self.state.lock().subscribe(id, streams, Arc::new(callback))?;
        tracing::debug!(id, "subscription added");
        Ok(())
    }

    /// Remove the subscription `id`
    ///
    /// # Errors
    /// - `UnknownSubscriptionId` if `id` is not registered
    /// - `ClientClosed` after `stop`
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.state.lock().unsubscribe(id)?;
        tracing::debug!(id, "subscription removal requested");
        Ok(())
    }

    /// Graceful shutdown
    ///
    /// Sends commands still queued, closes the connection, and drops all
    /// subscriptions.
    ///
    /// # Errors
    /// `ClientClosed` if already stopped
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(StreamError::ClientClosed);
            }
            state.mark_closed();
        }
        self.cancel.cancel();

        let task = self.task.lock().take();
        match task {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "supervisor task failed");
                }
            }
            None => {
                // Never started
                self.state.lock().shutdown();
                if let Some(idle) = self.idle.lock().take() {
                    idle.status.send_replace(SupervisorState::Closing);
                }
            }
        }

        tracing::info!("stream client stopped");
        Ok(())
    }

    /// Current supervisor state
    pub fn state(&self) -> SupervisorState {
        *self.status.borrow()
    }

    /// Watch supervisor state transitions
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.status.clone()
    }

    /// Receive lifecycle events and asynchronous errors
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// State of one subscription, `None` once removed
    pub fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.state.lock().registry.state(id)
    }

    /// Registered subscription ids, ascending
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.state.lock().registry.ids()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl<C: Connector> Drop for StreamClient<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
