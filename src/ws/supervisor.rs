//! Connection supervisor
//!
//! Drives the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                      any state --stop--> Closing (terminal)
//! ```
//!
//! On every new connection the registry is replayed before any caller
//! command, keepalive pings detect stalled links, and failed connects back
//! off exponentially with jitter. Network failures never end the loop;
//! only cancellation does.

use crate::engine::{ClientEvent, SharedState};
use crate::hot_path::{Dispatcher, MessageRouter, Route};
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics::StreamMetrics;
use crate::ws::backoff::Backoff;
use crate::ws::command::Command;
use crate::ws::connection::{Connector, Frame, Transport, WebSocketError};
use crate::ws::ping::Keepalive;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// Not started
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Live connection, subscriptions replayed
    Connected,
    /// Connection lost or connect failed; waiting out the backoff
    Reconnecting,
    /// Stopped (terminal)
    Closing,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::Reconnecting => "reconnecting",
            SupervisorState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    /// Cancelled by `stop`
    Stopped,
    /// Link failed or went silent
    Lost(String),
}

/// Connection supervisor
///
/// Owns the live connection, the router and the dispatcher. Runs as one
/// tokio task until cancelled.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    config: StreamConfig,
    state: SharedState,
    router: MessageRouter,
    dispatcher: Dispatcher,
    backoff: Backoff,
    metrics: Arc<StreamMetrics>,
    status: watch::Sender<SupervisorState>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    /// Failed connects since the last success
    attempt: u32,
    /// Successful connects so far
    connections: u64,
    rng: StdRng,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(
        connector: C,
        config: StreamConfig,
        state: SharedState,
        metrics: Arc<StreamMetrics>,
        status: watch::Sender<SupervisorState>,
        events: broadcast::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            router: MessageRouter::new(config.mode, state.clone()),
            dispatcher: Dispatcher::new(metrics.clone(), config.delivery_queue_capacity),
            backoff: Backoff::new(config.backoff_base(), config.backoff_cap(), config.backoff_jitter),
            connector,
            config,
            state,
            metrics,
            status,
            events,
            cancel,
            attempt: 0,
            connections: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Run until cancelled
    pub async fn run(mut self) {
        let url = self.config.endpoint();

        loop {
            self.set_state(SupervisorState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&url) => result,
            };

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(attempt = self.attempt, error = %e, url = %url, "connect failed");
                    self.attempt = self.attempt.saturating_add(1);
                    if !self.wait_backoff().await {
                        break;
                    }
                    continue;
                }
            };

            self.attempt = 0;
            self.connections += 1;
            if self.connections > 1 {
                self.metrics.record_reconnect();
            }

            let (outbound, replayed) = self.state.lock().attach();
            crate::log_ws!(tracing::Level::INFO, url = %url, replayed, "connected");
            self.metrics.set_connected(true);
            self.set_state(SupervisorState::Connected);
            self.prune_workers();

            let end = self.session(&mut conn, outbound).await;

            self.metrics.set_connected(false);
            let purged = self.state.lock().detach();
            if !purged.is_empty() {
                tracing::debug!(?purged, "dropped subscriptions awaiting removal");
            }

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(reason) => {
                    crate::log_ws!(tracing::Level::WARN, reason = %reason, "connection lost");
                    self.emit(ClientEvent::ConnectionLost(reason));
                    if !self.wait_backoff().await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Closing);
        let removed = self.state.lock().shutdown();
        self.dispatcher.shutdown();
        self.metrics.set_connected(false);
        tracing::info!(removed, "supervisor stopped");
    }

    /// Serve one live connection until it fails or the client stops
    async fn session(
        &mut self,
        conn: &mut C::Conn,
        mut outbound: mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let ping_interval = self.config.ping_interval();
        let ack_timeout = self.config.ack_timeout();
        let max_retries = self.config.max_command_retries;
        let require_ack = self.state.lock().require_ack();

        let mut keepalive = Keepalive::new(self.config.pong_timeout());
        let start = Instant::now();

        let mut ping_tick = time::interval_at(start + ping_interval, ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ack_period = (ack_timeout / 4).max(Duration::from_millis(1));
        let mut ack_tick = time::interval_at(start + ack_period, ack_period);
        ack_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pong_deadline = keepalive.deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.drain(conn, &mut outbound).await;
                    if let Err(e) = conn.close().await {
                        tracing::debug!(error = %e, "close failed");
                    }
                    return SessionEnd::Stopped;
                }

                _ = expire_at(pong_deadline) => {
                    return SessionEnd::Lost(format!(
                        "no pong within {}ms",
                        self.config.pong_timeout_ms
                    ));
                }

                Some(command) = outbound.recv() => {
                    if let Err(e) = self.send_command(conn, command).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }

                _ = ping_tick.tick() => {
                    if let Err(e) = conn.send_ping().await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    keepalive.ping_sent(Instant::now());
                    tracing::trace!(pings = keepalive.pings_sent(), "ping sent");
                    self.prune_workers();
                }

                _ = ack_tick.tick(), if require_ack => {
                    let (resend, failures) =
                        self.state.lock().expire(Instant::now(), ack_timeout, max_retries);

                    for command in resend {
                        tracing::debug!(id = command.id, kind = %command.kind, "resending unacknowledged command");
                        if let Err(e) = conn.send_text(&command.to_wire()).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    for error in failures {
                        tracing::warn!(error = %error, "command failed");
                        self.emit(ClientEvent::Error(error));
                    }
                    self.prune_workers();
                }

                frame = conn.recv() => match frame {
                    Ok(Some(Frame::Text(text))) => self.handle_text(&text),
                    Ok(Some(Frame::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(text),
                        Err(e) => self.report_malformed(crate::StreamError::MalformedFrame(
                            format!("binary frame is not UTF-8: {}", e),
                        )),
                    },
                    Ok(Some(Frame::Pong)) => keepalive.pong_received(Instant::now()),
                    Ok(Some(Frame::Ping)) => {}
                    Ok(Some(Frame::Close)) | Ok(None) => {
                        return SessionEnd::Lost("closed by server".to_string());
                    }
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Write one queued command
    async fn send_command(
        &mut self,
        conn: &mut C::Conn,
        command: Command,
    ) -> std::result::Result<(), WebSocketError> {
        conn.send_text(&command.to_wire()).await?;
        tracing::debug!(id = command.id, kind = %command.kind, streams = ?&command.streams[..], "command sent");
        self.state.lock().on_sent(command, Instant::now());
        Ok(())
    }

    /// Flush commands queued before stop
    async fn drain(&mut self, conn: &mut C::Conn, outbound: &mut mpsc::UnboundedReceiver<Command>) {
        while let Ok(command) = outbound.try_recv() {
            if let Err(e) = self.send_command(conn, command).await {
                tracing::debug!(error = %e, "dropping queued commands on stop");
                break;
            }
        }
    }

    /// Route one text frame
    fn handle_text(&mut self, text: &str) {
        self.metrics.record_frame();

        match self.router.route(text) {
            Ok(Route::Deliver { targets, payload }) => {
                self.metrics.record_data();
                self.dispatcher.deliver(targets, payload);
            }
            Ok(Route::Dropped { stream }) => {
                self.metrics.record_data();
                self.metrics.record_unrouted();
                tracing::trace!(stream = ?stream, "no active subscription, frame dropped");
            }
            Ok(Route::Acknowledged { id, kind, outcome }) => {
                self.metrics.record_ack();
                match outcome {
                    Ok(()) => tracing::debug!(id, kind = %kind, "command acknowledged"),
                    Err(error) => {
                        tracing::warn!(error = %error, "command rejected");
                        self.emit(ClientEvent::Error(error));
                    }
                }
                self.prune_workers();
            }
            Ok(Route::UnmatchedAck(id)) => {
                self.metrics.record_ack();
                tracing::debug!(id = ?id, "acknowledgement without pending command");
            }
            Err(error) => self.report_malformed(error),
        }
    }

    fn report_malformed(&mut self, error: crate::StreamError) {
        self.metrics.record_malformed();
        tracing::warn!(error = %error, "dropping frame");
        self.emit(ClientEvent::Error(error));
    }

    /// Release delivery workers of removed subscriptions
    fn prune_workers(&mut self) {
        let live = self.state.lock().registry.live_keys();
        let released = self.dispatcher.retain(&live);
        if released > 0 {
            tracing::debug!(released, "delivery workers released");
        }
    }

    /// Sleep before the next connect attempt
    ///
    /// Returns `false` if cancelled while waiting.
    async fn wait_backoff(&mut self) -> bool {
        self.set_state(SupervisorState::Reconnecting);
        // First retry after a failure waits one base delay
        let delay = self.backoff.delay(self.attempt.saturating_sub(1), &mut self.rng);
        tracing::info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "state changed");
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Resolves at `deadline`, never when there is none
async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
