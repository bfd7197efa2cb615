//! Metrics collection for client monitoring
//!
//! Lock-free metrics counters using atomic operations.
//! Updated from the read loop, read via snapshots from any thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Stream client metrics
///
/// Thread-safe counters updated from hot path.
pub struct StreamMetrics {
    /// Text/binary frames received on any connection
    frames_received: AtomicU64,
    /// Frames classified as data events
    data_frames: AtomicU64,
    /// Frames classified as command acknowledgements
    acks: AtomicU64,
    /// Frames that failed to parse
    malformed_frames: AtomicU64,
    /// Data frames no active subscription wanted
    unrouted_frames: AtomicU64,
    /// Payloads queued to callbacks (one per target)
    deliveries: AtomicU64,
    /// Payloads dropped on a full delivery queue
    dropped_deliveries: AtomicU64,
    /// Successful connects after the first
    reconnects: AtomicU64,
    /// Live connection up
    connected: AtomicBool,
    /// Last frame timestamp (Unix millis)
    last_frame_time: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub data_frames: u64,
    pub acks: u64,
    pub malformed_frames: u64,
    pub unrouted_frames: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub frame_rate: f64, // frames per second
    pub uptime_seconds: u64,
}

impl StreamMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            data_frames: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            unrouted_frames: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            dropped_deliveries: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            last_frame_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an inbound frame
    #[inline]
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.update_last_frame_time();
    }

    #[inline]
    pub fn record_data(&self) {
        self.data_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unrouted(&self) {
        self.unrouted_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deliveries(&self, count: u64) {
        self.deliveries.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_deliveries(&self, count: u64) {
        self.dropped_deliveries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Set connection status
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Update last frame timestamp
    #[inline]
    fn update_last_frame_time(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_frame_time.store(now, Ordering::Relaxed);
    }

    /// Milliseconds since the last frame, capped at 10000ms
    pub fn idle_ms(&self) -> u64 {
        let last = self.last_frame_time.load(Ordering::Relaxed);
        if last == 0 {
            return 10000; // No frames yet
        }

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        now.saturating_sub(last).min(10000)
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let frames = self.frames_received.load(Ordering::Relaxed);

        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            frames as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            frames_received: frames,
            data_frames: self.data_frames.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unrouted_frames: self.unrouted_frames.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            frame_rate: rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}
