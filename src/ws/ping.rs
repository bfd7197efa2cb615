//! Ping/Pong keepalive
//!
//! Detects silently stalled connections: after every ping a pong must
//! arrive within `pong_timeout`, otherwise the connection is treated as
//! lost even though the socket never errored.
//!
//! Pure bookkeeping; the supervisor owns the timers and the socket.

use std::time::Duration;
use tokio::time::Instant;

/// Keepalive state for one live connection
#[derive(Debug, Clone)]
pub struct Keepalive {
    /// Pong timeout (how long to wait for pong response)
    pong_timeout: Duration,
    /// Outstanding ping, if any
    awaiting_since: Option<Instant>,
    /// Last time we received a pong
    last_pong_at: Option<Instant>,
    /// Pings sent on this connection
    pings_sent: u64,
}

impl Keepalive {
    /// Create keepalive with the given pong timeout
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            awaiting_since: None,
            last_pong_at: None,
            pings_sent: 0,
        }
    }

    /// Record a sent ping
    ///
    /// While a ping is outstanding later pings do not push the deadline out.
    pub fn ping_sent(&mut self, now: Instant) {
        self.pings_sent += 1;
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    /// Record a received pong
    #[inline]
    pub fn pong_received(&mut self, now: Instant) {
        self.awaiting_since = None;
        self.last_pong_at = Some(now);
    }

    /// Instant by which a pong must arrive (`None` when nothing is outstanding)
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.awaiting_since.map(|sent| sent + self.pong_timeout)
    }

    /// Last pong timestamp
    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    /// Pings sent so far
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive() -> Keepalive {
        Keepalive::new(Duration::from_secs(10))
    }

    #[test]
    fn test_keepalive_creation() {
        let ka = keepalive();
        assert_eq!(ka.deadline(), None);
        assert_eq!(ka.last_pong_at(), None);
    }

    #[test]
    fn test_deadline_after_ping() {
        let mut ka = keepalive();
        let now = Instant::now();

        ka.ping_sent(now);
        assert_eq!(ka.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_pong_clears_deadline() {
        let mut ka = keepalive();
        let now = Instant::now();

        ka.ping_sent(now);
        ka.pong_received(now + Duration::from_secs(1));

        assert_eq!(ka.deadline(), None);
        assert_eq!(ka.last_pong_at(), Some(now + Duration::from_secs(1)));

        // Next ping starts a fresh deadline
        ka.ping_sent(now + Duration::from_secs(30));
        assert_eq!(ka.deadline(), Some(now + Duration::from_secs(40)));
    }

    #[test]
    fn test_second_ping_keeps_first_deadline() {
        let mut ka = keepalive();
        let now = Instant::now();

        ka.ping_sent(now);
        ka.ping_sent(now + Duration::from_secs(5));

        assert_eq!(ka.deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(ka.pings_sent(), 2);
    }
}
