//! Connection liveness probing.
//!
//! A periodic timer checks for inbound activity; a silent interval sends
//! `PING NWPC<16-hex-random>` and arms a timeout for that cookie. A PONG
//! for a later cookie implicitly acknowledges all earlier ones.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

pub(crate) const PING_COOKIE_PREFIX: &str = "NWPC";

/// Outstanding-probe tracking for the dispatcher.
pub(crate) struct Pinger {
    timeout: Duration,
    activity: bool,
    outstanding: VecDeque<(String, Instant)>,
}

impl Pinger {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            activity: false,
            outstanding: VecDeque::new(),
        }
    }

    /// Record inbound traffic for the current interval.
    pub(crate) fn note_activity(&mut self) {
        self.activity = true;
    }

    /// Interval expiry: returns a cookie to send when the interval was
    /// silent, arming its timeout.
    pub(crate) fn on_tick(&mut self) -> Option<String> {
        if std::mem::take(&mut self.activity) {
            return None;
        }
        let cookie = format!("{}{:016x}", PING_COOKIE_PREFIX, rand::random::<u64>());
        self.outstanding
            .push_back((cookie.clone(), Instant::now() + self.timeout));
        Some(cookie)
    }

    /// A PONG arrived carrying `token`. Retires the matching probe and
    /// every probe armed before it. Returns whether anything matched.
    pub(crate) fn on_pong(&mut self, token: &str) -> bool {
        match self.outstanding.iter().position(|(c, _)| c == token) {
            Some(idx) => {
                self.outstanding.drain(..=idx);
                true
            }
            None => false,
        }
    }

    /// The deadline of the oldest outstanding probe.
    pub(crate) fn earliest_deadline(&self) -> Option<Instant> {
        self.outstanding.front().map(|(_, deadline)| *deadline)
    }

    /// Whether the oldest outstanding probe has expired.
    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.earliest_deadline().is_some_and(|d| d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinger() -> Pinger {
        Pinger::new(Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_suppresses_ping() {
        let mut p = pinger();
        p.note_activity();
        assert!(p.on_tick().is_none());
        // The flag is consumed; the next silent interval pings.
        assert!(p.on_tick().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookie_format() {
        let mut p = pinger();
        let cookie = p.on_tick().unwrap();
        assert!(cookie.starts_with(PING_COOKIE_PREFIX));
        assert_eq!(cookie.len(), PING_COOKIE_PREFIX.len() + 16);
        assert!(cookie[PING_COOKIE_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_pong_retires_earlier_probes() {
        let mut p = pinger();
        let c1 = p.on_tick().unwrap();
        let c2 = p.on_tick().unwrap();
        let c3 = p.on_tick().unwrap();

        assert!(p.on_pong(&c2));
        // c1 and c2 are gone; c3 is still armed.
        assert!(!p.on_pong(&c1));
        assert!(p.earliest_deadline().is_some());
        assert!(p.on_pong(&c3));
        assert!(p.earliest_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pong_ignored() {
        let mut p = pinger();
        let _ = p.on_tick().unwrap();
        assert!(!p.on_pong("NWPC0000000000000000"));
        assert!(p.earliest_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let mut p = pinger();
        let _ = p.on_tick().unwrap();
        assert!(!p.expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(p.expired(Instant::now()));
    }
}
