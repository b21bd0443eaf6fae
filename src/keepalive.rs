use std::time::Duration;
use tokio::time::Instant;

/// Device drops an idle control connection after this long
pub const DEVICE_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Keep-alive schedule for one connection.
///
/// Runs only while the link is ready; consecutive misses past the limit
/// mean the link is dead.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    max_misses: u32,
    next_due: Option<Instant>,
    misses: u32,
}

impl KeepAlive {
    pub(crate) fn new(interval: Duration, max_misses: u32) -> Self {
        Self {
            interval,
            max_misses: max_misses.max(1),
            next_due: None,
            misses: 0,
        }
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.next_due = Some(now + self.interval);
        self.misses = 0;
    }

    pub(crate) fn stop(&mut self) {
        self.next_due = None;
        self.misses = 0;
    }

    pub(crate) fn due_at(&self) -> Option<Instant> {
        self.next_due
    }

    /// Record that a keep-alive went out at `now`
    pub(crate) fn sent(&mut self, now: Instant) {
        if self.next_due.is_some() {
            self.next_due = Some(now + self.interval);
        }
    }

    pub(crate) fn acked(&mut self) {
        self.misses = 0;
    }

    /// Record a timed-out keep-alive; `true` when the link should be dropped
    pub(crate) fn missed(&mut self) -> bool {
        if self.next_due.is_none() {
            return false;
        }
        self.misses += 1;
        self.misses >= self.max_misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keepalive_always_precedes_the_device_timeout() {
        let interval = Duration::from_secs(240);
        let mut keepalive = KeepAlive::new(interval, 2);
        let started = Instant::now();
        keepalive.start(started);

        let mut last_traffic = started;
        for _ in 0..20 {
            let due = keepalive.due_at().unwrap();
            tokio::time::sleep_until(due).await;
            let now = Instant::now();
            assert!(now - last_traffic < DEVICE_INACTIVITY_TIMEOUT);
            keepalive.sent(now);
            keepalive.acked();
            last_traffic = now;
        }
        assert!(Instant::now() - started >= interval * 20);
    }

    #[test]
    fn two_consecutive_misses_drop_the_link() {
        let mut keepalive = KeepAlive::new(Duration::from_secs(240), 2);
        keepalive.start(Instant::now());

        assert!(!keepalive.missed());
        keepalive.acked();
        assert!(!keepalive.missed());
        assert!(keepalive.missed());
    }

    #[test]
    fn stopped_schedule_ignores_misses() {
        let mut keepalive = KeepAlive::new(Duration::from_secs(240), 1);
        assert!(keepalive.due_at().is_none());
        assert!(!keepalive.missed());

        keepalive.start(Instant::now());
        keepalive.stop();
        assert!(keepalive.due_at().is_none());
        keepalive.sent(Instant::now());
        assert!(keepalive.due_at().is_none());
    }
}
