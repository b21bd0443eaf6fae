use std::time::Duration;

/// Exponential reconnect delay: floor, 2x floor, 4x floor, ... capped at the ceiling.
///
/// A connection that stayed up past the stability threshold starts the
/// sequence over from the floor.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    floor: Duration,
    ceiling: Duration,
    stability_threshold: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(floor: Duration, ceiling: Duration, stability_threshold: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            stability_threshold,
            current: None,
        }
    }

    /// Delay before the next connection attempt
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.floor,
            Some(previous) => previous.saturating_mul(2).min(self.ceiling),
        };
        self.current = Some(delay);
        delay
    }

    /// Account for a lost link that had been up for `uptime`
    pub(crate) fn link_lost(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.stability_threshold {
            self.reset();
        }
        self.next_delay()
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let mut backoff = backoff();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn delays_never_decrease_without_a_stable_link() {
        let mut backoff = backoff();
        let mut previous = Duration::ZERO;
        for i in 0..40 {
            // short-lived links never reset the sequence
            let delay = backoff.link_lost(Duration::from_millis(i * 100));
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn stable_link_resets_to_the_floor() {
        let mut backoff = backoff();
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.link_lost(Duration::from_secs(29)), Duration::from_secs(32));
        assert_eq!(backoff.link_lost(Duration::from_secs(30)), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
