//! Reconnection backoff shared by every dialect worker.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter.
///
/// Delays grow 1 s → 30 s at ×2 per attempt, with ±20 % jitter so a
/// fleet of workers does not reconnect in lockstep after a device
/// restart.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    /// The engine's standard reconnect backoff.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bounds(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Backoff with explicit bounds (×2 growth).
    #[must_use]
    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
            attempt: 0,
        }
    }

    /// The attempts taken since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets after a successful (re)connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// The next delay, advancing the schedule.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let base = self.current.as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        let delay = Duration::from_millis((base * (1.0 + jitter)).max(1.0) as u64);

        let grown = (base * self.multiplier) as u64;
        self.current = Duration::from_millis(grown).min(self.max);

        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new();

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800), "got {first:?}");
        assert!(first <= Duration::from_millis(1200), "got {first:?}");

        // After enough attempts the schedule sits at the cap ±20 %.
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_secs(24), "got {capped:?}");
        assert!(capped <= Duration::from_secs(36), "got {capped:?}");
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1200), "got {delay:?}");
    }
}
