//! Capped exponential backoff for the reflecting worker's reconnect loop.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Tracks consecutive failures and produces the delay before the next retry.
///
/// Delays grow by `multiplier` per failure up to `max_delay`, with up to 25%
/// jitter so a fleet of edge nodes does not reconnect in lockstep. A success
/// resets the sequence.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff tracker from configuration.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns the delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(self.attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(capped * jitter_factor)
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Resets the sequence after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_failures: 5,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(config());

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200));

        // Far past the cap: 100ms * 2^9 >> 1s.
        for _ in 0..8 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(1250));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(125));
    }
}
