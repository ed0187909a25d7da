//! Exponential backoff with full jitter for persistent task retries.

use crate::config::TaskConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            initial: config.retry_initial_delay,
            max: config.retry_max_delay,
            multiplier: config.retry_multiplier.max(1),
            max_attempts: config.retry_max_attempts,
            attempt: 0,
        }
    }

    /// Number of failed attempts recorded so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over, as if no attempt had failed
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record a failed attempt and return the delay before the next one
    ///
    /// Returns `None` once `max_attempts` runs have failed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let cap = self.cap(self.attempt - 1);
        let cap_millis = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
        Some(Duration::from_millis(rand::random_range(0..=cap_millis)))
    }

    fn cap(&self, exponent: u32) -> Duration {
        self.multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_bounded_by_cap() {
        let mut backoff = Backoff::from_config(&TaskConfig::default());
        let caps = [1, 2, 4, 8, 16, 32, 60];
        for cap in caps {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(cap), "{delay:?} > {cap}s");
        }
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 8);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn test_cap_saturates() {
        let backoff = Backoff::from_config(&TaskConfig::default());
        assert_eq!(backoff.cap(40), Duration::from_secs(60));
    }
}
