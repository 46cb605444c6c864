//! Reconnection backoff for relay connections.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter; always return the capped exponential delay.
    None,
    /// Equal jitter; return a random delay in `[capped_delay / 2, capped_delay]`.
    Equal,
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff sequence.
    ///
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts != 0).then_some(max_attempts),
            jitter: Jitter::None,
            attempt: 0,
        }
    }

    /// Override the jitter strategy (defaults to `None`).
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence.
    ///
    /// Returns `None` if the backoff is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        // capped = min(base * 2^attempt, max_delay)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = capped_ms.min(u64::MAX as u128) as u64;

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Equal => {
                let half = capped_ms / 2;
                rand::rng().random_range(half..=capped_ms)
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    /// Reset the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt count (number of delays generated so far).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the backoff has reached its maximum attempts.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_is_deterministic() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000), 3);

        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(400));
        assert!(backoff.next_delay().is_none());
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_millis(600), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(500));
        for _ in 0..100 {
            assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(600));
        }
        assert!(!backoff.is_exhausted());
    }

    #[test]
    fn equal_jitter_stays_in_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(400), Duration::from_secs(10), 0)
                .with_jitter(Jitter::Equal);
        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(400));
        let second = backoff.next_delay().unwrap();
        assert!(second >= Duration::from_millis(400) && second <= Duration::from_millis(800));
    }

    #[test]
    fn reset_clears_attempts() {
        let mut backoff = ExponentialBackoff::default();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
    }
}
