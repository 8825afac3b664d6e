// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Exponential backoff with a ceiling and random jitter. The jitter spreads
//! out reconnects of many consumers sharing the same broker.

use rand::Rng;
use std::time::Duration;

/// Upper bound (exclusive) of the random jitter added to every delay
pub const MAX_JITTER: Duration = Duration::from_millis(1_000);

/// Reconnect attempt counter and the delays derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl BackoffState {
    /// Creates a backoff with no attempts recorded.
    ///
    /// # Parameters
    /// * `base` - Delay unit doubled on every attempt
    /// * `max` - Ceiling of the delay before jitter
    ///
    /// # Returns
    /// A new BackoffState
    pub fn new(base: Duration, max: Duration) -> BackoffState {
        BackoffState {
            attempt: 0,
            base,
            max,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `min(base * 2^attempt, max)`, saturating instead of overflowing.
    pub fn base_delay(&self) -> Duration {
        2u32.checked_pow(self.attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Registers a new reconnect attempt.
    ///
    /// # Returns
    /// How long to wait before the attempt: `base_delay()` for the new
    /// attempt count plus up to `MAX_JITTER`
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.base_delay() + jitter()
    }
}

fn jitter() -> Duration {
    let max = MAX_JITTER.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffState {
        BackoffState::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    #[test]
    fn base_delay_doubles_until_the_ceiling() {
        let mut backoff = backoff();
        let mut delays = vec![];
        for _ in 0..6 {
            delays.push(backoff.base_delay());
            backoff.attempt += 1;
        }

        assert_eq!(
            delays,
            [5, 10, 20, 30, 30, 30].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn base_delay_is_monotonic_and_capped() {
        let mut backoff = backoff();
        let mut previous = Duration::ZERO;
        for attempt in 0..=200 {
            backoff.attempt = attempt;
            let delay = backoff.base_delay();
            assert!(delay >= previous, "attempt {attempt} went down");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        backoff.attempt = u32::MAX;
        assert_eq!(backoff.base_delay(), Duration::from_secs(30));
    }

    #[test]
    fn next_delay_increments_then_adds_jitter() {
        let mut backoff = backoff();
        for expected in [10, 20, 30, 30] {
            let delay = backoff.next_delay();
            let floor = Duration::from_secs(expected);
            assert!(delay >= floor && delay < floor + MAX_JITTER, "{delay:?}");
        }
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.base_delay(), Duration::from_secs(5));
    }
}
