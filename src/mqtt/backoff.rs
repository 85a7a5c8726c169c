//! Exponential backoff with jitter for broker reconnects and subscription retries.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max) * (1 - jitter * r),  r in [0, 1)
//! ```
//!
//! Unlike a bounded retry policy, `next_delay` never runs out: the connection
//! kernel retries for as long as the process lives. Callers that need a budget
//! (topic reconciliation) count attempts themselves.

use std::time::Duration;

use rand::Rng;

use super::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// Fraction of the delay that may be shaved off randomly (0.0 - 1.0)
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial.min(max),
            max_delay: max,
            multiplier: multiplier.max(1.0),
            jitter: 0.0,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        )
        .with_jitter(config.jitter)
    }

    /// Call when a connection succeeds.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.current_delay;

        let grown = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()));

        if self.jitter > 0.0 {
            let shave = rand::thread_rng().gen_range(0.0..self.jitter);
            base.mul_f64(1.0 - shave)
        } else {
            base
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// 1s initial, doubling, capped at 60s, 20% jitter.
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0);
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn never_runs_out_of_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0);
        for _ in 0..10_000 {
            assert!(backoff.next_delay() <= Duration::from_millis(2));
        }
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(1), 2.0).with_jitter(0.5);
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(1));
            assert!(delay >= Duration::from_millis(500));
        }
    }

    #[test]
    fn multiplier_below_one_does_not_shrink_delays() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 0.5);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
