//! Retry Backoff
//!
//! The delay curve shared by the watch manager and the BlobDB sync engine,
//! and the per-watch reconnect bookkeeping built on it.
//!
//! A watch that keeps failing is retried `max_attempts` times on the curve.
//! After that no timer is armed at all: the watch waits until it is seen
//! again, which starts a fresh round.

use crate::config::WatchManagerConfig;
use std::fmt;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `initial` doubling up to `max`
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    initial
        .checked_mul(1u32 << shift)
        .map_or(max, |delay| delay.min(max))
}

/// What to do after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    RetryIn(Duration),
    /// Out of attempts until the next sighting
    AwaitSighting,
}

/// Consecutive failures of one watch and the round they belong to
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    failures: u32,
}

impl ReconnectionStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            failures: 0,
        }
    }

    pub fn from_config(config: &WatchManagerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_reconnect_delay_secs),
            Duration::from_secs(config.max_reconnect_delay_secs),
            config.max_reconnect_attempts,
        )
    }

    /// Count a failure and plan the next attempt
    pub fn on_failure(&mut self) -> RetryPlan {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_attempts {
            RetryPlan::AwaitSighting
        } else {
            RetryPlan::RetryIn(backoff_delay(
                self.initial_delay,
                self.max_delay,
                self.failures,
            ))
        }
    }

    /// Start a fresh round after a sighting, a user request or a good connection
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures > self.max_attempts
    }
}

impl fmt::Display for ReconnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures == 0 {
            write!(f, "first attempt")
        } else {
            write!(f, "retry {}/{}", self.failures, self.max_attempts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(max_attempts: u32) -> ReconnectionStrategy {
        ReconnectionStrategy::new(Duration::from_secs(2), Duration::from_secs(10), max_attempts)
    }

    #[test]
    fn test_backoff_delay() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(initial, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(initial, max, 7), max);
        assert_eq!(backoff_delay(initial, max, u32::MAX), max);
    }

    #[test]
    fn test_failures_walk_the_curve_then_wait_for_sighting() {
        let mut strategy = strategy(3);
        let plans: Vec<RetryPlan> = (0..5).map(|_| strategy.on_failure()).collect();
        assert_eq!(
            plans,
            vec![
                RetryPlan::RetryIn(Duration::from_secs(2)),
                RetryPlan::RetryIn(Duration::from_secs(4)),
                RetryPlan::RetryIn(Duration::from_secs(8)),
                RetryPlan::AwaitSighting,
                RetryPlan::AwaitSighting,
            ]
        );
        assert!(strategy.is_exhausted());
    }

    #[test]
    fn test_sighting_starts_a_new_round() {
        let mut strategy = strategy(1);
        strategy.on_failure();
        assert_eq!(strategy.on_failure(), RetryPlan::AwaitSighting);

        strategy.reset();
        assert_eq!(strategy.failures(), 0);
        assert!(!strategy.is_exhausted());
        assert_eq!(
            strategy.on_failure(),
            RetryPlan::RetryIn(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_zero_attempts_never_arms_a_timer() {
        assert_eq!(strategy(0).on_failure(), RetryPlan::AwaitSighting);
    }

    #[test]
    fn test_from_config_and_display() {
        let config = WatchManagerConfig {
            initial_reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 7,
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let mut strategy = ReconnectionStrategy::from_config(&config);
        assert_eq!(strategy.to_string(), "first attempt");
        assert_eq!(
            strategy.on_failure(),
            RetryPlan::RetryIn(Duration::from_secs(5))
        );
        assert_eq!(
            strategy.on_failure(),
            RetryPlan::RetryIn(Duration::from_secs(7))
        );
        assert_eq!(strategy.to_string(), "retry 2/2");
    }
}
