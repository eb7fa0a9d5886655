//! Reconnect backoff policy.
//!
//! Pure state, no I/O. The first failure after a successful run waits
//! `base_delay`; every further consecutive failure adds `backoff_delay`,
//! clamped to `max_delay`. After `max_retries` granted retries the next
//! failure gives up and the state resets.

use std::time::Duration;

use crate::config::Config;

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Sleep, then try again.
    RetryAfter(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Retry bookkeeping for [`ConnectionManager`](crate::manager::ConnectionManager).
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    backoff_delay: Duration,
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    attempt: u32,
    current: Duration,
}

impl ReconnectPolicy {
    /// Create a policy from explicit parameters.
    pub fn new(
        base_delay: Duration,
        backoff_delay: Duration,
        max_delay: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            backoff_delay,
            base_delay,
            max_delay,
            max_retries,
            attempt: 0,
            current: Duration::ZERO,
        }
    }

    /// Create a policy from the `reconnect_*` settings.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.reconnect_backoff_delay),
            Duration::from_secs(config.reconnect_delay_max),
            config.reconnect_retries,
        )
    }

    /// Record a failure and decide what happens next.
    pub fn on_failure(&mut self) -> Action {
        if self.attempt >= self.max_retries {
            self.reset();
            return Action::GiveUp;
        }

        self.attempt += 1;
        self.current = if self.attempt == 1 {
            self.base_delay
        } else {
            self.current + self.backoff_delay
        };

        if self.current > self.max_delay {
            self.current = self.max_delay;
        }

        Action::RetryAfter(self.current)
    }

    /// Record a successful connect.
    pub fn on_success(&mut self) {
        self.reset();
    }

    /// Forget all accumulated state.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = Duration::ZERO;
    }

    /// Failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Configured retry ceiling.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upper bound for any returned delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}
