//! Retry / escalation policy.
//!
//! One policy type decides the next step after a transient failure, whether
//! it came from a stage task or a publish attempt. Terminal and
//! authentication failures never reach the policy: they escalate directly.

use std::time::Duration;

use sf_core::config::{BackoffKind, RetryConfig};

/// Delay schedule between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the retry that follows the `failures`-th failure.
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(failures.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again once `after` has elapsed.
    Retry { after: Duration },
    /// Give up and hand the entity to an operator.
    Escalate,
}

/// Retry budget plus delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Build a policy from its configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        let base = Duration::from_secs(config.base_delay_secs);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_secs(config.max_delay_secs),
            },
        };
        Self::new(config.max_retries, backoff)
    }

    /// Decide the next step given the number of failures recorded so far,
    /// including the one being handled.
    ///
    /// Retries while `failures < max_retries`; the `max_retries`-th failure
    /// escalates.
    pub fn decide(&self, failures: u32) -> Decision {
        if failures < self.max_retries {
            Decision::Retry {
                after: self.backoff.delay(failures),
            }
        } else {
            Decision::Escalate
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
