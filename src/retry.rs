//! Retry-policy evaluation.
//!
//! Policies are pure decision functions: the reconnect orchestrator owns the
//! attempt counter and the first-failure timestamp and passes both in, so a
//! policy value can be shared freely across sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;

/// Verdict of one retry-policy evaluation. Recomputed per evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether a reopen should be attempted at all.
    pub should_retry: bool,
    /// How long to wait before the reopen attempt.
    pub wait: Duration,
}

impl RetryDecision {
    /// Approve a retry after `wait`.
    pub fn retry_after(wait: Duration) -> Self {
        Self {
            should_retry: true,
            wait,
        }
    }

    /// Deny further retries.
    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
        }
    }
}

/// Externally supplied decision function with the same contract as the
/// built-in variants. A `None` result is treated as giving up.
pub type UserRetryFn =
    dyn Fn(u32, ErrorKind, Duration) -> Option<RetryDecision> + Send + Sync;

/// Policy deciding whether and when a failed session should reopen.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    NoRetry,
    /// Fixed delay between attempts, bounded by an attempt count.
    FixedInterval {
        /// Delay between attempts.
        interval: Duration,
        /// Attempts after which the policy gives up.
        max_retries: u32,
    },
    /// Exponential backoff with random jitter, bounded by total elapsed
    /// time since the first failure of the current outage.
    ExponentialBackoffWithJitter {
        /// First-attempt delay, doubled per attempt.
        base: Duration,
        /// Upper bound on the deterministic part of the delay.
        cap: Duration,
        /// Random jitter added on top, drawn from `[0, jitter_window)`.
        jitter_window: Duration,
        /// Ceiling on the total outage duration before giving up.
        max_elapsed: Duration,
    },
    /// Delegate to an externally supplied function.
    UserDefined(Arc<UserRetryFn>),
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        RetryPolicy::FixedInterval {
            interval,
            max_retries,
        }
    }

    /// Exponential backoff with the default parameters: 100ms base, 10s
    /// cap, 100ms jitter window, 4 minute outage ceiling.
    pub fn exponential() -> Self {
        RetryPolicy::ExponentialBackoffWithJitter {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            jitter_window: Duration::from_millis(100),
            max_elapsed: Duration::from_secs(240),
        }
    }

    /// Exponential backoff with explicit parameters.
    pub fn exponential_with(
        base: Duration,
        cap: Duration,
        jitter_window: Duration,
        max_elapsed: Duration,
    ) -> Self {
        RetryPolicy::ExponentialBackoffWithJitter {
            base,
            cap,
            jitter_window,
            max_elapsed,
        }
    }

    /// Wrap an externally supplied decision function.
    pub fn user_defined(
        f: impl Fn(u32, ErrorKind, Duration) -> Option<RetryDecision> + Send + Sync + 'static,
    ) -> Self {
        RetryPolicy::UserDefined(Arc::new(f))
    }

    /// Evaluate the policy. Pure; never blocks.
    ///
    /// `attempt_count` is the number of reopen attempts already made this
    /// outage, `last_failure` the classification of the most recent failure,
    /// and `elapsed` the time since the outage's first failure.
    pub fn decide(
        &self,
        attempt_count: u32,
        last_failure: ErrorKind,
        elapsed: Duration,
    ) -> RetryDecision {
        match self {
            RetryPolicy::NoRetry => RetryDecision::give_up(),
            RetryPolicy::FixedInterval {
                interval,
                max_retries,
            } => {
                if attempt_count < *max_retries {
                    RetryDecision::retry_after(*interval)
                } else {
                    RetryDecision::give_up()
                }
            }
            RetryPolicy::ExponentialBackoffWithJitter {
                base,
                cap,
                jitter_window,
                max_elapsed,
            } => {
                if !last_failure.is_retryable() || elapsed > *max_elapsed {
                    return RetryDecision::give_up();
                }

                let factor = 1u64 << attempt_count.min(32);
                let backoff_ms = (base.as_millis() as u64)
                    .saturating_mul(factor)
                    .min(cap.as_millis() as u64);
                let jitter_ms = match jitter_window.as_millis() as u64 {
                    0 => 0,
                    window => rand::thread_rng().gen_range(0..window),
                };

                RetryDecision::retry_after(Duration::from_millis(backoff_ms + jitter_ms))
            }
            RetryPolicy::UserDefined(f) => {
                f(attempt_count, last_failure, elapsed).unwrap_or_else(RetryDecision::give_up)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::NoRetry => f.write_str("NoRetry"),
            RetryPolicy::FixedInterval {
                interval,
                max_retries,
            } => f
                .debug_struct("FixedInterval")
                .field("interval", interval)
                .field("max_retries", max_retries)
                .finish(),
            RetryPolicy::ExponentialBackoffWithJitter {
                base,
                cap,
                jitter_window,
                max_elapsed,
            } => f
                .debug_struct("ExponentialBackoffWithJitter")
                .field("base", base)
                .field("cap", cap)
                .field("jitter_window", jitter_window)
                .field("max_elapsed", max_elapsed)
                .finish(),
            RetryPolicy::UserDefined(_) => f.write_str("UserDefined"),
        }
    }
}
