//! Bounded retry for device operations with transient failure modes.
//!
//! Connecting to the readout and applying a bias voltage both touch physical
//! hardware that may not be ready on the first try. [`retry`] repeats such an
//! operation a fixed number of times with a constant delay and hands back the
//! last failure once the budget is spent. Escalating that failure is left to the
//! caller.

use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use tpx_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.attempts(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// A value of 0 is treated as a single attempt.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy used when connecting to the readout: 3 attempts, 1 s apart.
    pub fn connect() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(1),
        }
    }

    /// Policy used when applying a bias voltage: 3 attempts, 500 ms apart.
    pub fn bias() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(500),
        }
    }

    /// Effective attempt count.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Errors that know whether repeating the operation can help.
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_transient(&self) -> bool;
}

impl Retryable for LinkError {
    fn is_transient(&self) -> bool {
        LinkError::is_transient(self)
    }
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    /// Attempts actually made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: E,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is used up.
///
/// The closure receives the 1-based attempt number. The delay is only slept
/// between attempts, never after the final one.
pub fn retry<T, E, F>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let max = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => {
                warn!(operation, attempt, error = %e, "Operation failed with non-retryable error");
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) if attempt >= max => {
                warn!(operation, attempt, max_attempts = max, error = %e, "Retry budget exhausted");
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = max,
                    delay_ms = policy.backoff_delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                std::thread::sleep(policy.backoff_delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            backoff_delay: Duration::ZERO,
        }
    }

    #[test]
    fn first_success_wins() {
        let mut calls = 0;
        let result: Result<u32, RetryExhausted<LinkError>> = retry(&fast(3), "connect", |n| {
            calls += 1;
            Ok(n)
        });
        assert_eq!(result.ok(), Some(1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_on_last_attempt() {
        let result = retry(&fast(3), "set_bias", |n| {
            if n < 3 {
                Err(LinkError::NotReady("settling".into()))
            } else {
                Ok("applied")
            }
        });
        assert_eq!(result.ok(), Some("applied"));
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let result: Result<(), _> = retry(&fast(3), "connect", |n| {
            Err(LinkError::Timeout {
                timeout_ms: u64::from(n),
            })
        });
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_error, LinkError::Timeout { timeout_ms: 3 });
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry(&fast(5), "set_bias", |_| {
            calls += 1;
            Err(LinkError::Rejected("channel out of range".into()))
        });
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _: Result<(), _> = retry(&fast(0), "connect", |_| {
            calls += 1;
            Err(LinkError::NotReady("down".into()))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn default_policies() {
        assert_eq!(RetryPolicy::connect().backoff_delay, Duration::from_secs(1));
        assert_eq!(RetryPolicy::bias().backoff_delay, Duration::from_millis(500));
        assert_eq!(RetryPolicy::bias().max_attempts, 3);
    }
}
