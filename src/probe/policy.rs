//! Retry policies and error classification.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Whether an error is worth another attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retryability {
    /// The same call may succeed later.
    Retryable,
    /// Retrying cannot help.
    Fatal,
}

/// Implemented by every stage error so retry decisions stay with the error
/// type rather than the call site.
pub trait Classify {
    /// Reports whether the error is transient.
    fn retryability(&self) -> Retryability;
}

/// Delay schedule between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// Delay grows by `step` per attempt and never exceeds `cap`.
    CappedLinear {
        /// Increment per attempt.
        step: Duration,
        /// Upper bound on any single delay.
        cap: Duration,
    },
}

/// Attempt bound plus delay schedule for one workflow stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with a constant delay.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Policy whose delay grows linearly up to `cap`.
    #[must_use]
    pub const fn capped_linear(max_attempts: u32, step: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::CappedLinear { step, cap },
        }
    }

    /// Policy with zero delay, handy for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Effective attempt count; never less than one.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }

    /// Delay to wait after the failed attempt numbered `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::CappedLinear { step, cap } => step.saturating_mul(attempt.max(1)).min(cap),
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, action: &str, op: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(
        policy,
        action,
        |err: &E| err.retryability() == Retryability::Retryable,
        op,
    )
    .await
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy is exhausted.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry_if<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    action: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && should_retry(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    action,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
