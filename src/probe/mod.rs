//! Bounded readiness polling and the checks the workflow waits on.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

mod checks;
mod policy;

pub use checks::{
    ArtifactProbe, HttpArtifactProbe, ProbeFuture, artifact_url, instance_active,
    is_image_response, shell_reachable,
};
pub use policy::{Backoff, Classify, RetryPolicy, Retryability, retry, retry_if};

/// Result of a single readiness check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollResult<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; the string says why.
    Pending(String),
}

/// Final outcome of a polling loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome<T> {
    /// The check reported ready.
    Ready {
        /// Value returned by the successful check.
        value: T,
        /// Number of checks made, including the successful one.
        attempts: u32,
    },
    /// Every attempt reported pending.
    TimedOut {
        /// Number of checks made.
        attempts: u32,
        /// Reason given by the last check.
        last_reason: String,
    },
}

impl<T> ProbeOutcome<T> {
    /// Number of checks made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Ready { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Calls `check` until it reports ready or `max_attempts` checks were made.
///
/// Sleeps `interval` between checks but not after the last one. A
/// `max_attempts` of zero makes a single check.
pub async fn poll<T, F, Fut>(check: F, interval: Duration, max_attempts: u32) -> ProbeOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    poll_with_policy(check, &RetryPolicy::fixed(max_attempts, interval)).await
}

/// Variant of [`poll`] driven by a [`RetryPolicy`].
pub async fn poll_with_policy<T, F, Fut>(mut check: F, policy: &RetryPolicy) -> ProbeOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let attempts = policy.attempts();
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match check().await {
            PollResult::Ready(value) => {
                return ProbeOutcome::Ready {
                    value,
                    attempts: attempt,
                };
            }
            PollResult::Pending(reason) => {
                debug!(attempt, max_attempts = attempts, reason = %reason, "probe pending");
                last_reason = reason;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }
    ProbeOutcome::TimedOut {
        attempts,
        last_reason,
    }
}
