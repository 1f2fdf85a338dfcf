//! Error taxonomy for the provisioning workflow.

use thiserror::Error;

use crate::backend::ProviderError;
use crate::probe::{Classify, Retryability};
use crate::registry::RegistryError;
use crate::session::SessionError;

/// Errors raised while building a [`super::ProvisioningRequest`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when the company name is blank.
    #[error("company name must not be empty")]
    MissingCompanyName,
}

/// Failures that end a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Listing or deleting the previous instance failed.
    #[error("failed to reclaim previous instance: {0}")]
    Reclaim(#[source] ProviderError),
    /// The create call failed after exhausting its policy.
    #[error("failed to create instance: {0}")]
    Creation(#[source] ProviderError),
    /// Re-reading the instance after activation failed.
    #[error("failed to look up instance {instance_id}: {source}")]
    InstanceLookup {
        /// Provider instance identifier.
        instance_id: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// The instance became active without a public IPv4 address.
    #[error("instance {instance_id} has no public IPv4 address")]
    MissingPublicIp {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// A readiness probe ran out of attempts.
    #[error("timed out waiting for {probe} after {attempts} attempts: {last_reason}")]
    ProbeTimeout {
        /// Probe name (`instance_active` or `ssh`).
        probe: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the final attempt.
        last_reason: String,
    },
    /// The configuration session could not be established or dropped.
    #[error("remote session failed: {0}")]
    Connect(#[source] SessionError),
    /// A must-succeed remote command failed.
    #[error("remote configuration failed: {0}")]
    CommandFailed(#[source] SessionError),
    /// The application runtime is not installed on the instance.
    #[error("application runtime {path} is missing or not executable")]
    RuntimeMissing {
        /// Runtime path that failed `test -x`.
        path: String,
    },
    /// The application process was not running after launch.
    #[error("application failed to start; last log lines:\n{log_tail}")]
    LaunchFailed {
        /// Tail of the application log.
        log_tail: String,
    },
    /// The pairing QR code never became available.
    #[error("timed out waiting for the pairing QR code after {attempts} attempts: {last_reason}")]
    QrTimeout {
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the final attempt.
        last_reason: String,
    },
    /// Recording the completed instance failed.
    #[error("failed to record completed instance: {0}")]
    Registry(#[source] RegistryError),
}

impl From<SessionError> for ProvisionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Connect { .. } | SessionError::Disconnected { .. } => Self::Connect(err),
            SessionError::InvalidConfig { .. }
            | SessionError::Spawn { .. }
            | SessionError::CommandFailed { .. } => Self::CommandFailed(err),
        }
    }
}

impl Classify for ProvisionError {
    fn retryability(&self) -> Retryability {
        match self {
            Self::Reclaim(err)
            | Self::Creation(err)
            | Self::InstanceLookup { source: err, .. } => err.retryability(),
            Self::Connect(err) | Self::CommandFailed(err) => err.retryability(),
            Self::MissingPublicIp { .. }
            | Self::ProbeTimeout { .. }
            | Self::RuntimeMissing { .. }
            | Self::LaunchFailed { .. }
            | Self::QrTimeout { .. }
            | Self::Registry(_) => Retryability::Fatal,
        }
    }
}
