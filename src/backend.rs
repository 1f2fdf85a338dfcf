//! Cloud client abstraction for creating and reclaiming bot instances.

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::probe::{Classify, Retryability};

/// Provider status string reported once an instance has booted.
pub const ACTIVE_STATUS: &str = "active";

/// Provider specific identifier for an instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wraps a provider identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Instance name, unique per identifier.
    pub name: String,
    /// Tags attached to the instance at creation.
    pub tags: Vec<String>,
    /// User-data script executed on first boot.
    pub boot_script: String,
}

/// Snapshot of an instance as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: InstanceId,
    /// Provider-assigned name.
    pub name: String,
    /// Raw provider status (for example `new` or `active`).
    pub status: String,
    /// Creation timestamp reported by the provider.
    pub created_at: DateTime<Utc>,
    /// Public IPv4 address, once the provider has assigned one.
    pub public_ipv4: Option<Ipv4Addr>,
    /// Tags attached to the instance.
    pub tags: Vec<String>,
}

impl Instance {
    /// Returns `true` when the provider reports the instance as booted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ACTIVE_STATUS
    }
}

/// Errors raised by cloud clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the provider answers with a non-2xx status.
    #[error("provider returned {status} ({code}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error code (for example `not_found`).
        code: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when a request exceeds its timeout.
    #[error("provider request timed out during {action}")]
    Timeout {
        /// Operation that timed out.
        action: String,
    },
    /// Raised when the request could not be sent or the response read.
    #[error("provider transport error: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },
    /// Raised when a successful response body cannot be decoded.
    #[error("failed to decode provider response: {message}")]
    Decode {
        /// Parser error text.
        message: String,
    },
}

impl ProviderError {
    /// Returns `true` when the provider reported the resource as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

impl Classify for ProviderError {
    fn retryability(&self) -> Retryability {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => Retryability::Retryable,
            Self::Api { status, .. } if *status == 429 || *status >= 500 => Retryability::Retryable,
            Self::Api { .. } | Self::Decode { .. } => Retryability::Fatal,
        }
    }
}

/// Future returned by cloud client operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Minimal interface implemented by cloud providers.
///
/// Implementations perform no retries; callers own retry policy so progress
/// can be reported between attempts.
pub trait CloudClient: Send + Sync {
    /// Creates an instance and returns its provider identifier.
    ///
    /// Callers delete any instance with the same name beforehand.
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> BackendFuture<'a, InstanceId>;

    /// Fetches an instance by identifier, returning `None` when it is gone.
    fn get<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, Option<Instance>>;

    /// Fetches the first instance with the given name.
    fn get_by_name<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Instance>>;

    /// Lists instances carrying `tag`.
    fn list_by_tag<'a>(&'a self, tag: &'a str) -> BackendFuture<'a, Vec<Instance>>;

    /// Deletes an instance. A missing instance counts as deleted.
    fn delete<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()>;

    /// Reboots an instance.
    fn reboot<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()>;
}
