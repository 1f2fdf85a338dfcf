//! Leak sweeper for fleet instances.
//!
//! Every instance the orchestrator creates carries the fleet tag (the name
//! prefix). An instance is a leak when it is older than the minimum age and
//! no registry record points at it: a crashed run or a failed cleanup left
//! it behind. The age threshold keeps the sweep away from runs in flight.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{CloudClient, ProviderError};
use crate::registry::{InstanceRegistry, RegistryError};

/// Default minimum age, in minutes, before an unregistered instance is swept.
pub const DEFAULT_MIN_AGE_MINUTES: i64 = 120;

/// Configuration for a sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Fleet tag shared by every managed instance.
    pub fleet_tag: String,
    /// Instances younger than this are kept.
    pub min_age: Duration,
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
}

impl JanitorConfig {
    /// Constructs a config, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when the tag is blank or the
    /// minimum age is negative.
    pub fn new(
        fleet_tag: impl Into<String>,
        min_age_minutes: i64,
        dry_run: bool,
    ) -> Result<Self, JanitorError> {
        let fleet_tag = fleet_tag.into().trim().to_owned();
        if fleet_tag.is_empty() {
            return Err(JanitorError::InvalidConfig {
                field: String::from("fleet_tag"),
            });
        }
        if min_age_minutes < 0 {
            return Err(JanitorError::InvalidConfig {
                field: String::from("min_age_minutes"),
            });
        }
        Ok(Self {
            fleet_tag,
            min_age: Duration::minutes(min_age_minutes),
            dry_run,
        })
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Fleet instances inspected.
    pub inspected: usize,
    /// Names of instances deleted, or that would be deleted on a dry run.
    pub deleted: Vec<String>,
    /// Instances kept because a registry record points at them.
    pub kept_registered: usize,
    /// Instances kept because they are younger than the minimum age.
    pub kept_young: usize,
}

/// Errors returned by the janitor.
#[derive(Debug, Error)]
pub enum JanitorError {
    /// Raised when configuration is missing required values.
    #[error("missing or invalid {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
    /// Raised when listing fleet instances fails.
    #[error("failed to list instances tagged {tag}: {source}")]
    List {
        /// Tag that was listed.
        tag: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when deleting a leaked instance fails.
    #[error("failed to delete instance {name}: {source}")]
    Delete {
        /// Instance name.
        name: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the registry cannot be read.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Deletes fleet instances that no registry record accounts for.
pub struct Janitor<C: CloudClient> {
    config: JanitorConfig,
    cloud: Arc<C>,
    registry: Arc<dyn InstanceRegistry>,
}

impl<C: CloudClient> Janitor<C> {
    /// Creates a janitor over the given provider and registry.
    #[must_use]
    pub fn new(config: JanitorConfig, cloud: Arc<C>, registry: Arc<dyn InstanceRegistry>) -> Self {
        Self {
            config,
            cloud,
            registry,
        }
    }

    /// Performs a sweep relative to the current time.
    ///
    /// # Errors
    ///
    /// See [`Janitor::sweep_at`].
    pub async fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        self.sweep_at(Utc::now()).await
    }

    /// Performs a sweep treating `now` as the current time.
    ///
    /// Instances are deleted one at a time; the first failed delete stops
    /// the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when listing, reading the registry, or
    /// deleting fails.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary, JanitorError> {
        let tag = &self.config.fleet_tag;
        let registered: HashSet<String> = self
            .registry
            .list()?
            .into_iter()
            .map(|record| record.instance_id)
            .collect();
        let instances = self
            .cloud
            .list_by_tag(tag)
            .await
            .map_err(|source| JanitorError::List {
                tag: tag.clone(),
                source,
            })?;

        let mut summary = SweepSummary {
            inspected: instances.len(),
            ..SweepSummary::default()
        };
        for instance in instances {
            if registered.contains(instance.id.as_str()) {
                summary.kept_registered += 1;
                continue;
            }
            let age = now.signed_duration_since(instance.created_at);
            if age < self.config.min_age {
                summary.kept_young += 1;
                continue;
            }
            if self.config.dry_run {
                info!(
                    instance_id = %instance.id,
                    name = %instance.name,
                    age_minutes = age.num_minutes(),
                    "would delete leaked instance"
                );
            } else {
                self.cloud
                    .delete(&instance.id)
                    .await
                    .map_err(|source| {
                        warn!(
                            instance_id = %instance.id,
                            error = %source,
                            "failed to delete leaked instance"
                        );
                        JanitorError::Delete {
                            name: instance.name.clone(),
                            source,
                        }
                    })?;
                info!(
                    instance_id = %instance.id,
                    name = %instance.name,
                    age_minutes = age.num_minutes(),
                    "deleted leaked instance"
                );
            }
            summary.deleted.push(instance.name);
        }
        Ok(summary)
    }
}
