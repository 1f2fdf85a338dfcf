//! Provisioning progress as published to pollers.
//!
//! The orchestrator is the only writer; the status endpoint only reads. Whole
//! values are replaced under a lock so a reader never sees a partial update.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// Workflow stage reported to clients.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// Workflow started; any previous instance is being reclaimed.
    Creating,
    /// Create call acknowledged by the provider.
    CreatingDroplet,
    /// Instance active with a public address; waiting for SSH.
    WaitingForSsh,
    /// Remote session established and configuration running.
    Configuring,
    /// Application confirmed serving its pairing artifact.
    Completed,
    /// A stage failed; progress keeps the last reached value.
    Failed,
    /// No workflow has been recorded for the identifier.
    NotStarted,
}

impl ProvisioningStatus {
    /// Progress published when entering this stage.
    ///
    /// `Failed` has no fixed value and reports `None`.
    #[must_use]
    pub const fn progress(self) -> Option<u8> {
        match self {
            Self::Creating | Self::NotStarted => Some(0),
            Self::CreatingDroplet => Some(25),
            Self::WaitingForSsh => Some(50),
            Self::Configuring => Some(75),
            Self::Completed => Some(100),
            Self::Failed => None,
        }
    }

    /// Returns `true` for states only a relaunch or reset may overwrite.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Details about the provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Public IPv4 address.
    pub ip: String,
    /// Provider instance name.
    pub name: String,
    /// Provider status string.
    pub status: String,
    /// Provider creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Provider instance identifier.
    pub id: String,
}

/// Snapshot of one workflow's progress.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningState {
    /// Current stage.
    pub status: ProvisioningStatus,
    /// Progress between 0 and 100.
    pub progress: u8,
    /// Failure message when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Instance details once an address is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<InstanceInfo>,
}

impl ProvisioningState {
    /// Fresh state written when a workflow starts.
    #[must_use]
    pub const fn creating() -> Self {
        Self {
            status: ProvisioningStatus::Creating,
            progress: 0,
            error: None,
            instance_info: None,
        }
    }

    /// State reported for identifiers with no recorded workflow.
    #[must_use]
    pub const fn not_started() -> Self {
        Self {
            status: ProvisioningStatus::NotStarted,
            progress: 0,
            error: None,
            instance_info: None,
        }
    }

    /// Failed state carrying `error`, keeping progress and instance details.
    #[must_use]
    pub fn failed_from(previous: &Self, error: impl Into<String>) -> Self {
        Self {
            status: ProvisioningStatus::Failed,
            progress: previous.progress,
            error: Some(error.into()),
            instance_info: previous.instance_info.clone(),
        }
    }
}

/// Keyed store of provisioning states.
pub trait StateStore: Send + Sync {
    /// Returns the state for `id`, if any.
    fn get(&self, id: &Identifier) -> Option<ProvisioningState>;
    /// Replaces the state for `id`.
    fn set(&self, id: &Identifier, state: ProvisioningState);
    /// Removes the state for `id`.
    fn delete(&self, id: &Identifier);
}

/// In-process [`StateStore`] backed by a lock-protected map.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<Identifier, ProvisioningState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &Identifier) -> Option<ProvisioningState> {
        let states = self
            .states
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.get(id).cloned()
    }

    fn set(&self, id: &Identifier, state: ProvisioningState) {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.insert(id.clone(), state);
    }

    fn delete(&self, id: &Identifier) {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn id() -> Identifier {
        Identifier::parse("5511999998888").expect("identifier")
    }

    #[rstest]
    #[case(ProvisioningStatus::Creating, Some(0))]
    #[case(ProvisioningStatus::CreatingDroplet, Some(25))]
    #[case(ProvisioningStatus::WaitingForSsh, Some(50))]
    #[case(ProvisioningStatus::Configuring, Some(75))]
    #[case(ProvisioningStatus::Completed, Some(100))]
    #[case(ProvisioningStatus::Failed, None)]
    #[case(ProvisioningStatus::NotStarted, Some(0))]
    fn maps_status_to_progress(#[case] status: ProvisioningStatus, #[case] expected: Option<u8>) {
        assert_eq!(status.progress(), expected);
    }

    #[test]
    fn serialises_in_camel_case() {
        let state = ProvisioningState {
            status: ProvisioningStatus::WaitingForSsh,
            progress: 50,
            error: None,
            instance_info: Some(InstanceInfo {
                ip: String::from("203.0.113.7"),
                name: String::from("botfleet-5511999998888"),
                status: String::from("active"),
                created_at: Utc
                    .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
                    .single()
                    .expect("timestamp"),
                id: String::from("1234"),
            }),
        };
        let json = serde_json::to_value(&state).expect("serialise");
        assert_eq!(
            json,
            serde_json::json!({
                "status": "waiting_for_ssh",
                "progress": 50,
                "instanceInfo": {
                    "ip": "203.0.113.7",
                    "name": "botfleet-5511999998888",
                    "status": "active",
                    "createdAt": "2026-01-02T03:04:05Z",
                    "id": "1234"
                }
            })
        );
    }

    #[test]
    fn set_then_get_returns_equal_value() {
        let store = MemoryStateStore::new();
        let state = ProvisioningState::failed_from(&ProvisioningState::creating(), "boom");
        store.set(&id(), state.clone());
        assert_eq!(store.get(&id()), Some(state));
    }

    #[test]
    fn delete_removes_state() {
        let store = MemoryStateStore::new();
        store.set(&id(), ProvisioningState::creating());
        store.delete(&id());
        assert_eq!(store.get(&id()), None);
    }

    #[test]
    fn failed_keeps_progress_and_info() {
        let previous = ProvisioningState {
            status: ProvisioningStatus::Configuring,
            progress: 75,
            error: None,
            instance_info: None,
        };
        let failed = ProvisioningState::failed_from(&previous, "runtime missing");
        assert_eq!(failed.status, ProvisioningStatus::Failed);
        assert_eq!(failed.progress, 75);
        assert_eq!(failed.error.as_deref(), Some("runtime missing"));
    }
}
