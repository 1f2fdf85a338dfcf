//! Publishes stage transitions to the state store.

use std::sync::Arc;

use tracing::{info, warn};

use crate::identifier::Identifier;
use crate::state::{InstanceInfo, ProvisioningState, ProvisioningStatus, StateStore};

/// Writes whole states for one run, never lowering progress.
pub(crate) struct StageReporter {
    store: Arc<dyn StateStore>,
    identifier: Identifier,
    current: ProvisioningState,
}

impl StageReporter {
    /// Starts a run by publishing a fresh `creating` state.
    pub(crate) fn start(store: Arc<dyn StateStore>, identifier: Identifier) -> Self {
        let current = ProvisioningState::creating();
        store.set(&identifier, current.clone());
        info!(
            identifier = %identifier,
            status = ?current.status,
            progress = current.progress,
            "provisioning started"
        );
        Self {
            store,
            identifier,
            current,
        }
    }

    /// Moves to `status`, keeping previously published instance details.
    pub(crate) fn advance(&mut self, status: ProvisioningStatus) {
        let info = self.current.instance_info.clone();
        self.publish(status, info);
    }

    /// Moves to `status` and attaches `info`.
    pub(crate) fn advance_with_info(&mut self, status: ProvisioningStatus, info: InstanceInfo) {
        self.publish(status, Some(info));
    }

    /// Marks the run failed with `message`, keeping progress unchanged.
    pub(crate) fn fail(&mut self, message: &str) {
        let failed = ProvisioningState::failed_from(&self.current, message);
        self.store.set(&self.identifier, failed.clone());
        warn!(
            identifier = %self.identifier,
            progress = failed.progress,
            error = message,
            "provisioning failed"
        );
        self.current = failed;
    }

    fn publish(&mut self, status: ProvisioningStatus, info: Option<InstanceInfo>) {
        let progress = status
            .progress()
            .map_or(self.current.progress, |next| next.max(self.current.progress));
        let next = ProvisioningState {
            status,
            progress,
            error: None,
            instance_info: info,
        };
        self.store.set(&self.identifier, next.clone());
        info!(identifier = %self.identifier, status = ?status, progress, "provisioning stage");
        self.current = next;
    }
}
