//! Detached workflow tasks, one per identifier.
//!
//! [`Supervisor::start`] returns as soon as the workflow task is spawned.
//! Each identifier has its own async slot lock, so `start` and `reset` calls
//! for the same identifier are serialised and two runs never write
//! interleaved states. Calls for other identifiers never wait on it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{CloudClient, ProviderError};
use crate::identifier::Identifier;
use crate::orchestrator::{ProvisioningOrchestrator, ProvisioningRequest};
use crate::probe::ArtifactProbe;
use crate::registry::{InstanceRecord, RegistryError};
use crate::session::CommandRunner;
use crate::state::ProvisioningState;

/// What to do when a workflow is already running for an identifier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConflictPolicy {
    /// Refuse the new request.
    #[default]
    Reject,
    /// Abort the running workflow, tear down its instance, and start over.
    Relaunch,
}

/// Raised when a conflict policy name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown conflict policy `{0}`")]
pub struct UnknownConflictPolicy(pub String);

impl FromStr for ConflictPolicy {
    type Err = UnknownConflictPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "relaunch" => Ok(Self::Relaunch),
            _ => Err(UnknownConflictPolicy(value.to_owned())),
        }
    }
}

/// Result of [`Supervisor::start`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StartOutcome {
    /// A workflow task was spawned.
    Started,
    /// The identifier already has a completed instance; nothing was started.
    AlreadyProvisioned(InstanceRecord),
}

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A workflow is running and the policy is [`ConflictPolicy::Reject`].
    #[error("provisioning already running for {identifier}")]
    AlreadyRunning {
        /// Identifier with a running workflow.
        identifier: Identifier,
    },
    /// Deleting the instance during a reset failed.
    #[error("failed to delete instance {name}: {source}")]
    Teardown {
        /// Instance name.
        name: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Reading or clearing the registry failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct RunningWorkflow {
    run_id: u64,
    handle: JoinHandle<()>,
}

/// Workflow bookkeeping for one identifier.
#[derive(Default)]
struct Slot {
    running: Option<RunningWorkflow>,
}

impl Slot {
    fn take_live(&mut self) -> Option<RunningWorkflow> {
        self.running
            .take()
            .filter(|workflow| !workflow.handle.is_finished())
    }
}

/// Owns the detached workflow tasks.
pub struct Supervisor<C, R, P>
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    orchestrator: Arc<ProvisioningOrchestrator<C, R, P>>,
    policy: ConflictPolicy,
    slots: SyncMutex<HashMap<Identifier, Arc<Mutex<Slot>>>>,
    next_run_id: AtomicU64,
}

impl<C, R, P> Supervisor<C, R, P>
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    /// Creates a supervisor around `orchestrator`.
    #[must_use]
    pub fn new(
        orchestrator: Arc<ProvisioningOrchestrator<C, R, P>>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            orchestrator,
            policy,
            slots: SyncMutex::new(HashMap::new()),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Orchestrator used for runs.
    #[must_use]
    pub fn orchestrator(&self) -> &ProvisioningOrchestrator<C, R, P> {
        &self.orchestrator
    }

    /// Configured conflict policy.
    #[must_use]
    pub const fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Starts a workflow for the request's identifier and returns at once.
    ///
    /// An identifier with a registry record is reported as already
    /// provisioned and no workflow starts.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] under
    /// [`ConflictPolicy::Reject`] when a run is in flight, or a teardown or
    /// registry error from a relaunch.
    pub async fn start(
        self: &Arc<Self>,
        request: ProvisioningRequest,
    ) -> Result<StartOutcome, SupervisorError> {
        let identifier = request.identifier.clone();
        let slot = self.slot(&identifier);
        let mut slot = slot.lock().await;

        if let Some(record) = self.orchestrator.registry().get(&identifier)? {
            info!(identifier = %identifier, ip = %record.ip, "identifier already provisioned");
            return Ok(StartOutcome::AlreadyProvisioned(record));
        }

        if let Some(previous) = slot.take_live() {
            match self.policy {
                ConflictPolicy::Reject => {
                    slot.running = Some(previous);
                    return Err(SupervisorError::AlreadyRunning { identifier });
                }
                ConflictPolicy::Relaunch => {
                    info!(
                        identifier = %identifier,
                        run_id = previous.run_id,
                        "relaunching provisioning"
                    );
                    stop(previous).await;
                    self.teardown(&identifier).await?;
                }
            }
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        self.orchestrator
            .store()
            .set(&identifier, ProvisioningState::creating());
        let supervisor = Arc::clone(self);
        let task_identifier = identifier.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = supervisor.orchestrator.run(&request).await {
                warn!(
                    identifier = %task_identifier,
                    run_id,
                    error = %err,
                    "provisioning run failed"
                );
            }
            supervisor.finish(&task_identifier, run_id).await;
        });
        slot.running = Some(RunningWorkflow { run_id, handle });
        Ok(StartOutcome::Started)
    }

    /// Aborts any running workflow, deletes the identifier's instances, clears
    /// its registry record, and publishes a fresh `creating` state.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Teardown`] when the provider delete fails,
    /// or [`SupervisorError::Registry`] when the record cannot be removed.
    pub async fn reset(&self, identifier: &Identifier) -> Result<(), SupervisorError> {
        let slot = self.slot(identifier);
        let mut slot = slot.lock().await;
        if let Some(previous) = slot.take_live() {
            info!(identifier = %identifier, run_id = previous.run_id, "aborting provisioning");
            stop(previous).await;
        }
        self.teardown(identifier).await
    }

    /// Returns `true` while a workflow task for `identifier` is alive.
    pub async fn is_running(&self, identifier: &Identifier) -> bool {
        self.slot(identifier)
            .lock()
            .await
            .running
            .as_ref()
            .is_some_and(|workflow| !workflow.handle.is_finished())
    }

    fn slot(&self, identifier: &Identifier) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(identifier.clone()).or_default())
    }

    /// Deletes every instance tagged for `identifier`. Two can exist when a
    /// create was accepted by the provider but its reply was lost.
    async fn teardown(&self, identifier: &Identifier) -> Result<(), SupervisorError> {
        let prefix = self.orchestrator.name_prefix();
        let name = identifier.instance_name(prefix);
        let cloud = self.orchestrator.cloud();
        let tagged = cloud
            .list_by_tag(&identifier.instance_tag(prefix))
            .await
            .map_err(|source| SupervisorError::Teardown {
                name: name.clone(),
                source,
            })?;
        for instance in tagged {
            cloud
                .delete(&instance.id)
                .await
                .map_err(|source| SupervisorError::Teardown {
                    name: name.clone(),
                    source,
                })?;
            info!(identifier = %identifier, instance_id = %instance.id, "instance deleted");
        }
        self.orchestrator.registry().remove(identifier)?;
        self.orchestrator
            .store()
            .set(identifier, ProvisioningState::creating());
        Ok(())
    }

    async fn finish(&self, identifier: &Identifier, run_id: u64) {
        let slot = self.slot(identifier);
        let mut slot = slot.lock().await;
        if slot
            .running
            .as_ref()
            .is_some_and(|workflow| workflow.run_id == run_id)
        {
            slot.running = None;
        }
    }
}

async fn stop(workflow: RunningWorkflow) {
    workflow.handle.abort();
    if let Err(err) = workflow.handle.await
        && !err.is_cancelled()
    {
        warn!(run_id = workflow.run_id, error = %err, "provisioning task ended abnormally");
    }
}
