//! Multi-stage provisioning workflow for one identifier.
//!
//! A run reclaims any previous instance, creates a droplet, waits for it to
//! become active and reachable over SSH, configures and launches the bot
//! application, and finally waits for the pairing QR code. Every transition
//! is published to the [`StateStore`]; that is the only channel between a
//! detached run and the status endpoint.
//!
//! Progress by stage:
//!
//! | status             | progress |
//! |--------------------|----------|
//! | `creating`         | 0        |
//! | `creating_droplet` | 25       |
//! | `waiting_for_ssh`  | 50       |
//! | `configuring`      | 75       |
//! | `completed`        | 100      |
//!
//! `failed` keeps whatever progress the run had reached.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::backend::{CloudClient, Instance, InstanceId, InstanceSpec, ProviderError};
use crate::boot_script::{RootPassword, render_boot_script};
use crate::identifier::Identifier;
use crate::probe::{
    ArtifactProbe, ProbeOutcome, RetryPolicy, instance_active, poll_with_policy, retry_if,
    shell_reachable,
};
use crate::registry::{InstanceRecord, InstanceRegistry};
use crate::session::{CommandRunner, Credentials, SessionDriver};
use crate::state::{InstanceInfo, ProvisioningStatus, StateStore};

mod configure;
mod error;
mod reporter;

pub use configure::{
    LOG_TAIL_LINES, env_entries, env_upsert_command, free_port_command, launch_command,
    log_dir_command, log_tail_command, process_check_command, runtime_check_command,
};
pub use error::{ProvisionError, RequestError};

use reporter::StageReporter;

/// Feature toggles written into the bot configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FeatureFlags {
    /// Appointment booking.
    pub appointments: bool,
    /// Product catalogue.
    pub catalog: bool,
    /// Hand-off to a human operator.
    pub human_handoff: bool,
}

impl FeatureFlags {
    /// Environment keys and `true`/`false` values for each flag.
    #[must_use]
    pub const fn env_entries(&self) -> [(&'static str, &'static str); 3] {
        [
            ("FEATURE_APPOINTMENTS", bool_text(self.appointments)),
            ("FEATURE_CATALOG", bool_text(self.catalog)),
            ("FEATURE_HUMAN_HANDOFF", bool_text(self.human_handoff)),
        ]
    }
}

const fn bool_text(enabled: bool) -> &'static str {
    if enabled { "true" } else { "false" }
}

/// Business settings the bot is configured with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BotSettings {
    /// Company name. Must not be blank.
    pub company_name: String,
    /// Postal address.
    pub address: String,
    /// Enabled features.
    pub features: FeatureFlags,
}

/// Immutable input to one provisioning run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisioningRequest {
    /// Identifier the instance will serve.
    pub identifier: Identifier,
    /// Name shown by the bot.
    pub display_name: String,
    /// Business settings.
    pub settings: BotSettings,
}

impl ProvisioningRequest {
    /// Builds a request, defaulting the display name to the company name.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::MissingCompanyName`] when the company name is
    /// blank.
    pub fn new(
        identifier: Identifier,
        display_name: Option<String>,
        settings: BotSettings,
    ) -> Result<Self, RequestError> {
        if settings.company_name.trim().is_empty() {
            return Err(RequestError::MissingCompanyName);
        }
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| settings.company_name.clone());
        Ok(Self {
            identifier,
            display_name,
            settings,
        })
    }
}

/// Where the bot application lives on the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppLayout {
    /// Application directory holding `.env`.
    pub app_dir: String,
    /// Runtime executable.
    pub runtime_path: String,
    /// Entrypoint passed to the runtime.
    pub entrypoint: String,
    /// Log directory.
    pub log_dir: String,
    /// Log file name inside `log_dir`.
    pub log_file_name: String,
    /// Port serving the pairing artifact.
    pub port: u16,
}

impl AppLayout {
    /// Path of the application's `.env` file.
    #[must_use]
    pub fn env_file(&self) -> String {
        format!("{}/.env", self.app_dir.trim_end_matches('/'))
    }

    /// Path of the application log file.
    #[must_use]
    pub fn log_file(&self) -> String {
        format!(
            "{}/{}",
            self.log_dir.trim_end_matches('/'),
            self.log_file_name
        )
    }
}

impl Default for AppLayout {
    fn default() -> Self {
        Self {
            app_dir: String::from("/opt/bot"),
            runtime_path: String::from("/usr/bin/node"),
            entrypoint: String::from("index.js"),
            log_dir: String::from("/var/log/bot"),
            log_file_name: String::from("bot.log"),
            port: 3000,
        }
    }
}

/// Retry policy for each stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StagePolicies {
    /// Create call.
    pub create: RetryPolicy,
    /// Waiting for the provider to report the instance active.
    pub instance_active: RetryPolicy,
    /// Waiting for SSH.
    pub shell_reachable: RetryPolicy,
    /// Waiting for the pairing artifact.
    pub app_ready: RetryPolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            create: RetryPolicy::fixed(2, Duration::from_secs(5)),
            instance_active: RetryPolicy::fixed(30, Duration::from_secs(10)),
            shell_reachable: RetryPolicy::fixed(20, Duration::from_secs(10)),
            app_ready: RetryPolicy::fixed(12, Duration::from_secs(5)),
        }
    }
}

/// Tunables for a provisioning run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowSettings {
    /// Application layout on the instance.
    pub layout: AppLayout,
    /// Per-stage retry policies.
    pub policies: StagePolicies,
    /// Pause after deleting a previous instance.
    pub reclaim_settle: Duration,
    /// Pause between activation and reading the address.
    pub boot_settle: Duration,
    /// Pause between launching the application and checking its process.
    pub launch_settle: Duration,
    /// Delete the instance created by a run that later fails.
    pub cleanup_on_failure: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            layout: AppLayout::default(),
            policies: StagePolicies::default(),
            reclaim_settle: Duration::from_secs(5),
            boot_settle: Duration::from_secs(20),
            launch_settle: Duration::from_secs(5),
            cleanup_on_failure: true,
        }
    }
}

/// Runs provisioning workflows against injected collaborators.
pub struct ProvisioningOrchestrator<C, R, P>
where
    C: CloudClient,
    R: CommandRunner,
    P: ArtifactProbe,
{
    cloud: Arc<C>,
    driver: SessionDriver<R>,
    artifact_probe: Arc<P>,
    store: Arc<dyn StateStore>,
    registry: Arc<dyn InstanceRegistry>,
    settings: WorkflowSettings,
    name_prefix: String,
}

impl<C, R, P> ProvisioningOrchestrator<C, R, P>
where
    C: CloudClient,
    R: CommandRunner,
    P: ArtifactProbe,
{
    /// Wires an orchestrator. `name_prefix` names instances and tags.
    #[must_use]
    pub fn new(
        cloud: Arc<C>,
        driver: SessionDriver<R>,
        artifact_probe: Arc<P>,
        store: Arc<dyn StateStore>,
        registry: Arc<dyn InstanceRegistry>,
        settings: WorkflowSettings,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            driver,
            artifact_probe,
            store,
            registry,
            settings,
            name_prefix: name_prefix.into(),
        }
    }

    /// Cloud client used by this orchestrator.
    #[must_use]
    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    /// State store written by runs.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Registry of completed instances.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn InstanceRegistry> {
        &self.registry
    }

    /// Prefix for instance names and tags.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Runs the full workflow, publishing each transition.
    ///
    /// On failure the state becomes `failed` with the error text and, when
    /// enabled, every instance this run may have created is deleted. That
    /// covers creates the provider accepted but never confirmed.
    ///
    /// # Errors
    ///
    /// Returns the [`ProvisionError`] that ended the run.
    #[instrument(skip_all, fields(identifier = %request.identifier))]
    pub async fn run(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<InstanceRecord, ProvisionError> {
        let mut reporter =
            StageReporter::start(Arc::clone(&self.store), request.identifier.clone());
        let mut created = CreateAttempt::NotAttempted;
        let result = self.execute(request, &mut reporter, &mut created).await;

        match &result {
            Ok(record) => info!(
                ip = %record.ip,
                instance_id = %record.instance_id,
                "provisioning completed"
            ),
            Err(err) => {
                reporter.fail(&err.to_string());
                if self.settings.cleanup_on_failure {
                    self.discard_instances(&request.identifier, created).await;
                }
            }
        }
        result
    }

    async fn execute(
        &self,
        request: &ProvisioningRequest,
        reporter: &mut StageReporter,
        created: &mut CreateAttempt,
    ) -> Result<InstanceRecord, ProvisionError> {
        let identifier = &request.identifier;
        self.reclaim(identifier).await?;

        let password = RootPassword::generate();
        *created = CreateAttempt::Unconfirmed;
        let instance_id = self.create_instance(request, &password).await?;
        *created = CreateAttempt::Created(instance_id.clone());
        reporter.advance(ProvisioningStatus::CreatingDroplet);

        let (instance, ip) = self.await_active(&instance_id).await?;
        let info = instance_info(&instance, ip);
        reporter.advance_with_info(ProvisioningStatus::WaitingForSsh, info.clone());

        let target = self
            .driver
            .config()
            .target(ip.to_string(), Credentials::Password(password.expose().to_owned()));
        match poll_with_policy(
            || shell_reachable(&self.driver, &target),
            &self.settings.policies.shell_reachable,
        )
        .await
        {
            ProbeOutcome::Ready { attempts, .. } => info!(attempts, "ssh reachable"),
            ProbeOutcome::TimedOut {
                attempts,
                last_reason,
            } => {
                return Err(ProvisionError::ProbeTimeout {
                    probe: "ssh",
                    attempts,
                    last_reason,
                });
            }
        }
        reporter.advance(ProvisioningStatus::Configuring);

        let layout = &self.settings.layout;
        let launch_settle = self.settings.launch_settle;
        self.driver
            .with_session(&target, |session| {
                configure::configure_and_launch(session, layout, request, launch_settle)
            })
            .await?;

        match poll_with_policy(
            || self.artifact_probe.check(ip),
            &self.settings.policies.app_ready,
        )
        .await
        {
            ProbeOutcome::Ready { attempts, .. } => info!(attempts, "pairing QR code available"),
            ProbeOutcome::TimedOut {
                attempts,
                last_reason,
            } => {
                return Err(ProvisionError::QrTimeout {
                    attempts,
                    last_reason,
                });
            }
        }

        let record = InstanceRecord {
            identifier: identifier.clone(),
            ip: info.ip.clone(),
            instance_id: info.id.clone(),
            name: info.name.clone(),
            recorded_at: Utc::now(),
        };
        self.registry
            .put(&record)
            .map_err(ProvisionError::Registry)?;
        reporter.advance(ProvisioningStatus::Completed);
        Ok(record)
    }

    async fn reclaim(&self, identifier: &Identifier) -> Result<(), ProvisionError> {
        let tag = identifier.instance_tag(&self.name_prefix);
        let previous = self
            .cloud
            .list_by_tag(&tag)
            .await
            .map_err(ProvisionError::Reclaim)?;
        if previous.is_empty() {
            return Ok(());
        }
        for instance in &previous {
            info!(instance_id = %instance.id, name = %instance.name, "deleting previous instance");
            self.cloud
                .delete(&instance.id)
                .await
                .map_err(ProvisionError::Reclaim)?;
        }
        tokio::time::sleep(self.settings.reclaim_settle).await;
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &ProvisioningRequest,
        password: &RootPassword,
    ) -> Result<InstanceId, ProvisionError> {
        let identifier = &request.identifier;
        let spec = InstanceSpec {
            name: identifier.instance_name(&self.name_prefix),
            tags: vec![
                identifier.instance_tag(&self.name_prefix),
                self.name_prefix.clone(),
            ],
            boot_script: render_boot_script(password, &request.settings.features),
        };
        let instance_id = retry_if(
            &self.settings.policies.create,
            "create",
            |_: &ProviderError| true,
            || self.cloud.create(&spec),
        )
        .await
        .map_err(ProvisionError::Creation)?;
        info!(instance_id = %instance_id, name = %spec.name, "instance created");
        Ok(instance_id)
    }

    async fn await_active(
        &self,
        instance_id: &InstanceId,
    ) -> Result<(Instance, Ipv4Addr), ProvisionError> {
        let cloud = &*self.cloud;
        match poll_with_policy(
            || instance_active(cloud, instance_id),
            &self.settings.policies.instance_active,
        )
        .await
        {
            ProbeOutcome::Ready { attempts, .. } => info!(attempts, "instance active"),
            ProbeOutcome::TimedOut {
                attempts,
                last_reason,
            } => {
                return Err(ProvisionError::ProbeTimeout {
                    probe: "instance_active",
                    attempts,
                    last_reason,
                });
            }
        }

        tokio::time::sleep(self.settings.boot_settle).await;

        let instance = self
            .cloud
            .get(instance_id)
            .await
            .map_err(|source| ProvisionError::InstanceLookup {
                instance_id: instance_id.to_string(),
                source,
            })?
            .ok_or_else(|| ProvisionError::MissingPublicIp {
                instance_id: instance_id.to_string(),
            })?;
        let ip = instance
            .public_ipv4
            .ok_or_else(|| ProvisionError::MissingPublicIp {
                instance_id: instance_id.to_string(),
            })?;
        Ok((instance, ip))
    }

    async fn discard_instances(&self, identifier: &Identifier, created: CreateAttempt) {
        let mut doomed = match created {
            CreateAttempt::NotAttempted => return,
            CreateAttempt::Unconfirmed => Vec::new(),
            CreateAttempt::Created(instance_id) => vec![instance_id],
        };
        let tag = identifier.instance_tag(&self.name_prefix);
        match self.cloud.list_by_tag(&tag).await {
            Ok(tagged) => {
                for instance in tagged {
                    if !doomed.contains(&instance.id) {
                        doomed.push(instance.id);
                    }
                }
            }
            Err(err) => warn!(tag = %tag, error = %err, "failed to list instances from failed run"),
        }
        for instance_id in &doomed {
            match self.cloud.delete(instance_id).await {
                Ok(()) => info!(instance_id = %instance_id, "deleted instance from failed run"),
                Err(err) => warn!(
                    instance_id = %instance_id,
                    error = %err,
                    "failed to delete instance from failed run"
                ),
            }
        }
    }
}

/// How far a run got with creating its instance.
#[derive(Debug)]
enum CreateAttempt {
    NotAttempted,
    /// A create was sent; the provider may have accepted it without replying.
    Unconfirmed,
    Created(InstanceId),
}

fn instance_info(instance: &Instance, ip: Ipv4Addr) -> InstanceInfo {
    InstanceInfo {
        ip: ip.to_string(),
        name: instance.name.clone(),
        status: instance.status.clone(),
        created_at: instance.created_at,
        id: instance.id.to_string(),
    }
}
