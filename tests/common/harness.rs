//! Shared orchestrator wiring for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Include this module with:
//!
//! ```rust
//! #[path = "common/harness.rs"]
//! mod harness;
//! ```

#![expect(dead_code, reason = "each test crate uses a different subset of the helpers")]

use std::sync::Arc;
use std::time::Duration;

use botfleet::identifier::Identifier;
use botfleet::orchestrator::{
    AppLayout, BotSettings, FeatureFlags, ProvisioningOrchestrator, ProvisioningRequest,
    StagePolicies, WorkflowSettings,
};
use botfleet::probe::RetryPolicy;
use botfleet::registry::MemoryRegistry;
use botfleet::session::{SessionConfig, SessionDriver};
use botfleet::supervisor::{ConflictPolicy, Supervisor};
use botfleet::test_support::{FakeArtifactProbe, FakeCloud, FakeShell, RecordingStateStore};

pub const IDENTIFIER: &str = "5511999998888";

pub type FakeOrchestrator = ProvisioningOrchestrator<FakeCloud, FakeShell, FakeArtifactProbe>;
pub type FakeSupervisor = Supervisor<FakeCloud, FakeShell, FakeArtifactProbe>;

pub fn identifier() -> Identifier {
    Identifier::parse(IDENTIFIER).unwrap_or_else(|err| panic!("identifier: {err}"))
}

pub fn request() -> ProvisioningRequest {
    ProvisioningRequest::new(
        identifier(),
        Some(String::from("Acme Bot")),
        BotSettings {
            company_name: String::from("Acme"),
            address: String::from("1 Main St"),
            features: FeatureFlags {
                appointments: true,
                catalog: false,
                human_handoff: true,
            },
        },
    )
    .unwrap_or_else(|err| panic!("request: {err}"))
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        ssh_bin: String::from("ssh"),
        sshpass_bin: String::from("sshpass"),
        user: String::from("root"),
        port: 22,
        connect_timeout_secs: 10,
        command_timeout_secs: 120,
        server_alive_interval_secs: 15,
        control_dir: String::from("/tmp"),
        control_persist_secs: 600,
        known_hosts_file: String::from("/dev/null"),
    }
}

/// Settings with every wait collapsed to zero.
pub fn instant_settings() -> WorkflowSettings {
    WorkflowSettings {
        layout: AppLayout::default(),
        policies: StagePolicies {
            create: RetryPolicy::immediate(2),
            instance_active: RetryPolicy::immediate(5),
            shell_reachable: RetryPolicy::immediate(3),
            app_ready: RetryPolicy::immediate(4),
        },
        reclaim_settle: Duration::ZERO,
        boot_settle: Duration::ZERO,
        launch_settle: Duration::ZERO,
        cleanup_on_failure: true,
    }
}

pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub shell: FakeShell,
    pub probe: Arc<FakeArtifactProbe>,
    pub store: Arc<RecordingStateStore>,
    pub registry: Arc<MemoryRegistry>,
    pub orchestrator: Arc<FakeOrchestrator>,
}

impl Harness {
    pub fn new(probe: FakeArtifactProbe) -> Self {
        Self::with_settings(probe, instant_settings())
    }

    pub fn with_settings(probe: FakeArtifactProbe, settings: WorkflowSettings) -> Self {
        let cloud = Arc::new(FakeCloud::new());
        let shell = FakeShell::new();
        let probe = Arc::new(probe);
        let store = Arc::new(RecordingStateStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        let driver = SessionDriver::new(session_config(), shell.clone())
            .unwrap_or_else(|err| panic!("driver: {err}"));
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            Arc::clone(&cloud),
            driver,
            Arc::clone(&probe),
            store.clone(),
            registry.clone(),
            settings,
            "botfleet",
        ));
        Self {
            cloud,
            shell,
            probe,
            store,
            registry,
            orchestrator,
        }
    }

    pub fn supervisor(&self, policy: ConflictPolicy) -> Arc<FakeSupervisor> {
        Arc::new(Supervisor::new(Arc::clone(&self.orchestrator), policy))
    }
}
