//! Binary entry point for the botfleet CLI.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use botfleet::config::{ConfigError, DigitalOceanConfig, ProvisionerConfig};
use botfleet::digitalocean::DigitalOceanClient;
use botfleet::identifier::Identifier;
use botfleet::janitor::{Janitor, JanitorConfig, JanitorError};
use botfleet::orchestrator::{
    BotSettings, FeatureFlags, ProvisionError, ProvisioningOrchestrator, ProvisioningRequest,
};
use botfleet::probe::HttpArtifactProbe;
use botfleet::registry::{FileRegistry, InstanceRegistry};
use botfleet::session::{ProcessCommandRunner, SessionConfig, SessionDriver};
use botfleet::state::{MemoryStateStore, StateStore};
use botfleet::supervisor::{Supervisor, SupervisorError};

mod cli;

use cli::{Cli, ProvisionCommand, ServeCommand, SweepCommand, TeardownCommand};

type LiveOrchestrator =
    ProvisioningOrchestrator<DigitalOceanClient, ProcessCommandRunner, HttpArtifactProbe>;
type LiveSupervisor = Supervisor<DigitalOceanClient, ProcessCommandRunner, HttpArtifactProbe>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("sweep failed: {0}")]
    Sweep(#[from] JanitorError),
    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Collaborators built from the layered configuration.
struct Wiring {
    cloud: Arc<DigitalOceanClient>,
    registry: Arc<FileRegistry>,
    provisioner: ProvisionerConfig,
    session: SessionConfig,
    name_prefix: String,
}

impl Wiring {
    fn load() -> Result<Self, CliError> {
        let cloud_config = DigitalOceanConfig::load_without_cli_args()?;
        cloud_config.validate()?;
        let provisioner = ProvisionerConfig::load_without_cli_args()?;
        provisioner.validate()?;
        let session = SessionConfig::load_without_cli_args()
            .map_err(|err| CliError::Config(err.to_string()))?;

        let name_prefix = cloud_config.name_prefix.clone();
        let cloud = DigitalOceanClient::new(cloud_config)?;
        let registry = FileRegistry::new(provisioner.registry_dir());
        Ok(Self {
            cloud: Arc::new(cloud),
            registry: Arc::new(registry),
            provisioner,
            session,
            name_prefix,
        })
    }

    fn orchestrator(&self) -> Result<Arc<LiveOrchestrator>, CliError> {
        let driver = SessionDriver::with_process_runner(self.session.clone())
            .map_err(|err| CliError::Config(err.to_string()))?;
        let probe = HttpArtifactProbe::new(
            self.provisioner.app_port,
            self.provisioner.app_probe_timeout(),
        )?;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let registry: Arc<dyn InstanceRegistry> = self.registry.clone();
        Ok(Arc::new(ProvisioningOrchestrator::new(
            Arc::clone(&self.cloud),
            driver,
            Arc::new(probe),
            store,
            registry,
            self.provisioner.workflow_settings(),
            self.name_prefix.clone(),
        )))
    }

    fn supervisor(&self) -> Result<Arc<LiveSupervisor>, CliError> {
        let policy = self.provisioner.conflict_policy()?;
        Ok(Arc::new(Supervisor::new(self.orchestrator()?, policy)))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Serve(command) => serve(command).await,
        Cli::Provision(command) => provision(command).await,
        Cli::Teardown(command) => teardown(command).await,
        Cli::Sweep(command) => sweep(command).await,
    }
}

async fn serve(command: ServeCommand) -> Result<(), CliError> {
    let wiring = Wiring::load()?;
    let addr = match command.listen {
        Some(raw) => raw
            .parse::<SocketAddr>()
            .map_err(|err| CliError::Config(format!("invalid listen address {raw}: {err}")))?,
        None => wiring.provisioner.listen_addr()?,
    };
    let app = botfleet::http::router(wiring.supervisor()?);
    let listener = TcpListener::bind(addr).await?;
    botfleet::http::serve(listener, app).await?;
    Ok(())
}

async fn provision(command: ProvisionCommand) -> Result<(), CliError> {
    let request = provisioning_request(command)?;
    let wiring = Wiring::load()?;
    let record = wiring.orchestrator()?.run(&request).await?;
    writeln!(
        io::stdout(),
        "provisioned {} at {} (instance {})",
        record.identifier,
        record.ip,
        record.instance_id
    )?;
    Ok(())
}

async fn teardown(command: TeardownCommand) -> Result<(), CliError> {
    let identifier = parse_identifier(&command.identifier)?;
    let wiring = Wiring::load()?;
    wiring.supervisor()?.reset(&identifier).await?;
    writeln!(io::stdout(), "torn down {identifier}")?;
    Ok(())
}

async fn sweep(command: SweepCommand) -> Result<(), CliError> {
    let wiring = Wiring::load()?;
    let config = JanitorConfig::new(
        wiring.name_prefix.clone(),
        command.min_age_minutes,
        command.dry_run,
    )?;
    let registry: Arc<dyn InstanceRegistry> = wiring.registry.clone();
    let janitor = Janitor::new(config, Arc::clone(&wiring.cloud), registry);
    let summary = janitor.sweep().await?;
    let verb = if command.dry_run { "would delete" } else { "deleted" };
    writeln!(
        io::stdout(),
        "sweep complete: inspected={}, {verb}={}, kept_registered={}, kept_young={}",
        summary.inspected,
        summary.deleted.len(),
        summary.kept_registered,
        summary.kept_young
    )?;
    for name in &summary.deleted {
        writeln!(io::stdout(), "  {name}")?;
    }
    Ok(())
}

fn parse_identifier(raw: &str) -> Result<Identifier, CliError> {
    Identifier::parse(raw).map_err(|err| CliError::Request(err.to_string()))
}

fn provisioning_request(command: ProvisionCommand) -> Result<ProvisioningRequest, CliError> {
    let identifier = parse_identifier(&command.identifier)?;
    let settings = BotSettings {
        company_name: command.company_name,
        address: command.address,
        features: FeatureFlags {
            appointments: command.appointments,
            catalog: command.catalog,
            human_handoff: command.human_handoff,
        },
    };
    ProvisioningRequest::new(identifier, command.display_name, settings)
        .map_err(|err| CliError::Request(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
