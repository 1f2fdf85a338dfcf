//! Core library for botfleet, a provisioner of dedicated messaging-bot
//! droplets.
//!
//! A provisioning run reclaims any previous instance for an identifier,
//! creates a DigitalOcean droplet, waits for it to boot and accept SSH,
//! configures and launches the bot application, and waits for its pairing
//! QR code. Progress is published to a [`state::StateStore`] that the HTTP
//! status endpoint reads.

pub mod backend;
pub mod boot_script;
pub mod config;
pub mod digitalocean;
pub mod http;
pub mod identifier;
pub mod janitor;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod test_support;

pub use backend::{CloudClient, Instance, InstanceId, InstanceSpec, ProviderError};
pub use config::{ConfigError, DigitalOceanConfig, ProvisionerConfig};
pub use digitalocean::DigitalOceanClient;
pub use identifier::{Identifier, IdentifierError};
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepSummary};
pub use orchestrator::{
    ProvisionError, ProvisioningOrchestrator, ProvisioningRequest, WorkflowSettings,
};
pub use registry::{FileRegistry, InstanceRecord, InstanceRegistry, MemoryRegistry};
pub use session::{ProcessCommandRunner, SessionConfig, SessionDriver, SessionError};
pub use state::{MemoryStateStore, ProvisioningState, ProvisioningStatus, StateStore};
pub use supervisor::{ConflictPolicy, StartOutcome, Supervisor, SupervisorError};
