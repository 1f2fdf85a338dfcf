//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `botfleet.toml`, and environment variables in that
//! order of precedence.

use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::orchestrator::{AppLayout, StagePolicies, WorkflowSettings};
use crate::probe::RetryPolicy;
use crate::supervisor::ConflictPolicy;

/// Default DigitalOcean API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com";

/// DigitalOcean account and droplet shape settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DIGITALOCEAN",
    discovery(
        app_name = "botfleet",
        env_var = "BOTFLEET_CONFIG_PATH",
        config_file_name = "botfleet.toml",
        dotfile_name = ".botfleet.toml",
        project_file_name = "botfleet.toml"
    )
)]
pub struct DigitalOceanConfig {
    /// Personal access token used as the bearer credential. Required.
    pub token: String,
    /// Region slug for new droplets.
    #[ortho_config(default = "nyc3".to_owned())]
    pub region: String,
    /// Size slug for new droplets.
    #[ortho_config(default = "s-1vcpu-1gb".to_owned())]
    pub size: String,
    /// Image slug or snapshot identifier with the bot application installed.
    pub image: String,
    /// Comma separated SSH key fingerprints or identifiers to install.
    pub ssh_keys: Option<String>,
    /// Prefix for droplet names and tags. Also the fleet tag.
    #[ortho_config(default = "botfleet".to_owned())]
    pub name_prefix: String,
    /// API endpoint, overridable for testing.
    #[ortho_config(default = DEFAULT_API_BASE.to_owned())]
    pub api_base: String,
    /// Per-request timeout in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
}

/// Workflow, application layout, and service settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BOTFLEET",
    discovery(
        app_name = "botfleet",
        env_var = "BOTFLEET_CONFIG_PATH",
        config_file_name = "botfleet.toml",
        dotfile_name = ".botfleet.toml",
        project_file_name = "botfleet.toml"
    )
)]
pub struct ProvisionerConfig {
    /// Port the bot application serves its pairing artifact on.
    #[ortho_config(default = 3000)]
    pub app_port: u16,
    /// Application directory on the instance, holding `.env`.
    #[ortho_config(default = "/opt/bot".to_owned())]
    pub app_dir: String,
    /// Runtime executable that launches the application.
    #[ortho_config(default = "/usr/bin/node".to_owned())]
    pub runtime_path: String,
    /// Entrypoint passed to the runtime, relative to `app_dir`.
    #[ortho_config(default = "index.js".to_owned())]
    pub entrypoint: String,
    /// Directory receiving application logs.
    #[ortho_config(default = "/var/log/bot".to_owned())]
    pub log_dir: String,
    /// Log file name inside `log_dir`.
    #[ortho_config(default = "bot.log".to_owned())]
    pub log_file_name: String,
    /// Pause after deleting a previous instance.
    #[ortho_config(default = 5)]
    pub reclaim_settle_secs: u64,
    /// Attempts for the create call.
    #[ortho_config(default = 2)]
    pub create_attempts: u32,
    /// Delay between create attempts.
    #[ortho_config(default = 5)]
    pub create_delay_secs: u64,
    /// Attempts while waiting for the instance to become active.
    #[ortho_config(default = 30)]
    pub active_attempts: u32,
    /// Interval between active checks.
    #[ortho_config(default = 10)]
    pub active_interval_secs: u64,
    /// Pause after activation before reading the address.
    #[ortho_config(default = 20)]
    pub boot_settle_secs: u64,
    /// Attempts while waiting for SSH.
    #[ortho_config(default = 20)]
    pub ssh_attempts: u32,
    /// Interval between SSH checks.
    #[ortho_config(default = 10)]
    pub ssh_interval_secs: u64,
    /// Pause after launching the application before checking its process.
    #[ortho_config(default = 5)]
    pub launch_settle_secs: u64,
    /// Attempts while waiting for the pairing artifact.
    #[ortho_config(default = 12)]
    pub app_attempts: u32,
    /// Interval between artifact checks.
    #[ortho_config(default = 5)]
    pub app_interval_secs: u64,
    /// Timeout for one artifact request.
    #[ortho_config(default = 5)]
    pub app_probe_timeout_secs: u64,
    /// Delete the instance created by a run that later fails.
    #[ortho_config(default = true)]
    pub cleanup_on_failure: bool,
    /// Behaviour when a workflow is already running: `reject` or `relaunch`.
    #[ortho_config(default = "reject".to_owned())]
    pub conflict_policy: String,
    /// Directory holding completed instance records.
    #[ortho_config(default = "/var/lib/botfleet/registry".to_owned())]
    pub registry_dir: String,
    /// Socket address for the HTTP API.
    #[ortho_config(default = "0.0.0.0:8080".to_owned())]
    pub listen_addr: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in botfleet.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl DigitalOceanConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("botfleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty,
    /// or [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.token,
            &FieldMetadata::new(
                "DigitalOcean API token",
                "DIGITALOCEAN_TOKEN",
                "token",
                "digitalocean",
            ),
        )?;
        require_field(
            &self.image,
            &FieldMetadata::new(
                "droplet image",
                "DIGITALOCEAN_IMAGE",
                "image",
                "digitalocean",
            ),
        )?;
        require_field(
            &self.region,
            &FieldMetadata::new(
                "droplet region",
                "DIGITALOCEAN_REGION",
                "region",
                "digitalocean",
            ),
        )?;
        require_field(
            &self.size,
            &FieldMetadata::new("droplet size", "DIGITALOCEAN_SIZE", "size", "digitalocean"),
        )?;
        require_field(
            &self.name_prefix,
            &FieldMetadata::new(
                "droplet name prefix",
                "DIGITALOCEAN_NAME_PREFIX",
                "name_prefix",
                "digitalocean",
            ),
        )?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "request_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// SSH key identifiers parsed from the comma separated setting.
    #[must_use]
    pub fn ssh_key_list(&self) -> Vec<String> {
        self.ssh_keys
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ProvisionerConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("botfleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, description, env_var, key) in [
            (&self.app_dir, "application directory", "BOTFLEET_APP_DIR", "app_dir"),
            (
                &self.runtime_path,
                "runtime path",
                "BOTFLEET_RUNTIME_PATH",
                "runtime_path",
            ),
            (
                &self.entrypoint,
                "application entrypoint",
                "BOTFLEET_ENTRYPOINT",
                "entrypoint",
            ),
            (&self.log_dir, "log directory", "BOTFLEET_LOG_DIR", "log_dir"),
            (
                &self.log_file_name,
                "log file name",
                "BOTFLEET_LOG_FILE_NAME",
                "log_file_name",
            ),
            (
                &self.registry_dir,
                "registry directory",
                "BOTFLEET_REGISTRY_DIR",
                "registry_dir",
            ),
        ] {
            require_field(
                value,
                &FieldMetadata::new(description, env_var, key, "botfleet"),
            )?;
        }
        if self.app_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "app_port must be greater than zero",
            )));
        }
        self.conflict_policy()?;
        self.listen_addr()?;
        Ok(())
    }

    /// Parsed conflict policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown policy names.
    pub fn conflict_policy(&self) -> Result<ConflictPolicy, ConfigError> {
        self.conflict_policy.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "conflict_policy must be `reject` or `relaunch`, got `{}`",
                self.conflict_policy
            ))
        })
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "listen_addr `{}` is not a socket address",
                self.listen_addr
            ))
        })
    }

    /// Registry directory as a UTF-8 path.
    #[must_use]
    pub fn registry_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.registry_dir)
    }

    /// Timeout for a single artifact request.
    #[must_use]
    pub const fn app_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.app_probe_timeout_secs)
    }

    /// Orchestrator settings derived from this configuration.
    #[must_use]
    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            layout: AppLayout {
                app_dir: self.app_dir.clone(),
                runtime_path: self.runtime_path.clone(),
                entrypoint: self.entrypoint.clone(),
                log_dir: self.log_dir.clone(),
                log_file_name: self.log_file_name.clone(),
                port: self.app_port,
            },
            policies: StagePolicies {
                create: RetryPolicy::fixed(
                    self.create_attempts,
                    Duration::from_secs(self.create_delay_secs),
                ),
                instance_active: RetryPolicy::fixed(
                    self.active_attempts,
                    Duration::from_secs(self.active_interval_secs),
                ),
                shell_reachable: RetryPolicy::fixed(
                    self.ssh_attempts,
                    Duration::from_secs(self.ssh_interval_secs),
                ),
                app_ready: RetryPolicy::fixed(
                    self.app_attempts,
                    Duration::from_secs(self.app_interval_secs),
                ),
            },
            reclaim_settle: Duration::from_secs(self.reclaim_settle_secs),
            boot_settle: Duration::from_secs(self.boot_settle_secs),
            launch_settle: Duration::from_secs(self.launch_settle_secs),
            cleanup_on_failure: self.cleanup_on_failure,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
