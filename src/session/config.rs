//! SSH session configuration structures and validation.
//!
//! [`SessionConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::{Credentials, SessionTarget};
use crate::probe::{Classify, Retryability};

/// Default directory for SSH control sockets.
pub const DEFAULT_CONTROL_DIR: &str = "/tmp";

/// SSH settings used by the remote session driver.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BOTFLEET_SSH",
    discovery(
        app_name = "botfleet",
        env_var = "BOTFLEET_CONFIG_PATH",
        config_file_name = "botfleet.toml",
        dotfile_name = ".botfleet.toml",
        project_file_name = "botfleet.toml"
    )
)]
pub struct SessionConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable used for password credentials.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// TCP port of the remote SSH daemon.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Seconds allowed for the TCP connect and authentication handshake.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Seconds a single remote command may run before the session is
    /// treated as dropped.
    #[ortho_config(default = 120)]
    pub command_timeout_secs: u64,
    /// Seconds between keepalive probes on an idle connection.
    #[ortho_config(default = 15)]
    pub server_alive_interval_secs: u64,
    /// Directory holding control master sockets.
    #[ortho_config(default = DEFAULT_CONTROL_DIR.to_owned())]
    pub control_dir: String,
    /// Idle lifetime of a control master that was never closed explicitly.
    #[ortho_config(default = 600)]
    pub control_persist_secs: u64,
    /// Known hosts file override; freshly booted hosts have unknown keys.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
}

/// Errors raised when loading the session configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SessionConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SessionConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when any required field is
    /// empty or zero.
    pub fn validate(&self) -> Result<(), SessionError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.sshpass_bin, "sshpass_bin")?;
        Self::require_value(&self.user, "user")?;
        Self::require_value(&self.control_dir, "control_dir")?;
        if self.port == 0 {
            return Err(SessionError::InvalidConfig {
                field: String::from("port"),
            });
        }
        for (value, field) in [
            (self.connect_timeout_secs, "connect_timeout_secs"),
            (self.command_timeout_secs, "command_timeout_secs"),
            (self.server_alive_interval_secs, "server_alive_interval_secs"),
        ] {
            if value == 0 {
                return Err(SessionError::InvalidConfig {
                    field: field.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Deadline applied to each remote command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SessionConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SessionConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("botfleet")])
            .map_err(|err| SessionConfigLoadError::Parse(err.to_string()))
    }

    /// Builds a target for `host` using the configured user and port.
    #[must_use]
    pub fn target(&self, host: impl Into<String>, credentials: Credentials) -> SessionTarget {
        SessionTarget {
            host: host.into(),
            port: self.port,
            user: self.user.clone(),
            credentials,
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SessionError> {
        if value.trim().is_empty() {
            return Err(SessionError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}

/// Errors surfaced while connecting to or executing on a remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when configuration is missing required values.
    #[error(
        "missing {field}: set BOTFLEET_SSH_{env_suffix} or add {field} to [ssh] in botfleet.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a local command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the control master cannot be established.
    #[error("could not open ssh session to {host}: {message}")]
    Connect {
        /// Remote host.
        host: String,
        /// Failure detail.
        message: String,
    },
    /// Raised when the transport drops while a command runs.
    #[error("ssh session to {host} dropped: {message}")]
    Disconnected {
        /// Remote host.
        host: String,
        /// Failure detail.
        message: String,
    },
    /// Raised when a must-succeed command exits non-zero or writes stderr.
    #[error("remote command `{command}` failed with status {status_text}: {stderr}")]
    CommandFailed {
        /// Command text as sent to the host.
        command: String,
        /// Exit code, when the command produced one.
        exit_code: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
}

impl Classify for SessionError {
    fn retryability(&self) -> Retryability {
        match self {
            Self::Connect { .. } | Self::Disconnected { .. } => Retryability::Retryable,
            Self::InvalidConfig { .. } | Self::Spawn { .. } | Self::CommandFailed { .. } => {
                Retryability::Fatal
            }
        }
    }
}
