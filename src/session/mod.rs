//! Scoped SSH sessions backed by an OpenSSH control master.
//!
//! [`SessionDriver::with_session`] opens a master connection, hands a
//! [`RemoteSession`] to the caller, and tears the master down on every exit
//! path. Commands issued through the session multiplex over the master, so
//! authentication happens once per session.

use std::ffi::OsString;
use std::future::Future;

use camino::Utf8PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

mod config;
mod types;

pub use config::{DEFAULT_CONTROL_DIR, SessionConfig, SessionConfigLoadError, SessionError};
pub use types::{
    CommandOutput, CommandRunner, CommandSpec, Credentials, ProcessCommandRunner,
    RemoteCommandResult, RunnerFuture, SessionTarget,
};

/// Exit status `ssh` reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Unanswered keepalives tolerated before `ssh` drops the connection.
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// Environment variable `sshpass -e` reads the password from.
const SSHPASS_ENV: &str = "SSHPASS";

/// Opens scoped remote sessions through the configured [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct SessionDriver<R: CommandRunner> {
    config: SessionConfig,
    runner: R,
}

impl SessionDriver<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SessionConfig) -> Result<Self, SessionError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SessionDriver<R> {
    /// Creates a driver using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SessionConfig, runner: R) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens a session to `target`, runs `body`, and closes the session.
    ///
    /// The master connection is closed whether `body` succeeds or fails. A
    /// failure to close is logged and does not mask the body's result.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] (converted into `E`) when the master
    /// cannot be opened, otherwise whatever `body` returns. The driver never
    /// retries.
    pub async fn with_session<T, E, F, Fut>(&self, target: &SessionTarget, body: F) -> Result<T, E>
    where
        E: From<SessionError>,
        F: FnOnce(RemoteSession<R>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let control_path = self.control_path();
        self.open_master(target, &control_path).await?;
        debug!(host = %target.host, control_path = %control_path, "ssh session opened");

        let session = RemoteSession {
            config: self.config.clone(),
            runner: self.runner.clone(),
            target: target.clone(),
            control_path: control_path.clone(),
            log: Vec::new(),
        };
        let result = body(session).await;

        if let Err(err) = self.close_master(target, &control_path).await {
            warn!(host = %target.host, error = %err, "failed to close ssh session");
        } else {
            debug!(host = %target.host, "ssh session closed");
        }
        result
    }

    fn control_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.config.control_dir)
            .join(format!("botfleet-{}.sock", Uuid::new_v4().simple()))
    }

    async fn open_master(
        &self,
        target: &SessionTarget,
        control_path: &Utf8PathBuf,
    ) -> Result<(), SessionError> {
        let spec = self.build_open_spec(target, control_path);
        let output = self.runner.run(&spec).await?;
        if output.is_success() {
            return Ok(());
        }
        let message = output.code.map_or_else(
            || String::from("ssh terminated without an exit status"),
            |code| format!("ssh exited with status {code}"),
        );
        Err(SessionError::Connect {
            host: target.host.clone(),
            message,
        })
    }

    async fn close_master(
        &self,
        target: &SessionTarget,
        control_path: &Utf8PathBuf,
    ) -> Result<(), SessionError> {
        let spec = build_close_spec(&self.config, target, control_path);
        let output = self.runner.run(&spec).await?;
        if output.is_success() {
            return Ok(());
        }
        Err(SessionError::Disconnected {
            host: target.host.clone(),
            message: output.stderr.trim().to_owned(),
        })
    }

    pub(crate) fn build_open_spec(
        &self,
        target: &SessionTarget,
        control_path: &Utf8PathBuf,
    ) -> CommandSpec {
        let mut ssh_args = common_ssh_options(&self.config, target, control_path);
        match &target.credentials {
            Credentials::Password(_) => {
                push_option(&mut ssh_args, "PubkeyAuthentication=no");
                push_option(&mut ssh_args, "NumberOfPasswordPrompts=1");
            }
            Credentials::IdentityFile(path) => {
                push_option(&mut ssh_args, "BatchMode=yes");
                ssh_args.push(OsString::from("-i"));
                ssh_args.push(OsString::from(path.as_str()));
            }
        }
        push_option(
            &mut ssh_args,
            &format!("ControlPersist={}s", self.config.control_persist_secs),
        );
        ssh_args.extend(["-M", "-N", "-f"].map(OsString::from));
        ssh_args.push(OsString::from(target.destination()));

        match &target.credentials {
            Credentials::Password(password) => {
                let mut args = vec![OsString::from("-e"), OsString::from(&self.config.ssh_bin)];
                args.extend(ssh_args);
                CommandSpec {
                    program: self.config.sshpass_bin.clone(),
                    args,
                    env: vec![(String::from(SSHPASS_ENV), password.clone())],
                    discard_output: true,
                }
            }
            Credentials::IdentityFile(_) => CommandSpec {
                program: self.config.ssh_bin.clone(),
                args: ssh_args,
                env: Vec::new(),
                discard_output: true,
            },
        }
    }
}

/// Live session handed to the body of [`SessionDriver::with_session`].
///
/// Commands run strictly in the order they are issued and are recorded in
/// the session's command log.
#[derive(Debug)]
pub struct RemoteSession<R: CommandRunner> {
    config: SessionConfig,
    runner: R,
    target: SessionTarget,
    control_path: Utf8PathBuf,
    log: Vec<String>,
}

impl<R: CommandRunner> RemoteSession<R> {
    /// Runs `command` on the remote host and returns its output whatever the
    /// exit status.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disconnected`] when `ssh` itself reports a
    /// transport failure or the command outlives the configured deadline,
    /// or [`SessionError::Spawn`] when `ssh` cannot start.
    pub async fn run(&mut self, command: &str) -> Result<RemoteCommandResult, SessionError> {
        self.log.push(command.to_owned());
        debug!(host = %self.target.host, command, "running remote command");

        let spec = self.build_run_spec(command);
        let deadline = self.config.command_timeout();
        let Ok(outcome) = tokio::time::timeout(deadline, self.runner.run(&spec)).await else {
            warn!(
                host = %self.target.host,
                command,
                timeout_secs = deadline.as_secs(),
                "remote command timed out"
            );
            return Err(SessionError::Disconnected {
                host: self.target.host.clone(),
                message: format!("command timed out after {}s", deadline.as_secs()),
            });
        };
        let output = outcome?;
        if output.code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(SessionError::Disconnected {
                host: self.target.host.clone(),
                message: output.stderr.trim().to_owned(),
            });
        }
        Ok(RemoteCommandResult {
            command: command.to_owned(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.code,
        })
    }

    /// Runs `command` and requires a zero exit status with empty stderr.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CommandFailed`] when the command exits
    /// non-zero or writes to stderr, plus any error from
    /// [`RemoteSession::run`].
    pub async fn run_checked(
        &mut self,
        command: &str,
    ) -> Result<RemoteCommandResult, SessionError> {
        let result = self.run(command).await?;
        if result.is_success() && result.stderr.trim().is_empty() {
            return Ok(result);
        }
        let status_text = result
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(SessionError::CommandFailed {
            command: result.command,
            exit_code: result.exit_code,
            status_text,
            stderr: result.stderr.trim().to_owned(),
        })
    }

    /// Commands issued so far, in order.
    #[must_use]
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Host this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.target.host
    }

    fn build_run_spec(&self, command: &str) -> CommandSpec {
        let mut args = common_ssh_options(&self.config, &self.target, &self.control_path);
        push_option(&mut args, "ControlMaster=no");
        push_option(&mut args, "BatchMode=yes");
        args.push(OsString::from(self.target.destination()));
        args.push(OsString::from("--"));
        args.push(OsString::from(command));
        CommandSpec {
            program: self.config.ssh_bin.clone(),
            args,
            env: Vec::new(),
            discard_output: false,
        }
    }
}

fn push_option(args: &mut Vec<OsString>, option: &str) {
    args.push(OsString::from("-o"));
    args.push(OsString::from(option));
}

fn common_ssh_options(
    config: &SessionConfig,
    target: &SessionTarget,
    control_path: &Utf8PathBuf,
) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(target.port.to_string())];
    push_option(&mut args, "StrictHostKeyChecking=no");
    push_option(
        &mut args,
        &format!("UserKnownHostsFile={}", config.known_hosts_file),
    );
    push_option(
        &mut args,
        &format!("ConnectTimeout={}", config.connect_timeout_secs),
    );
    push_option(
        &mut args,
        &format!("ServerAliveInterval={}", config.server_alive_interval_secs),
    );
    push_option(
        &mut args,
        &format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
    );
    push_option(&mut args, &format!("ControlPath={control_path}"));
    args
}

fn build_close_spec(
    config: &SessionConfig,
    target: &SessionTarget,
    control_path: &Utf8PathBuf,
) -> CommandSpec {
    let mut args = Vec::new();
    push_option(&mut args, &format!("ControlPath={control_path}"));
    args.extend(["-O", "exit"].map(OsString::from));
    args.push(OsString::from(target.destination()));
    CommandSpec {
        program: config.ssh_bin.clone(),
        args,
        env: Vec::new(),
        discard_output: false,
    }
}
