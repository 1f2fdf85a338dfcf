//! Core session types and the command runner abstraction.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8PathBuf;
use tokio::process::Command;

use super::SessionError;

/// Process invocation handed to a [`CommandRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child process.
    pub env: Vec<(String, String)>,
    /// Discard output instead of capturing it. Needed for commands that fork
    /// a background process which would otherwise hold the pipes open.
    pub discard_output: bool,
}

impl CommandSpec {
    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running a local process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, SessionError>> + Send + 'a>>;

/// Abstraction over process execution to support fakes in tests.
pub trait CommandRunner: Clone + Send + Sync {
    /// Runs the command, capturing stdout and stderr unless discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .envs(spec.env.iter().map(|(key, value)| (key, value)))
                .stdin(Stdio::null())
                .kill_on_drop(true);

            let spawn_error = |err: std::io::Error| SessionError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            };

            if spec.discard_output {
                let status = command
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map_err(spawn_error)?;
                return Ok(CommandOutput {
                    code: status.code(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }

            let output = command.output().await.map_err(spawn_error)?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Output captured from one command executed inside a remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandResult {
    /// Command text as sent to the host.
    pub command: String,
    /// Captured standard output stream.
    pub stdout: String,
    /// Captured standard error stream.
    pub stderr: String,
    /// Exit code reported by the remote command.
    pub exit_code: Option<i32>,
}

impl RemoteCommandResult {
    /// Returns `true` when the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Authentication material for a remote session.
#[derive(Clone, Eq, PartialEq)]
pub enum Credentials {
    /// Password handed to `sshpass` through its environment.
    Password(String),
    /// Private key file passed to `ssh -i`.
    IdentityFile(Utf8PathBuf),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => formatter.write_str("Password(<redacted>)"),
            Self::IdentityFile(path) => formatter.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// Host, login, and credentials for a remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port of the SSH daemon.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Authentication material.
    pub credentials: Credentials,
}

impl SessionTarget {
    /// Returns the `user@host` destination passed to `ssh`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}
