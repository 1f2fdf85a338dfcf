//! Remote configuration and launch of the bot application.

use std::borrow::Cow;
use std::time::Duration;

use shell_escape::unix::escape;
use tracing::{info, warn};

use super::{AppLayout, ProvisionError, ProvisioningRequest};
use crate::session::{CommandRunner, RemoteSession};

/// Lines of application log returned when the launch fails.
pub const LOG_TAIL_LINES: u32 = 40;

fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

/// Environment entries written to the application's `.env`.
#[must_use]
pub fn env_entries(request: &ProvisioningRequest) -> Vec<(&'static str, String)> {
    let settings = &request.settings;
    let mut entries = vec![
        ("BOT_IDENTIFIER", request.identifier.to_string()),
        ("BOT_DISPLAY_NAME", request.display_name.clone()),
        ("COMPANY_NAME", settings.company_name.clone()),
        ("COMPANY_ADDRESS", settings.address.clone()),
    ];
    entries.extend(
        settings
            .features
            .env_entries()
            .map(|(key, value)| (key, value.to_owned())),
    );
    entries
}

/// Idempotent upsert of `key=value` into `env_file`.
///
/// Newlines in `value` are flattened so each key stays on one line.
#[must_use]
pub fn env_upsert_command(env_file: &str, key: &str, value: &str) -> String {
    let flattened = value.replace(['\r', '\n'], " ");
    let file = quote(env_file);
    let entry = format!("{key}={flattened}");
    format!(
        "touch {file} && sed -i '/^{key}=/d' {file} && printf '%s\\n' {} >> {file}",
        quote(&entry)
    )
}

/// Kills whatever holds the application port. Never fails.
#[must_use]
pub fn free_port_command(port: u16) -> String {
    format!("fuser -k {port}/tcp || true")
}

/// Creates the log directory.
#[must_use]
pub fn log_dir_command(layout: &AppLayout) -> String {
    format!("mkdir -p {}", quote(&layout.log_dir))
}

/// Succeeds only when the runtime is executable.
#[must_use]
pub fn runtime_check_command(layout: &AppLayout) -> String {
    format!("test -x {}", quote(&layout.runtime_path))
}

/// Starts the application detached from the session.
#[must_use]
pub fn launch_command(layout: &AppLayout) -> String {
    format!(
        "cd {} && setsid nohup {} {} > {} 2>&1 < /dev/null &",
        quote(&layout.app_dir),
        quote(&layout.runtime_path),
        quote(&layout.entrypoint),
        quote(&layout.log_file())
    )
}

/// Finds the running application process.
#[must_use]
pub fn process_check_command(layout: &AppLayout) -> String {
    format!("pgrep -f {}", quote(&layout.entrypoint))
}

/// Reads the end of the application log.
#[must_use]
pub fn log_tail_command(layout: &AppLayout) -> String {
    format!("tail -n {LOG_TAIL_LINES} {}", quote(&layout.log_file()))
}

/// Writes the bot settings, starts the application, and checks it runs.
pub(crate) async fn configure_and_launch<R: CommandRunner>(
    mut session: RemoteSession<R>,
    layout: &AppLayout,
    request: &ProvisioningRequest,
    launch_settle: Duration,
) -> Result<(), ProvisionError> {
    let env_file = layout.env_file();
    for (key, value) in env_entries(request) {
        let command = env_upsert_command(&env_file, key, &value);
        match session.run(&command).await {
            Ok(result) if result.is_success() => {}
            Ok(result) => warn!(
                host = session.host(),
                key,
                exit_code = ?result.exit_code,
                stderr = result.stderr.trim(),
                "failed to write bot setting"
            ),
            Err(err) => warn!(
                host = session.host(),
                key,
                error = %err,
                "failed to write bot setting"
            ),
        }
    }

    session.run(&free_port_command(layout.port)).await?;
    session.run_checked(&log_dir_command(layout)).await?;

    let runtime = session.run(&runtime_check_command(layout)).await?;
    if !runtime.is_success() {
        return Err(ProvisionError::RuntimeMissing {
            path: layout.runtime_path.clone(),
        });
    }

    session.run_checked(&launch_command(layout)).await?;
    info!(host = session.host(), "application launched");
    tokio::time::sleep(launch_settle).await;

    let process = session.run(&process_check_command(layout)).await?;
    if process.is_success() && !process.stdout.trim().is_empty() {
        return Ok(());
    }

    let tail = session.run(&log_tail_command(layout)).await?;
    Err(ProvisionError::LaunchFailed {
        log_tail: tail.stdout.trim_end().to_owned(),
    })
}
