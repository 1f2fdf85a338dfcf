//! First-boot user-data for bot instances.
//!
//! Each instance gets a fresh root password. The script sets it and enables
//! password logins so the configuration session can authenticate before any
//! key has been installed. The request's feature flags are seeded into an
//! env file so the instance carries them from first boot.

use std::borrow::Cow;
use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use shell_escape::unix::escape;

use crate::orchestrator::FeatureFlags;

/// Length of generated root passwords.
pub const ROOT_PASSWORD_LEN: usize = 24;

const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
const SSHD_DROP_IN_DIR: &str = "/etc/ssh/sshd_config.d";

/// Directory holding files seeded at first boot.
pub const SEED_DIR: &str = "/etc/botfleet";
/// Env file carrying the feature flags.
pub const FEATURES_ENV_FILE: &str = "/etc/botfleet/features.env";

/// Root credential generated for one instance.
#[derive(Clone, Eq, PartialEq)]
pub struct RootPassword(String);

impl RootPassword {
    /// Generates a random alphanumeric password.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Generates a password from the supplied random source.
    #[must_use]
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let value: String = rng
            .sample_iter(&Alphanumeric)
            .take(ROOT_PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    /// Returns the secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RootPassword {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("RootPassword(<redacted>)")
    }
}

/// Renders the user-data script that installs `password` for root and seeds
/// `features` into [`FEATURES_ENV_FILE`].
#[must_use]
pub fn render_boot_script(password: &RootPassword, features: &FeatureFlags) -> String {
    let credential = escape(Cow::Owned(format!("root:{}", password.expose())));
    let mut lines = vec![
        String::from("#!/bin/bash"),
        String::from("set -eu"),
        format!("echo {credential} | chpasswd"),
        format!(
            "sed -i -E 's/^#?PasswordAuthentication .*/PasswordAuthentication yes/' {SSHD_CONFIG}"
        ),
        format!("sed -i -E 's/^#?PermitRootLogin .*/PermitRootLogin yes/' {SSHD_CONFIG}"),
        format!("rm -f {SSHD_DROP_IN_DIR}/50-cloud-init.conf"),
        String::from("systemctl restart ssh || systemctl restart sshd"),
        format!("mkdir -p {SEED_DIR}"),
        format!(": > {FEATURES_ENV_FILE}"),
    ];
    lines.extend(
        features
            .env_entries()
            .iter()
            .map(|(key, value)| format!("echo {key}={value} >> {FEATURES_ENV_FILE}")),
    );
    format!("{}\n", lines.join("\n"))
}
