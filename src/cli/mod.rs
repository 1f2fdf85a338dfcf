//! Command-line interface definitions for the `botfleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `botfleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "botfleet",
    about = "Provision dedicated messaging-bot droplets and track their boot progress",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Serve the provisioning HTTP API.
    #[command(name = "serve", about = "Serve the provisioning HTTP API")]
    Serve(ServeCommand),
    /// Provision a bot instance in the foreground and print each transition.
    #[command(
        name = "provision",
        about = "Provision a bot instance in the foreground and print each transition"
    )]
    Provision(ProvisionCommand),
    /// Delete the instance bound to an identifier and reset its state.
    #[command(
        name = "teardown",
        about = "Delete the instance bound to an identifier and reset its state"
    )]
    Teardown(TeardownCommand),
    /// Delete stale fleet instances that never reached completion.
    #[command(
        name = "sweep",
        about = "Delete stale fleet instances that never reached completion"
    )]
    Sweep(SweepCommand),
}

/// Arguments for the `botfleet serve` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ServeCommand {
    /// Socket address to bind, overriding `BOTFLEET_LISTEN_ADDR`.
    #[arg(long, value_name = "ADDR")]
    pub(crate) listen: Option<String>,
}

/// Arguments for the `botfleet provision` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Phone-style identifier the bot will be paired with.
    #[arg(long, value_name = "PHONE")]
    pub(crate) identifier: String,
    /// Display name shown by the bot; defaults to the company name.
    #[arg(long, value_name = "NAME")]
    pub(crate) display_name: Option<String>,
    /// Company name written into the bot configuration.
    #[arg(long, value_name = "NAME")]
    pub(crate) company_name: String,
    /// Postal address written into the bot configuration.
    #[arg(long, value_name = "ADDRESS", default_value = "")]
    pub(crate) address: String,
    /// Enable the appointments feature.
    #[arg(long)]
    pub(crate) appointments: bool,
    /// Enable the catalog feature.
    #[arg(long)]
    pub(crate) catalog: bool,
    /// Enable hand-off to a human operator.
    #[arg(long)]
    pub(crate) human_handoff: bool,
}

/// Arguments for the `botfleet teardown` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TeardownCommand {
    /// Phone-style identifier whose instance should be deleted.
    #[arg(long, value_name = "PHONE")]
    pub(crate) identifier: String,
}

/// Arguments for the `botfleet sweep` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SweepCommand {
    /// Minimum instance age, in minutes, before an unregistered instance is
    /// considered leaked.
    #[arg(long, value_name = "MINUTES", default_value_t = 120)]
    pub(crate) min_age_minutes: i64,
    /// List what would be deleted without deleting anything.
    #[arg(long)]
    pub(crate) dry_run: bool,
}
