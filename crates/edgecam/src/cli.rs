//! Clap derive structures for the `edgecam` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// edgecam -- provision, stream from, and deploy to edge-AI cameras
#[derive(Debug, Parser)]
#[command(
    name = "edgecam",
    version,
    about = "Drive edge-AI cameras from the command line",
    long_about = "Provision edge-AI cameras with a QR code, collect the images and\n\
        inferences they upload, and deploy application modules over MQTT.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Device profile to use
    #[arg(long, short = 'd', env = "EDGECAM_DEVICE", global = true)]
    pub device: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "EDGECAM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the provisioning QR code for a device
    Qr(QrArgs),

    /// List physical network interfaces and the routing address
    Ifaces,

    /// Start a session and log device activity until interrupted
    Run(RunArgs),

    /// Deploy an application module to the device
    Deploy(DeployArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct QrArgs {
    /// Also render the code as text
    #[arg(long)]
    pub ascii: bool,

    /// Quiet-zone width in modules
    #[arg(
        long,
        default_value = "2",
        value_parser = clap::value_parser!(u32).range(0..=i64::from(edgecam_core::MAX_QR_BORDER))
    )]
    pub border: u32,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Ask the device to start uploading frames once connected
    #[arg(long)]
    pub stream: bool,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Module file (WebAssembly) to deploy
    pub module: PathBuf,

    /// Seconds to wait for the device to report its protocol version
    #[arg(long, default_value = "30")]
    pub wait: u64,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current resolved configuration
    Show,

    /// Print the config file path
    Path,
}
