//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use edgecam_config::ConfigError;
use edgecam_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
    pub const DEPLOYMENT: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the device: {reason}")]
    #[diagnostic(
        code(edgecam::connection_failed),
        help(
            "Check that the broker is running and the device is online.\n\
             Try: edgecam -v run"
        )
    )]
    ConnectionFailed { reason: String },

    #[error("Port {port} is already in use ({owner})")]
    #[diagnostic(
        code(edgecam::port_in_use),
        help("Stop the other session or pick another port in the device profile.")
    )]
    PortInUse { port: u16, owner: String },

    // ── Deployment ───────────────────────────────────────────────────
    #[error("Deployment failed: {reason}")]
    #[diagnostic(code(edgecam::deployment))]
    Deployment { reason: String },

    #[error("Timed out after {seconds}s waiting for {what}")]
    #[diagnostic(
        code(edgecam::timeout),
        help("The device may be offline, or increase the timeout.")
    )]
    Timeout { what: String, seconds: u64 },

    // ── Environment ──────────────────────────────────────────────────
    #[error("Network discovery failed: {message}")]
    #[diagnostic(
        code(edgecam::network),
        help("Set an explicit mqtt_host / webserver_host in the device profile.")
    )]
    Network { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(edgecam::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Device profile '{name}' not found in configuration")]
    #[diagnostic(
        code(edgecam::device_not_found),
        help("Available devices: {available}\nRun: edgecam config show")
    )]
    DeviceNotFound { name: String, available: String },

    #[error("Configuration error: {0}")]
    #[diagnostic(code(edgecam::config))]
    Config(String),

    // ── Internal ─────────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(edgecam::internal))]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Network { .. } => exit_code::CONNECTION,
            Self::PortInUse { .. } => exit_code::CONFLICT,
            Self::Deployment { .. } => exit_code::DEPLOYMENT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::DeviceNotFound { .. } => exit_code::NOT_FOUND,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotConnected => CliError::ConnectionFailed {
                reason: "session is not connected".into(),
            },
            CoreError::Transport { message } => CliError::ConnectionFailed { reason: message },
            CoreError::PortInUse { port, owner } => CliError::PortInUse { port, owner },

            CoreError::Deployment { reason } => CliError::Deployment { reason },
            CoreError::DeploymentRejected {
                deployment_id,
                detail,
            } => CliError::Deployment {
                reason: format!("device rejected {deployment_id}: {detail}"),
            },
            CoreError::DeploymentTimeout {
                deployment_id,
                timeout_secs,
            } => CliError::Timeout {
                what: format!("confirmation of deployment {deployment_id}"),
                seconds: timeout_secs,
            },

            CoreError::Validation { message } | CoreError::Decode { message } => {
                CliError::Validation {
                    field: "input".into(),
                    reason: message,
                }
            }
            CoreError::Network { message } => CliError::Network { message },
            CoreError::Config { message } => CliError::Config(message),

            err @ (CoreError::AlreadyStarted
            | CoreError::Filesystem { .. }
            | CoreError::Internal(_)) => CliError::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::UnknownDevice { name } => CliError::DeviceNotFound {
                name,
                available: String::new(),
            },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config(other.to_string()),
        }
    }
}
