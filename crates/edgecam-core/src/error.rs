// ── Core error types ──
//
// Session-level errors from edgecam-core. Consumers never see rumqttc or
// axum failures directly: the `From<edgecam_api::Error>` impl translates
// wire-side errors into session-appropriate variants.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not connected to the device")]
    NotConnected,

    // ── Transport errors ─────────────────────────────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Port {port} is already in use ({owner})")]
    PortInUse { port: u16, owner: String },

    // ── Deployment errors ────────────────────────────────────────────
    #[error("Deployment failed: {reason}")]
    Deployment { reason: String },

    #[error("Deployment {deployment_id} not confirmed after {timeout_secs}s")]
    DeploymentTimeout {
        deployment_id: String,
        timeout_secs: u64,
    },

    #[error("Deployment {deployment_id} rejected by device: {detail}")]
    DeploymentRejected {
        deployment_id: String,
        detail: String,
    },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Inference decoding failed: {message}")]
    Decode { message: String },

    // ── Filesystem errors ────────────────────────────────────────────
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Environment errors ───────────────────────────────────────────
    #[error("Network discovery failed: {message}")]
    Network { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Attach a path to an I/O error.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for any deployment failure, including timeouts and
    /// device-side rejections.
    pub fn is_deployment(&self) -> bool {
        matches!(
            self,
            Self::Deployment { .. } | Self::DeploymentTimeout { .. } | Self::DeploymentRejected { .. }
        )
    }
}

// ── Conversion from wire-side errors ─────────────────────────────────

impl From<edgecam_api::Error> for CoreError {
    fn from(err: edgecam_api::Error) -> Self {
        match err {
            edgecam_api::Error::PortInUse { port, owner } => CoreError::PortInUse { port, owner },
            edgecam_api::Error::NotConnected => CoreError::NotConnected,
            edgecam_api::Error::Json(e) => CoreError::Validation {
                message: e.to_string(),
            },
            other => CoreError::Transport {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_collision_keeps_owner() {
        let err: CoreError = edgecam_api::Error::PortInUse {
            port: 8000,
            owner: "ingestion webserver".into(),
        }
        .into();
        assert!(matches!(err, CoreError::PortInUse { port: 8000, .. }));
    }

    #[test]
    fn broker_failure_becomes_transport_error() {
        let err: CoreError = edgecam_api::Error::Broker {
            port: 1883,
            reason: "address in use".into(),
        }
        .into();
        match err {
            CoreError::Transport { message } => assert!(message.contains("1883")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn deployment_classification() {
        assert!(
            CoreError::DeploymentTimeout {
                deployment_id: "x".into(),
                timeout_secs: 30
            }
            .is_deployment()
        );
        assert!(!CoreError::AlreadyStarted.is_deployment());
    }
}
