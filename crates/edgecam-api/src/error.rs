use thiserror::Error;

/// Top-level error type for the `edgecam-api` crate.
///
/// Covers every failure mode on the wire side: MQTT client and connection
/// errors, the embedded broker, the ingestion webserver, and process-wide
/// port ownership. `edgecam-core` maps these into session-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── MQTT ────────────────────────────────────────────────────────
    /// The broker could not be reached or the connection dropped.
    #[error("MQTT connection error: {0}")]
    MqttConnection(String),

    /// A request could not be queued on the MQTT client.
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    /// No SUBACK was received for the subscription set in time.
    #[error("MQTT subscription not acknowledged after {timeout_secs}s")]
    SubscribeTimeout { timeout_secs: u64 },

    /// Publishing was attempted on a transport that has been disconnected.
    #[error("Transport is not connected")]
    NotConnected,

    // ── Broker ──────────────────────────────────────────────────────
    /// The embedded broker could not be started.
    #[error("Broker failed to start on port {port}: {reason}")]
    Broker { port: u16, reason: String },

    // ── Ports ───────────────────────────────────────────────────────
    /// A process-wide port is already owned by another component.
    #[error("Port {port} is already in use ({owner})")]
    PortInUse { port: u16, owner: String },

    // ── Webserver ───────────────────────────────────────────────────
    /// The ingestion webserver could not bind its listener.
    #[error("Webserver failed to bind {addr}: {reason}")]
    WebserverBind { addr: String, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A payload could not be encoded or decoded as JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failure (broker config file, upload storage).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if a port collision caused this error.
    pub fn is_port_collision(&self) -> bool {
        matches!(self, Self::PortInUse { .. } | Self::WebserverBind { .. })
            || matches!(self, Self::Broker { reason, .. } if reason.contains("in use"))
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MqttConnection(_) | Self::SubscribeTimeout { .. }
        )
    }
}
