// ── Runtime session configuration ──
//
// These types describe *how* to run a session against one device: where
// its broker lives, where our webserver listens, and where artifacts go.
// They never touch disk. The CLI builds a `SessionConfig` from a device
// profile and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Vision application running on the device. Selects how overlays are
/// drawn; the schema file selects how inferences are decoded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    Classification,
    Detection,
    Segmentation,
    GenericClassification,
    GenericDetection,
    Custom,
}

/// Decoding configuration for uploaded inferences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub app_type: ApplicationType,
    /// FlatBuffers schema for the application's output tensor. `None`
    /// leaves inferences undecoded.
    pub schema_file: Option<PathBuf>,
}

/// Configuration for one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Human-readable device name, used in logs and port ownership.
    pub device_name: String,
    /// Broker the device and the session both connect to.
    pub mqtt: Endpoint,
    /// Whether the broker connection uses TLS.
    pub tls: bool,
    /// Where the ingestion webserver listens.
    pub webserver: Endpoint,
    /// Launch an embedded broker when `mqtt.host` is local.
    pub spawn_broker: bool,
    /// Broker executable for the embedded broker.
    pub broker_program: PathBuf,
    /// Where the webserver stores raw uploads before ingestion.
    pub upload_root: PathBuf,
    /// Where modules are staged for the device to download.
    pub serve_dir: PathBuf,
    pub image_dir: PathBuf,
    pub inference_dir: PathBuf,
    pub application: ApplicationConfig,
    /// Quota for image + inference directories, in bytes. `None` = unbounded.
    pub storage_limit: Option<u64>,
    /// Storage watcher rescan period.
    pub watch_interval: Duration,
    /// Bound on waiting for a deployment confirmation.
    pub deploy_timeout: Duration,
    /// Bound on waiting for the MQTT subscription to be acknowledged.
    pub subscribe_timeout: Duration,
    /// How long an unmatched image or inference is held for pairing.
    pub pair_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for a device named `device_name`, with all working
    /// directories under `root`.
    pub fn with_root(device_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            device_name: device_name.into(),
            mqtt: Endpoint::new("localhost", 1883),
            tls: false,
            webserver: Endpoint::new("localhost", 8000),
            spawn_broker: true,
            broker_program: PathBuf::from("mosquitto"),
            upload_root: root.join("uploads"),
            serve_dir: root.join("serve"),
            image_dir: root.join("images"),
            inference_dir: root.join("inferences"),
            application: ApplicationConfig::default(),
            storage_limit: None,
            watch_interval: Duration::from_secs(5),
            deploy_timeout: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            pair_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::with_root("default", std::env::temp_dir().join("edgecam"))
    }
}
