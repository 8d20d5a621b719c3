// edgecam-core: Device sessions on top of edgecam-api (dispatch, deployment, ingestion).

pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod model;
pub mod network;
pub mod qr;
pub mod session;
pub mod state;
pub mod stream;
pub mod tracking;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ApplicationConfig, ApplicationType, Endpoint, SessionConfig};
pub use deploy::DeployFsm;
pub use dispatch::{MqttLink, MqttSetup, ProtocolDispatcher, mqtt_setup};
pub use error::CoreError;
pub use ingest::{
    FlatcDecoder, FrameSink, InferenceDecoder, IngestionPipeline, StorageUsage, StorageWatcher,
    save_into_input_directory,
};
pub use network::{
    get_mqtt_ip, get_my_ip_by_routing, get_network_ifaces, get_webserver_ip, is_localhost,
};
pub use qr::{MAX_QR_BORDER, QrMatrix, QrParams, get_qr_object, qr_string};
pub use session::{Collaborators, DeviceSession, SessionNotice, SessionPhase};
pub use state::DeviceState;
pub use stream::{VariableStream, VariableWatchStream};
pub use tracking::TrackingVariable;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    DecodedInference, DeployOutcome, DeployResult, DeployStage, DeployStatus, DeviceConfiguration,
    FramePair, ModuleManifest, OnWireProtocol, StreamStatus,
};
