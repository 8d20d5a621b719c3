// ── Domain model ──
//
// Typed views of what the device reports and what we send it.

pub mod artifact;
pub mod deploy;
pub mod device_config;
pub mod protocol;

pub use artifact::{Artifact, ArtifactKind, DecodedInference, FramePair};
pub use deploy::{
    DeployOutcome, DeployResult, DeployStage, DeployStatus, DeployVerdict, DeploymentManifest,
    ModuleManifest,
};
pub use device_config::{DeviceConfiguration, StreamStatus};
pub use protocol::OnWireProtocol;
