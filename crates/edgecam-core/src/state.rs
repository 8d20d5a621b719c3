// ── Per-session reactive state ──
//
// Everything a session knows about its device, as tracking variables.
// The dispatcher is the only writer of device-reported values; the
// session writes directories and application settings.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::config::{ApplicationType, SessionConfig};
use crate::model::{
    DeployOutcome, DeployStage, DeployStatus, DeviceConfiguration, FramePair, OnWireProtocol,
    StreamStatus,
};
use crate::tracking::TrackingVariable;

#[derive(Debug)]
pub struct DeviceState {
    pub device_config: TrackingVariable<DeviceConfiguration>,
    pub stream_status: TrackingVariable<StreamStatus>,
    /// Latest deployment status report, as stored by the dispatcher.
    pub deploy_status: TrackingVariable<DeployStatus>,
    pub deploy_stage: TrackingVariable<DeployStage>,
    /// Set once per deployment attempt, at its terminal transition.
    pub deploy_outcome: TrackingVariable<DeployOutcome>,
    pub last_reception: TrackingVariable<DateTime<Utc>>,
    pub image_dir: TrackingVariable<PathBuf>,
    pub inference_dir: TrackingVariable<PathBuf>,
    pub app_type: TrackingVariable<ApplicationType>,
    pub schema_file: TrackingVariable<Option<PathBuf>>,
    pub last_frame: TrackingVariable<FramePair>,
    protocol: OnceLock<OnWireProtocol>,
    attributes_available: AtomicBool,
}

impl DeviceState {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            device_config: TrackingVariable::new(),
            stream_status: TrackingVariable::new(),
            deploy_status: TrackingVariable::new(),
            deploy_stage: TrackingVariable::with_value(DeployStage::Idle),
            deploy_outcome: TrackingVariable::new(),
            last_reception: TrackingVariable::new(),
            image_dir: TrackingVariable::with_value(config.image_dir.clone()),
            inference_dir: TrackingVariable::with_value(config.inference_dir.clone()),
            app_type: TrackingVariable::with_value(config.application.app_type),
            schema_file: TrackingVariable::with_value(config.application.schema_file.clone()),
            last_frame: TrackingVariable::new(),
            protocol: OnceLock::new(),
            attributes_available: AtomicBool::new(false),
        }
    }

    /// Wire protocol, once the device has reported it.
    pub fn protocol(&self) -> Option<OnWireProtocol> {
        self.protocol.get().copied()
    }

    /// Record the wire protocol. The first report wins; returns the value
    /// in effect afterwards.
    pub(crate) fn set_protocol(&self, protocol: OnWireProtocol) -> OnWireProtocol {
        *self.protocol.get_or_init(|| protocol)
    }

    pub fn attributes_available(&self) -> bool {
        self.attributes_available.load(Ordering::Acquire)
    }

    pub(crate) fn mark_attributes_available(&self) {
        self.attributes_available.store(true, Ordering::Release);
    }
}
