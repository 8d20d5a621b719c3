// ── Deployment domain types ──
//
// Manifests we push, statuses the device reports back, and the stages
// and outcomes a deployment attempt moves through.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

use super::OnWireProtocol;
use crate::error::CoreError;

// ── DeployStatus ─────────────────────────────────────────────────────

/// Deployment status as reported by the device, after V1 string payloads
/// have been parsed. Otherwise opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployStatus(pub Value);

/// What a status report says about one outstanding deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployVerdict {
    Applied,
    Failed(String),
}

impl DeployStatus {
    pub fn deployment_id(&self) -> Option<&str> {
        self.0.get("deploymentId").and_then(Value::as_str)
    }

    pub fn reconcile_status(&self) -> Option<&str> {
        self.0.get("reconcileStatus").and_then(Value::as_str)
    }

    /// Names of modules and instances reporting `status: error`.
    pub fn failed_units(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for section in ["modules", "instances"] {
            match self.0.get(section) {
                Some(Value::Object(units)) => {
                    for (name, unit) in units {
                        if unit_failed(unit) {
                            failed.push(format!("{section}/{name}"));
                        }
                    }
                }
                Some(Value::Array(units)) => {
                    for (idx, unit) in units.iter().enumerate() {
                        if unit_failed(unit) {
                            failed.push(format!("{section}/{idx}"));
                        }
                    }
                }
                _ => {}
            }
        }
        failed
    }

    /// Judge this report against `deployment_id`. `None` while the report is
    /// about another deployment or still reconciling.
    pub fn verdict_for(&self, deployment_id: &str) -> Option<DeployVerdict> {
        if self.deployment_id() != Some(deployment_id) {
            return None;
        }

        let failed = self.failed_units();
        if !failed.is_empty() {
            return Some(DeployVerdict::Failed(format!(
                "units reported error: {}",
                failed.join(", ")
            )));
        }

        match self.reconcile_status() {
            Some("ok") => Some(DeployVerdict::Applied),
            Some("error") => Some(DeployVerdict::Failed("reconcileStatus is error".into())),
            _ => None,
        }
    }
}

fn unit_failed(unit: &Value) -> bool {
    unit.get("status").and_then(Value::as_str) == Some("error")
}

// ── Manifests ────────────────────────────────────────────────────────

/// One deployable module, staged on the session webserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    /// Module and instance name on the device.
    pub name: String,
    /// Module file as supplied by the caller.
    pub source: PathBuf,
    pub download_url: String,
    /// Lowercase hex SHA-256 of the module bytes.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceSpec {
    module_id: String,
    publish: Map<String, Value>,
    subscribe: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleSpec {
    entry_point: String,
    module_impl: String,
    download_url: String,
    hash: String,
}

/// A complete deployment request with a fresh identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    deployment_id: String,
    instance_specs: BTreeMap<String, InstanceSpec>,
    modules: BTreeMap<String, ModuleSpec>,
    publish_topics: Map<String, Value>,
    subscribe_topics: Map<String, Value>,
}

impl DeploymentManifest {
    /// Wrap a single module, deployed as an instance of the same name.
    pub fn single_module(module: &ModuleManifest) -> Self {
        let instance = InstanceSpec {
            module_id: module.name.clone(),
            publish: Map::new(),
            subscribe: Map::new(),
        };
        let spec = ModuleSpec {
            entry_point: "main".into(),
            module_impl: "wasm".into(),
            download_url: module.download_url.clone(),
            hash: module.hash.clone(),
        };
        Self {
            deployment_id: uuid::Uuid::new_v4().to_string(),
            instance_specs: BTreeMap::from([(module.name.clone(), instance)]),
            modules: BTreeMap::from([(module.name.clone(), spec)]),
            publish_topics: Map::new(),
            subscribe_topics: Map::new(),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Encode for the `deployment` attribute: a JSON string for V1, an
    /// object for V2.
    pub fn to_wire(&self, protocol: OnWireProtocol) -> Result<Value, CoreError> {
        let encoded = match protocol {
            OnWireProtocol::V1 => serde_json::to_string(self).map(Value::String),
            OnWireProtocol::V2 => serde_json::to_value(self),
        };
        encoded.map_err(|e| CoreError::Internal(format!("cannot encode manifest: {e}")))
    }
}

// ── Stages and outcomes ──────────────────────────────────────────────

/// Where a deployment attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeployStage {
    Idle,
    ManifestBuilt,
    Submitted,
    AwaitingConfirmation,
    Done,
    Error,
}

impl DeployStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployResult {
    Success,
    Failed { reason: String },
}

/// Terminal result of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub deployment_id: String,
    pub module: String,
    /// Where the device was told to fetch the module from.
    pub download_url: String,
    pub result: DeployResult,
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        self.result == DeployResult::Success
    }
}
