// ── Deployment state machine ──
//
// One instance per attempt:
//
//   Idle → ManifestBuilt → Submitted → AwaitingConfirmation → Done | Error
//
// Confirmation comes from deployment status reports the dispatcher stores
// in `DeviceState::deploy_status`. The wait is bounded; expiry is a
// terminal `Error`, never a retry. The outcome variable is written exactly
// once, at the terminal transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use edgecam_api::Transport;

use crate::error::CoreError;
use crate::model::{
    DeployOutcome, DeployResult, DeployStage, DeployStatus, DeployVerdict, DeploymentManifest,
    ModuleManifest, OnWireProtocol,
};
use crate::state::DeviceState;

pub struct DeployFsm {
    protocol: OnWireProtocol,
    transport: Arc<dyn Transport>,
    state: Arc<DeviceState>,
    timeout: Duration,
    stage: DeployStage,
    manifest: Option<(ModuleManifest, DeploymentManifest)>,
}

impl DeployFsm {
    /// A fresh machine in `Idle`, bound to one protocol version and
    /// transport.
    pub async fn instantiate(
        protocol: OnWireProtocol,
        transport: Arc<dyn Transport>,
        state: Arc<DeviceState>,
        timeout: Duration,
    ) -> Self {
        state.deploy_stage.aset(DeployStage::Idle).await;
        Self {
            protocol,
            transport,
            state,
            timeout,
            stage: DeployStage::Idle,
            manifest: None,
        }
    }

    pub fn stage(&self) -> DeployStage {
        self.stage
    }

    /// `Idle → ManifestBuilt`. Wraps `module` in a deployment with a fresh id.
    pub async fn set_manifest(&mut self, module: ModuleManifest) -> Result<&str, CoreError> {
        if self.stage != DeployStage::Idle {
            return Err(CoreError::Internal(format!(
                "manifest set in stage {}",
                self.stage
            )));
        }
        let deployment = DeploymentManifest::single_module(&module);
        self.manifest = Some((module, deployment));
        self.transition(DeployStage::ManifestBuilt).await;
        Ok(self
            .manifest
            .as_ref()
            .map_or("", |(_, d)| d.deployment_id()))
    }

    /// Submit the manifest and wait for the device's verdict.
    pub async fn run(mut self) -> Result<DeployOutcome, CoreError> {
        let Some((module, manifest)) = self.manifest.take() else {
            return Err(CoreError::Internal("deployment started without a manifest".into()));
        };
        let deployment_id = manifest.deployment_id().to_string();

        // Subscribe before publishing so a fast confirmation is not missed.
        let mut statuses = self.state.deploy_status.watch();
        statuses.borrow_and_update();

        let submitted = match manifest.to_wire(self.protocol) {
            Ok(wire) => self.transport.deploy(wire).await.map_err(CoreError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = submitted {
            let reason = format!("publish failed: {e}");
            self.finish(&deployment_id, &module, DeployResult::Failed {
                reason: reason.clone(),
            })
            .await;
            return Err(CoreError::Deployment { reason });
        }

        self.transition(DeployStage::Submitted).await;
        info!(%deployment_id, module = %module.name, "deployment submitted");
        self.transition(DeployStage::AwaitingConfirmation).await;

        let waited = tokio::time::timeout(self.timeout, await_verdict(&mut statuses, &deployment_id)).await;
        match waited {
            Ok(Some(DeployVerdict::Applied)) => {
                Ok(self.finish(&deployment_id, &module, DeployResult::Success).await)
            }
            Ok(Some(DeployVerdict::Failed(detail))) => {
                self.finish(&deployment_id, &module, DeployResult::Failed {
                    reason: detail.clone(),
                })
                .await;
                Err(CoreError::DeploymentRejected {
                    deployment_id,
                    detail,
                })
            }
            Ok(None) => {
                let reason = "deployment status source closed".to_string();
                self.finish(&deployment_id, &module, DeployResult::Failed {
                    reason: reason.clone(),
                })
                .await;
                Err(CoreError::Deployment { reason })
            }
            Err(_) => {
                let timeout_secs = self.timeout.as_secs();
                self.finish(&deployment_id, &module, DeployResult::Failed {
                    reason: format!("not confirmed after {timeout_secs}s"),
                })
                .await;
                Err(CoreError::DeploymentTimeout {
                    deployment_id,
                    timeout_secs,
                })
            }
        }
    }

    async fn transition(&mut self, next: DeployStage) {
        debug!(from = %self.stage, to = %next, "deployment stage");
        self.stage = next;
        self.state.deploy_stage.aset(next).await;
    }

    async fn finish(
        &mut self,
        deployment_id: &str,
        module: &ModuleManifest,
        result: DeployResult,
    ) -> DeployOutcome {
        let stage = match &result {
            DeployResult::Success => DeployStage::Done,
            DeployResult::Failed { reason } => {
                warn!(%deployment_id, %reason, "deployment failed");
                DeployStage::Error
            }
        };
        let outcome = DeployOutcome {
            deployment_id: deployment_id.to_string(),
            module: module.name.clone(),
            download_url: module.download_url.clone(),
            result,
        };
        self.transition(stage).await;
        self.state.deploy_outcome.aset(outcome.clone()).await;
        outcome
    }
}

/// Wait for a status report about `deployment_id` that settles it.
/// `None` if the status variable goes away.
async fn await_verdict(
    statuses: &mut watch::Receiver<Option<DeployStatus>>,
    deployment_id: &str,
) -> Option<DeployVerdict> {
    loop {
        statuses.changed().await.ok()?;
        let verdict = statuses
            .borrow_and_update()
            .as_ref()
            .and_then(|status| status.verdict_for(deployment_id));
        if verdict.is_some() {
            return verdict;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::SessionConfig;

    #[derive(Default)]
    struct Recorder {
        deployed: Mutex<Vec<Value>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn publish(&self, _topic: &str, payload: &Value) -> Result<(), edgecam_api::Error> {
            if self.fail {
                return Err(edgecam_api::Error::NotConnected);
            }
            self.deployed.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn module() -> ModuleManifest {
        ModuleManifest {
            name: "node".into(),
            source: PathBuf::from("app.wasm"),
            download_url: "http://h:1/deploy/app.wasm".into(),
            hash: "00".into(),
        }
    }

    fn state() -> Arc<DeviceState> {
        Arc::new(DeviceState::new(&SessionConfig::default()))
    }

    #[tokio::test]
    async fn confirmation_completes_deployment() {
        let state = state();
        let transport = Arc::new(Recorder::default());
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V2,
            transport.clone(),
            Arc::clone(&state),
            Duration::from_secs(5),
        )
        .await;
        let id = fsm.set_manifest(module()).await.unwrap().to_string();
        assert_eq!(fsm.stage(), DeployStage::ManifestBuilt);

        let confirmer = {
            let state = Arc::clone(&state);
            let id = id.clone();
            tokio::spawn(async move {
                let mut stage = state.deploy_stage.watch();
                while *stage.borrow_and_update() != Some(DeployStage::AwaitingConfirmation) {
                    stage.changed().await.unwrap();
                }
                state
                    .deploy_status
                    .aset(DeployStatus(json!({"deploymentId": id, "reconcileStatus": "ok"})))
                    .await;
            })
        };

        let outcome = fsm.run().await.unwrap();
        confirmer.await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.deployment_id, id);
        assert_eq!(state.deploy_stage.value(), Some(DeployStage::Done));
        assert_eq!(state.deploy_outcome.value(), Some(outcome));

        let deployed = transport.deployed.lock().unwrap();
        assert_eq!(deployed[0]["deployment"]["deploymentId"], id.as_str());
    }

    #[tokio::test]
    async fn v1_manifest_is_sent_as_string() {
        let state = state();
        let transport = Arc::new(Recorder::default());
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V1,
            transport.clone(),
            state,
            Duration::from_millis(10),
        )
        .await;
        fsm.set_manifest(module()).await.unwrap();
        let _ = fsm.run().await;

        let deployed = transport.deployed.lock().unwrap();
        assert!(deployed[0]["deployment"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirmation_times_out() {
        let state = state();
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V2,
            Arc::new(Recorder::default()),
            Arc::clone(&state),
            Duration::from_secs(30),
        )
        .await;
        fsm.set_manifest(module()).await.unwrap();

        let err = fsm.run().await.unwrap_err();
        assert!(matches!(err, CoreError::DeploymentTimeout { timeout_secs: 30, .. }));
        assert_eq!(state.deploy_stage.value(), Some(DeployStage::Error));
        assert!(!state.deploy_outcome.value().unwrap().is_success());
    }

    #[tokio::test]
    async fn publish_failure_is_terminal() {
        let state = state();
        let transport = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V2,
            transport,
            Arc::clone(&state),
            Duration::from_secs(5),
        )
        .await;
        fsm.set_manifest(module()).await.unwrap();

        let err = fsm.run().await.unwrap_err();
        assert!(matches!(err, CoreError::Deployment { .. }));
        assert_eq!(state.deploy_stage.value(), Some(DeployStage::Error));
    }

    #[tokio::test]
    async fn device_error_rejects_deployment() {
        let state = state();
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V2,
            Arc::new(Recorder::default()),
            Arc::clone(&state),
            Duration::from_secs(5),
        )
        .await;
        let id = fsm.set_manifest(module()).await.unwrap().to_string();

        let reporter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut stage = state.deploy_stage.watch();
                while *stage.borrow_and_update() != Some(DeployStage::AwaitingConfirmation) {
                    stage.changed().await.unwrap();
                }
                state
                    .deploy_status
                    .aset(DeployStatus(json!({
                        "deploymentId": id,
                        "reconcileStatus": "ok",
                        "modules": {"node": {"status": "error"}}
                    })))
                    .await;
            })
        };

        let err = fsm.run().await.unwrap_err();
        reporter.await.unwrap();
        assert!(matches!(err, CoreError::DeploymentRejected { .. }));
    }

    #[tokio::test]
    async fn manifest_cannot_be_set_twice() {
        let mut fsm = DeployFsm::instantiate(
            OnWireProtocol::V2,
            Arc::new(Recorder::default()),
            state(),
            Duration::from_secs(1),
        )
        .await;
        fsm.set_manifest(module()).await.unwrap();
        assert!(fsm.set_manifest(module()).await.is_err());
    }
}
