// ── Device session ──
//
// Lifecycle of one connected device: the ingestion webserver, storage
// watcher, ingestion consumer, embedded broker, transport driver, and
// protocol dispatcher. Every task runs under one child token of the
// session's root token and is joined on shutdown.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edgecam_api::webserver::{IMAGES_DIR, INFERENCES_DIR};
use edgecam_api::{
    BrokerConfig, BrokerHandle, Connector, IngestionServer, MqttConfig, MqttConnector,
    PortRegistry, Transport, WebserverConfig,
};

use crate::config::{ApplicationType, SessionConfig};
use crate::deploy::{APPLICATION_NAME, DeployFsm, single_module_manifest_setup};
use crate::dispatch::{MqttLink, MqttSetup, ProtocolDispatcher, mqtt_setup};
use crate::error::CoreError;
use crate::ingest::{FrameSink, InferenceDecoder, IngestionPipeline, StorageWatcher};
use crate::model::DeployOutcome;
use crate::network;
use crate::state::DeviceState;

const UPLOAD_CHANNEL_SIZE: usize = 256;
const INCOMING_CHANNEL_SIZE: usize = 256;
const NOTICE_CHANNEL_SIZE: usize = 64;
/// How long the transport driver may take to flush a DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

const START_STREAMING_METHOD: &str = "StartUploadInferenceData";
const STOP_STREAMING_METHOD: &str = "StopUploadInferenceData";

// ── Notices and phase ────────────────────────────────────────────────

/// Out-of-band report to whoever drives the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotice {
    pub kind: String,
    pub detail: String,
}

impl SessionNotice {
    pub const ERROR: &'static str = "error";

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            kind: Self::ERROR.into(),
            detail: detail.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == Self::ERROR
    }
}

/// Session lifecycle phase, observable through [`DeviceSession::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionPhase {
    Idle,
    Starting,
    Running,
    Stopped,
}

// ── Collaborators ────────────────────────────────────────────────────

/// The pluggable parts of a session.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub frame_sink: Arc<dyn FrameSink>,
    pub decoder: Arc<dyn InferenceDecoder>,
    pub ports: PortRegistry,
}

impl Collaborators {
    /// Collaborators that reach the device over MQTT as configured.
    pub fn mqtt(
        config: &SessionConfig,
        frame_sink: Arc<dyn FrameSink>,
        decoder: Arc<dyn InferenceDecoder>,
        ports: PortRegistry,
    ) -> Self {
        Self {
            connector: Arc::new(MqttConnector::new(mqtt_config(config))),
            frame_sink,
            decoder,
            ports,
        }
    }
}

/// MQTT client settings for a session.
pub fn mqtt_config(config: &SessionConfig) -> MqttConfig {
    MqttConfig {
        host: config.mqtt.host.clone(),
        port: config.mqtt.port,
        tls: config.tls,
        client_id: format!("edgecam-{}-{}", config.device_name, uuid::Uuid::new_v4().simple()),
        subscribe_timeout: config.subscribe_timeout,
        ..MqttConfig::default()
    }
}

// ── DeviceSession ────────────────────────────────────────────────────

/// One device's session. Cheaply cloneable.
///
/// Created idle; [`startup`](Self::startup) brings every service up or
/// none of them, [`shutdown`](Self::shutdown) brings them all down.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    state: Arc<DeviceState>,
    connector: Arc<dyn Connector>,
    ports: PortRegistry,
    pipeline: Arc<IngestionPipeline>,
    storage: StorageWatcher,
    phase: watch::Sender<SessionPhase>,
    notices: broadcast::Sender<SessionNotice>,
    cancel: CancellationToken,
    scope: Mutex<Option<CancellationToken>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
    broker: Mutex<Option<BrokerHandle>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    webserver_port: Mutex<Option<u16>>,
    deploy_lock: Mutex<()>,
}

impl DeviceSession {
    /// Assemble a session. Performs no I/O.
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let state = Arc::new(DeviceState::new(&config));
        let storage = StorageWatcher::new(config.storage_limit, config.watch_interval);
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&state),
            collaborators.frame_sink,
            collaborators.decoder,
            Arc::new(storage.clone()),
            config.pair_timeout,
        ));
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SessionInner {
                config,
                state,
                connector: collaborators.connector,
                ports: collaborators.ports,
                pipeline,
                storage,
                phase,
                notices,
                cancel: CancellationToken::new(),
                scope: Mutex::new(None),
                task_handles: Mutex::new(Vec::new()),
                driver: Mutex::new(None),
                lifecycle: Mutex::new(()),
                broker: Mutex::new(None),
                transport: Mutex::new(None),
                webserver_port: Mutex::new(None),
                deploy_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.inner.state
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.inner.pipeline
    }

    pub fn storage(&self) -> &StorageWatcher {
        &self.inner.storage
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    /// Port the ingestion webserver is bound to, while running.
    pub async fn webserver_port(&self) -> Option<u16> {
        *self.inner.webserver_port.lock().await
    }

    /// Number of session tasks not yet joined.
    pub async fn task_count(&self) -> usize {
        let driver = usize::from(self.inner.driver.lock().await.is_some());
        self.inner.task_handles.lock().await.len() + driver
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bring up every session service.
    ///
    /// Resolves once the device subscription is acknowledged. On failure,
    /// everything started so far is torn down and the session returns to
    /// `Idle`.
    pub async fn startup(&self) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let claimed = self.inner.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Idle {
                *phase = SessionPhase::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CoreError::AlreadyStarted);
        }

        let scope = self.inner.cancel.child_token();
        *self.inner.scope.lock().await = Some(scope.clone());
        info!(device = %self.inner.config.device_name, "starting session");

        if let Err(e) = self.launch(&scope).await {
            self.teardown(&scope).await;
            self.inner.phase.send_if_modified(|phase| {
                if *phase == SessionPhase::Starting {
                    *phase = SessionPhase::Idle;
                    true
                } else {
                    false
                }
            });
            return Err(e);
        }

        let running = self.inner.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Starting {
                *phase = SessionPhase::Running;
                true
            } else {
                false
            }
        });
        if !running {
            self.teardown(&scope).await;
            return Err(CoreError::Internal("session stopped during startup".into()));
        }

        info!(device = %self.inner.config.device_name, "session running");
        Ok(())
    }

    async fn launch(&self, scope: &CancellationToken) -> Result<(), CoreError> {
        let inner = &self.inner;
        let config = &inner.config;

        let (upload_tx, upload_rx) = mpsc::channel(UPLOAD_CHANNEL_SIZE);
        let server = match IngestionServer::bind(&webserver_config(config), &inner.ports, upload_tx).await {
            Ok(server) => server,
            Err(e) => {
                let e = CoreError::from(e);
                let _ = inner.notices.send(SessionNotice::error(e.to_string()));
                return Err(e);
            }
        };
        *inner.webserver_port.lock().await = Some(server.port());
        self.spawn(server.run(scope.clone())).await;

        let dirs = [inner.state.image_dir.value(), inner.state.inference_dir.value()];
        inner.storage.set_dirs(dirs.into_iter().flatten().collect());
        inner.storage.start(scope);

        let pipeline = Arc::clone(&inner.pipeline);
        self.spawn(pipeline.run(upload_rx, scope.clone())).await;

        let broker = (config.spawn_broker && network::is_localhost(&config.mqtt.host)).then(|| {
            BrokerConfig {
                program: config.broker_program.clone(),
                port: config.mqtt.port,
                ..BrokerConfig::default()
            }
        });
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
        let setup = MqttSetup {
            connector: inner.connector.as_ref(),
            broker,
            ports: &inner.ports,
            incoming: incoming_tx,
            cancel: scope.clone(),
        };
        let MqttLink { broker, link } = mqtt_setup(setup, &inner.notices).await?;

        *inner.broker.lock().await = broker;
        *inner.transport.lock().await = Some(link.transport);
        *inner.driver.lock().await = Some(tokio::spawn(link.driver));

        let dispatcher = ProtocolDispatcher::new(Arc::clone(&inner.state));
        self.spawn(dispatcher.run(incoming_rx, scope.clone())).await;
        Ok(())
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.task_handles.lock().await.push(tokio::spawn(task));
    }

    /// Stop everything and wait for it. Idempotent; the session cannot be
    /// started again afterwards. A startup still in progress is aborted and
    /// waited for.
    pub async fn shutdown(&self) {
        let previous = self.inner.phase.send_replace(SessionPhase::Stopped);
        if previous == SessionPhase::Stopped {
            return;
        }
        if previous == SessionPhase::Starting {
            if let Some(scope) = self.inner.scope.lock().await.as_ref() {
                scope.cancel();
            }
        }
        let _lifecycle = self.inner.lifecycle.lock().await;

        let scope = self.inner.scope.lock().await.take();
        match scope {
            Some(scope) => self.teardown(&scope).await,
            None => self.inner.storage.stop().await,
        }
        self.inner.cancel.cancel();
        info!(device = %self.inner.config.device_name, "session stopped");
    }

    async fn teardown(&self, scope: &CancellationToken) {
        // The driver has to keep polling until the DISCONNECT is out.
        let driver = self.inner.driver.lock().await.take();
        if let Some(transport) = self.inner.transport.lock().await.take() {
            transport.disconnect().await;
        }
        let driver = match driver {
            Some(mut handle) => match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
                Ok(joined) => {
                    if let Err(e) = joined {
                        warn!(error = %e, "transport driver panicked");
                    }
                    None
                }
                Err(_) => {
                    debug!("transport driver still running after disconnect");
                    Some(handle)
                }
            },
            None => None,
        };

        scope.cancel();

        let mut handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        handles.extend(driver);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "session task panicked");
            }
        }
        self.inner.storage.stop().await;

        if let Some(broker) = self.inner.broker.lock().await.take() {
            broker.stop().await;
        }
        *self.inner.webserver_port.lock().await = None;
        debug!("session services released");
    }

    // ── Deployment ───────────────────────────────────────────────────

    /// Stage `module_path` on the webserver and deploy it to the device.
    /// Attempts are serialized.
    pub async fn do_app_deployment(&self, module_path: &Path) -> Result<DeployOutcome, CoreError> {
        let transport = self.transport().await.ok_or_else(|| CoreError::Deployment {
            reason: "session is not connected".into(),
        })?;
        let protocol = self.inner.state.protocol().ok_or_else(|| CoreError::Deployment {
            reason: "device has not reported its protocol version".into(),
        })?;

        let _attempt = self.inner.deploy_lock.lock().await;
        let base_url = self.webserver_base_url().await?;
        let module = single_module_manifest_setup(
            APPLICATION_NAME,
            module_path,
            &self.inner.config.serve_dir,
            &base_url,
        )
        .await?;

        let mut fsm = DeployFsm::instantiate(
            protocol,
            transport,
            Arc::clone(&self.inner.state),
            self.inner.config.deploy_timeout,
        )
        .await;
        let deployment_id = fsm.set_manifest(module).await?;
        info!(%deployment_id, module = %module_path.display(), "deploying application");
        fsm.run().await
    }

    /// `http://<address>:<port>` under which the device reaches the
    /// webserver.
    pub async fn webserver_base_url(&self) -> Result<String, CoreError> {
        let port = self.webserver_port().await.ok_or(CoreError::NotConnected)?;
        let config = self.inner.config.clone();
        let host = tokio::task::spawn_blocking(move || network::get_webserver_ip(&config))
            .await
            .map_err(|e| CoreError::Internal(format!("address lookup task failed: {e}")))??;
        Ok(format!("http://{host}:{port}"))
    }

    async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.lock().await.clone()
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub async fn set_image_dir(&self, path: impl Into<PathBuf>) -> Result<(), CoreError> {
        let path = path.into();
        ensure_dir(&path).await?;
        self.inner.state.image_dir.aset(path).await;
        self.refresh_watched_dirs();
        Ok(())
    }

    pub async fn set_inference_dir(&self, path: impl Into<PathBuf>) -> Result<(), CoreError> {
        let path = path.into();
        ensure_dir(&path).await?;
        self.inner.state.inference_dir.aset(path).await;
        self.refresh_watched_dirs();
        Ok(())
    }

    /// Change how uploaded inferences are decoded. Applies to uploads
    /// ingested after the call.
    pub async fn set_application(&self, app_type: ApplicationType, schema_file: Option<PathBuf>) {
        self.inner.state.app_type.aset(app_type).await;
        self.inner.state.schema_file.aset(schema_file).await;
    }

    fn refresh_watched_dirs(&self) {
        let state = &self.inner.state;
        let dirs = [state.image_dir.value(), state.inference_dir.value()];
        self.inner.storage.set_dirs(dirs.into_iter().flatten().collect());
    }

    // ── Streaming ────────────────────────────────────────────────────

    /// Ask the device to start uploading frames to the webserver.
    pub async fn streaming_rpc_start(&self) -> Result<(), CoreError> {
        let transport = self.transport().await.ok_or(CoreError::NotConnected)?;
        let base_url = self.webserver_base_url().await?;
        let params = serde_json::json!({
            "Mode": 1,
            "UploadMethod": "HttpStorage",
            "StorageName": base_url,
            "StorageSubDirectoryPath": IMAGES_DIR,
            "UploadMethodIR": "HttpStorage",
            "StorageNameIR": base_url,
            "StorageSubDirectoryPathIR": INFERENCES_DIR,
            "CropHOffset": 0,
            "CropVOffset": 0,
            "CropHSize": 4056,
            "CropVSize": 3040,
        });
        transport
            .rpc(APPLICATION_NAME, START_STREAMING_METHOD, &params.to_string())
            .await?;
        info!(%base_url, "streaming requested");
        Ok(())
    }

    /// Ask the device to stop uploading frames.
    pub async fn streaming_rpc_stop(&self) -> Result<(), CoreError> {
        let transport = self.transport().await.ok_or(CoreError::NotConnected)?;
        transport
            .rpc(APPLICATION_NAME, STOP_STREAMING_METHOD, "{}")
            .await?;
        info!("streaming stop requested");
        Ok(())
    }
}

fn webserver_config(config: &SessionConfig) -> WebserverConfig {
    WebserverConfig {
        bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: config.webserver.port,
        upload_root: config.upload_root.clone(),
        serve_dir: config.serve_dir.clone(),
    }
}

async fn ensure_dir(path: &Path) -> Result<(), CoreError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CoreError::fs(path, e))
}
