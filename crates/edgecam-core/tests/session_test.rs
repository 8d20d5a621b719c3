#![allow(clippy::unwrap_used)]
// Integration tests for `DeviceSession` against an in-process fake device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use edgecam_api::topics;
use edgecam_api::{Connector, Error, IncomingMessage, PortRegistry, Transport, TransportLink};
use edgecam_core::{
    Collaborators, CoreError, DecodedInference, DeviceSession, FrameSink, InferenceDecoder,
    SessionConfig, SessionPhase,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Transport that records publishes and confirms deployments like a
/// healthy device would, unless told to replay the previous confirmation.
#[derive(Default)]
struct FakeDevice {
    published: Mutex<Vec<(String, Value)>>,
    incoming: Mutex<Option<mpsc::Sender<IncomingMessage>>>,
    deployment_ids: Mutex<Vec<String>>,
    replay_previous: AtomicBool,
    disconnected: AtomicBool,
    disconnect_signal: Notify,
    /// Set when the driver saw the disconnect before being cancelled.
    driver_drained: AtomicBool,
}

impl FakeDevice {
    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    fn sender(&self) -> mpsc::Sender<IncomingMessage> {
        self.incoming.lock().unwrap().clone().unwrap()
    }

    async fn report(&self, payload: Value) {
        self.sender()
            .send(IncomingMessage::new(topics::ATTRIBUTES, payload))
            .await
            .unwrap();
    }
}

#[async_trait]
impl Transport for FakeDevice {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), Error> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));

        if let Some(id) = payload
            .get(topics::DEPLOYMENT_KEY)
            .and_then(|d| d.get("deploymentId"))
            .and_then(Value::as_str)
        {
            let previous = {
                let mut ids = self.deployment_ids.lock().unwrap();
                let previous = ids.last().cloned();
                ids.push(id.to_string());
                previous
            };
            let status = match previous {
                // A late duplicate of the previous report, distinct from the
                // stored one so it is delivered as a change.
                Some(old) if self.replay_previous.load(Ordering::Acquire) => json!({
                    (topics::DEPLOY_STATUS_TOPIC): {
                        "deploymentId": old,
                        "reconcileStatus": "ok",
                        "instances": {"node": {"status": "ok"}}
                    }
                }),
                _ => json!({
                    (topics::DEPLOY_STATUS_TOPIC): {"deploymentId": id, "reconcileStatus": "ok"}
                }),
            };
            let tx = self.sender();
            tokio::spawn(async move {
                let _ = tx.send(IncomingMessage::new(topics::ATTRIBUTES, status)).await;
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.disconnect_signal.notify_one();
    }
}

struct FakeConnector {
    device: Arc<FakeDevice>,
    fail: bool,
    /// Time spent connecting, regardless of cancellation.
    delay: Duration,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        incoming: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<TransportLink, Error> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::MqttConnection("connection refused".into()));
        }
        *self.device.incoming.lock().unwrap() = Some(incoming);
        let device = self.device.clone();
        Ok(TransportLink {
            transport: self.device.clone(),
            driver: Box::pin(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = device.disconnect_signal.notified() => {
                        device.driver_drained.store(true, Ordering::Release);
                    }
                }
            }),
        })
    }
}

#[derive(Default)]
struct CountingSink {
    frames: AtomicUsize,
}

#[async_trait]
impl FrameSink for CountingSink {
    async fn process_frame(&self, _image: &Path, _inference: &DecodedInference) {
        self.frames.fetch_add(1, Ordering::AcqRel);
    }
}

struct NoDecoder;

#[async_trait]
impl InferenceDecoder for NoDecoder {
    async fn decode(&self, _output: &[u8], _schema: &Path) -> Result<Value, CoreError> {
        Err(CoreError::Decode {
            message: "no schema support in tests".into(),
        })
    }
}

struct Harness {
    session: DeviceSession,
    device: Arc<FakeDevice>,
    sink: Arc<CountingSink>,
    ports: PortRegistry,
    root: tempfile::TempDir,
}

fn config(root: &Path) -> SessionConfig {
    let mut config = SessionConfig::with_root("test-cam", root);
    config.webserver.host = "10.0.0.5".into();
    config.webserver.port = 0;
    config.spawn_broker = false;
    config.deploy_timeout = Duration::from_secs(5);
    config
}

fn harness_with(fail: bool, tweak: impl FnOnce(&mut SessionConfig)) -> Harness {
    harness_connecting_in(fail, Duration::ZERO, tweak)
}

fn harness_connecting_in(
    fail: bool,
    delay: Duration,
    tweak: impl FnOnce(&mut SessionConfig),
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    tweak(&mut config);

    let device = Arc::new(FakeDevice::default());
    let sink = Arc::new(CountingSink::default());
    let ports = PortRegistry::new();
    let collaborators = Collaborators {
        connector: Arc::new(FakeConnector {
            device: device.clone(),
            fail,
            delay,
        }),
        frame_sink: sink.clone(),
        decoder: Arc::new(NoDecoder),
        ports: ports.clone(),
    };

    Harness {
        session: DeviceSession::new(config, collaborators),
        device,
        sink,
        ports,
        root,
    }
}

fn harness() -> Harness {
    harness_with(false, |_| {})
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn startup_then_shutdown_releases_everything() {
    let h = harness();
    assert_ok!(h.session.startup().await);

    assert_eq!(*h.session.phase().borrow(), SessionPhase::Running);
    assert!(h.session.storage().is_running());
    assert_eq!(h.session.task_count().await, 4);
    let port = h.session.webserver_port().await.unwrap();
    assert!(h.ports.owner_of(port).is_some());

    h.session.shutdown().await;

    assert_eq!(*h.session.phase().borrow(), SessionPhase::Stopped);
    assert_eq!(h.session.task_count().await, 0);
    assert!(!h.session.storage().is_running());
    assert!(h.device.disconnected.load(Ordering::Acquire));
    assert!(h.ports.owner_of(port).is_none());

    // Idempotent.
    h.session.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_while_driver_still_runs() {
    let h = harness();
    h.session.startup().await.unwrap();
    h.session.shutdown().await;

    assert!(h.device.disconnected.load(Ordering::Acquire));
    assert!(h.device.driver_drained.load(Ordering::Acquire));
}

#[tokio::test]
async fn shutdown_waits_for_startup_in_progress() {
    let h = harness_connecting_in(false, Duration::from_millis(300), |_| {});
    let session = h.session.clone();
    let starting = tokio::spawn(async move { session.startup().await });

    let mut phase = h.session.phase();
    phase
        .wait_for(|p| *p == SessionPhase::Starting)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.session.shutdown().await;

    // Everything the aborted startup brought up is already gone.
    assert_eq!(*h.session.phase().borrow(), SessionPhase::Stopped);
    assert_eq!(h.session.task_count().await, 0);
    assert!(h.session.webserver_port().await.is_none());
    assert!(h.device.disconnected.load(Ordering::Acquire));
    assert!(!h.session.storage().is_running());

    assert_err!(starting.await.unwrap());
}

#[tokio::test]
async fn second_startup_is_rejected() {
    let h = harness();
    assert_ok!(h.session.startup().await);
    assert!(matches!(
        h.session.startup().await,
        Err(CoreError::AlreadyStarted)
    ));

    h.session.shutdown().await;
    assert!(matches!(
        h.session.startup().await,
        Err(CoreError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn connect_failure_notifies_and_leaves_session_unstarted() {
    let h = harness_with(true, |_| {});
    let mut notices = h.session.notifications();

    assert_err!(h.session.startup().await);

    let notice = notices.recv().await.unwrap();
    assert!(notice.is_error());
    assert!(notice.detail.contains("connection refused"));
    assert_eq!(*h.session.phase().borrow(), SessionPhase::Idle);
    assert_eq!(h.session.task_count().await, 0);
    assert!(!h.session.storage().is_running());
    assert!(h.session.webserver_port().await.is_none());
}

#[tokio::test]
async fn broker_port_collision_notifies() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let broker_port = probe.local_addr().unwrap().port();
    drop(probe);

    let h = harness_with(false, |config| {
        config.spawn_broker = true;
        config.mqtt.port = broker_port;
    });
    let _held = h.ports.acquire(broker_port, "another session").unwrap();
    let mut notices = h.session.notifications();

    let err = h.session.startup().await.unwrap_err();
    assert!(matches!(err, CoreError::PortInUse { port, .. } if port == broker_port));

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, "error");
    assert_eq!(*h.session.phase().borrow(), SessionPhase::Idle);
    assert_eq!(h.session.task_count().await, 0);
}

// ── Deployment ──────────────────────────────────────────────────────

#[tokio::test]
async fn deployment_requires_connection() {
    let h = harness();
    let module = h.root.path().join("app.wasm");
    std::fs::write(&module, b"wasm").unwrap();

    let err = h.session.do_app_deployment(&module).await.unwrap_err();
    assert!(err.is_deployment());
}

#[tokio::test]
async fn deployment_requires_known_protocol() {
    let h = harness();
    h.session.startup().await.unwrap();
    let module = h.root.path().join("app.wasm");
    std::fs::write(&module, b"wasm").unwrap();

    let err = h.session.do_app_deployment(&module).await.unwrap_err();
    assert!(matches!(err, CoreError::Deployment { .. }));
    assert!(h.device.published().is_empty());
    h.session.shutdown().await;
}

#[tokio::test]
async fn consecutive_deployments_each_settle_once() {
    let h = harness();
    h.session.startup().await.unwrap();
    h.device
        .report(json!({(topics::SYSINFO_TOPIC): {"protocolVersion": "evp2"}}))
        .await;
    let state = Arc::clone(h.session.state());
    wait_for(|| state.protocol().is_some()).await;

    let outcomes = Arc::new(AtomicUsize::new(0));
    {
        let outcomes = outcomes.clone();
        state.deploy_outcome.subscribe_async(move |_, _| {
            let outcomes = outcomes.clone();
            async move {
                outcomes.fetch_add(1, Ordering::AcqRel);
            }
        });
    }

    let module = h.root.path().join("app.wasm");
    std::fs::write(&module, b"\0asm").unwrap();

    let first = h.session.do_app_deployment(&module).await.unwrap();
    let second = h.session.do_app_deployment(&module).await.unwrap();

    assert!(first.is_success() && second.is_success());
    assert_ne!(first.deployment_id, second.deployment_id);
    assert_eq!(outcomes.load(Ordering::Acquire), 2);
    assert!(h.root.path().join("serve/app.wasm").exists());

    let port = h.session.webserver_port().await.unwrap();
    let (topic, payload) = &h.device.published()[0];
    assert_eq!(topic, topics::ATTRIBUTES);
    assert_eq!(
        payload["deployment"]["modules"]["node"]["downloadUrl"],
        format!("http://10.0.0.5:{port}/deploy/app.wasm")
    );

    h.session.shutdown().await;
}

#[tokio::test]
async fn replayed_confirmation_does_not_settle_next_deployment() {
    let h = harness_with(false, |config| {
        config.deploy_timeout = Duration::from_millis(400);
    });
    h.session.startup().await.unwrap();
    h.device
        .report(json!({(topics::SYSINFO_TOPIC): {"protocolVersion": "evp2"}}))
        .await;
    let state = Arc::clone(h.session.state());
    wait_for(|| state.protocol().is_some()).await;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    {
        let outcomes = outcomes.clone();
        state.deploy_outcome.subscribe_async(move |outcome, _| {
            let outcomes = outcomes.clone();
            async move {
                outcomes.lock().unwrap().push(outcome);
            }
        });
    }

    let alpha = h.root.path().join("alpha.wasm");
    let beta = h.root.path().join("beta.wasm");
    std::fs::write(&alpha, b"\0asm-alpha").unwrap();
    std::fs::write(&beta, b"\0asm-beta").unwrap();
    let port = h.session.webserver_port().await.unwrap();

    let first = h.session.do_app_deployment(&alpha).await.unwrap();
    assert!(first.is_success());

    h.device.replay_previous.store(true, Ordering::Release);
    let err = h.session.do_app_deployment(&beta).await.unwrap_err();
    let CoreError::DeploymentTimeout { deployment_id, .. } = err else {
        panic!("expected a timeout, got {err:?}");
    };
    assert_ne!(deployment_id, first.deployment_id);

    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], first);
    assert_eq!(
        outcomes[0].download_url,
        format!("http://10.0.0.5:{port}/deploy/alpha.wasm")
    );
    assert_eq!(outcomes[1].deployment_id, deployment_id);
    assert!(!outcomes[1].is_success());
    assert_eq!(
        outcomes[1].download_url,
        format!("http://10.0.0.5:{port}/deploy/beta.wasm")
    );

    let published = h.device.published();
    assert_eq!(published.len(), 2);
    assert_eq!(
        published[1].1["deployment"]["modules"]["node"]["downloadUrl"],
        outcomes[1].download_url.as_str()
    );

    h.session.shutdown().await;
}

// ── Streaming ───────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_stop_sends_module_call() {
    let h = harness();
    h.session.startup().await.unwrap();
    h.session.streaming_rpc_stop().await.unwrap();

    let (topic, payload) = h.device.published().pop().unwrap();
    assert!(topic.starts_with(topics::RPC_REQUEST_PREFIX));
    assert_eq!(
        payload,
        json!({
            "method": "ModuleMethodCall",
            "params": {
                "moduleMethod": "StopUploadInferenceData",
                "moduleInstance": "node",
                "params": {},
            }
        })
    );
    h.session.shutdown().await;
}

#[tokio::test]
async fn streaming_start_points_device_at_webserver() {
    let h = harness();
    h.session.startup().await.unwrap();
    h.session.streaming_rpc_start().await.unwrap();

    let port = h.session.webserver_port().await.unwrap();
    let (_, payload) = h.device.published().pop().unwrap();
    let params = &payload["params"]["params"];
    assert_eq!(payload["params"]["moduleMethod"], "StartUploadInferenceData");
    assert_eq!(params["StorageName"], format!("http://10.0.0.5:{port}"));
    assert_eq!(params["StorageSubDirectoryPath"], "images");
    assert_eq!(params["StorageSubDirectoryPathIR"], "inferences");
    h.session.shutdown().await;
}

#[tokio::test]
async fn streaming_requires_connection() {
    let h = harness();
    assert!(matches!(
        h.session.streaming_rpc_stop().await,
        Err(CoreError::NotConnected)
    ));
}

// ── Ingestion ───────────────────────────────────────────────────────

#[tokio::test]
async fn uploads_are_paired_end_to_end() {
    let h = harness();
    h.session.startup().await.unwrap();
    let port = h.session.webserver_port().await.unwrap();
    let base = format!("http://127.0.0.1:{port}");

    let client = reqwest::Client::new();
    let inference = json!({"Inferences": [{"O": "AQID"}]}).to_string();
    let resp = client
        .put(format!("{base}/inferences/0001.txt"))
        .body(inference)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .put(format!("{base}/images/0001.jpg"))
        .body(vec![0xFFu8, 0xD8, 0xFF])
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let state = Arc::clone(h.session.state());
    wait_for(|| state.last_frame.value().is_some()).await;

    let frame = state.last_frame.value().unwrap();
    assert_eq!(frame.image, h.root.path().join("images/0001.jpg"));
    assert_eq!(frame.inference, DecodedInference::Raw(vec![1, 2, 3]));
    assert_eq!(h.sink.frames.load(Ordering::Acquire), 1);
    assert_eq!(h.session.pipeline().pending_counts(), (0, 0));

    h.session.shutdown().await;
}

#[tokio::test]
async fn directory_setters_create_missing_dirs() {
    let h = harness();
    let images: PathBuf = h.root.path().join("elsewhere/images");
    h.session.set_image_dir(&images).await.unwrap();
    h.session.set_image_dir(&images).await.unwrap();

    assert!(images.is_dir());
    assert_eq!(h.session.state().image_dir.value(), Some(images));
}
