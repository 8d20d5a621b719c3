// ── Protocol dispatcher ──
//
// Turns inbound (topic, payload) pairs into state updates. Attribute
// messages are demultiplexed by sub-key; anything else only refreshes
// the last-reception timestamp. One task runs the dispatcher, so
// messages are applied one at a time in arrival order.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edgecam_api::topics::{self, DEPLOY_STATUS_TOPIC, SYSINFO_TOPIC};
use edgecam_api::{
    BrokerConfig, BrokerHandle, Connector, IncomingMessage, PortRegistry, TransportLink,
};

use crate::error::CoreError;
use crate::model::{DeployStatus, DeviceConfiguration, OnWireProtocol};
use crate::session::SessionNotice;
use crate::state::DeviceState;

/// Applies device messages to a session's [`DeviceState`].
#[derive(Clone)]
pub struct ProtocolDispatcher {
    state: Arc<DeviceState>,
}

impl ProtocolDispatcher {
    pub fn new(state: Arc<DeviceState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    /// Apply one inbound message.
    pub async fn process_incoming(&self, topic: &str, payload: &Value) {
        if topic != topics::ATTRIBUTES {
            debug!(topic, "reception");
            self.state.last_reception.aset(Utc::now()).await;
            return;
        }

        let Some(attrs) = payload.as_object() else {
            debug!(topic, "attributes payload is not a mapping, ignored");
            return;
        };

        if attrs.keys().any(|k| topics::is_state_key(k)) {
            self.process_state_topic(payload).await;
        }
        if attrs.contains_key(SYSINFO_TOPIC) {
            self.process_sysinfo_topic(payload).await;
        }
        if attrs.contains_key(DEPLOY_STATUS_TOPIC) {
            self.process_deploy_status_topic(payload).await;
        }
    }

    /// Handle device-state sub-keys. Validation failures are logged and
    /// dropped without touching existing state.
    pub async fn process_state_topic(&self, payload: &Value) {
        let Some(attrs) = payload.as_object() else {
            return;
        };

        for (key, value) in attrs.iter().filter(|(k, _)| topics::is_state_key(k)) {
            match decode_device_config(value) {
                Ok(config) => {
                    let status = config.stream_status();
                    debug!(key, sensor = %config.status.sensor, "device configuration received");
                    self.state.device_config.aset(config).await;
                    self.state.stream_status.aset(status).await;
                }
                Err(e) => {
                    warn!(key, error = %e, "Error while validating device configuration");
                }
            }
        }
    }

    /// Handle `systemInfo`. Accepts both `{"systemInfo": {...}}` and the
    /// inner object.
    pub async fn process_sysinfo_topic(&self, payload: &Value) {
        let sysinfo = payload.get(SYSINFO_TOPIC).unwrap_or(payload);
        let Some(version) = sysinfo.get("protocolVersion").and_then(Value::as_str) else {
            warn!("systemInfo without protocolVersion");
            return;
        };

        match version.parse::<OnWireProtocol>() {
            Ok(reported) => {
                let effective = self.state.set_protocol(reported);
                if effective == reported {
                    info!(protocol = %effective, "wire protocol detected");
                } else {
                    debug!(%reported, %effective, "wire protocol already fixed for session");
                }
                self.state.mark_attributes_available();
            }
            Err(e) => warn!(error = %e, "unsupported protocol version"),
        }
    }

    /// Handle `deploymentStatus`.
    pub async fn process_deploy_status_topic(&self, payload: &Value) {
        let raw = payload.get(DEPLOY_STATUS_TOPIC).unwrap_or(payload);
        self.state.mark_attributes_available();

        match decode_deploy_status(raw, self.state.protocol()) {
            Ok(status) => {
                debug!(deployment_id = ?status.deployment_id(), "deployment status received");
                self.state.deploy_status.aset(status).await;
            }
            Err(e) => warn!(error = %e, "dropping deployment status"),
        }
    }

    /// Consume `incoming` until it closes or `cancel` fires.
    pub async fn run(self, mut incoming: mpsc::Receiver<IncomingMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => self.process_incoming(&msg.topic, &msg.payload).await,
                    None => break,
                },
            }
        }
        debug!("dispatcher exiting");
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

fn decode_device_config(value: &Value) -> Result<DeviceConfiguration, CoreError> {
    let encoded = value.as_str().ok_or_else(|| CoreError::Validation {
        message: "state payload is not a base64 string".into(),
    })?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CoreError::Validation {
            message: format!("invalid base64: {e}"),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::Validation {
        message: e.to_string(),
    })
}

/// V1 carries the status as a JSON string, V2 as an object. Before the
/// protocol is known, the payload's own shape decides.
fn decode_deploy_status(
    raw: &Value,
    protocol: Option<OnWireProtocol>,
) -> Result<DeployStatus, CoreError> {
    match (protocol, raw) {
        (Some(OnWireProtocol::V1) | None, Value::String(text)) => serde_json::from_str(text)
            .map(DeployStatus)
            .map_err(|e| CoreError::Validation {
                message: format!("deployment status is not valid JSON: {e}"),
            }),
        (Some(OnWireProtocol::V1), other) => Err(CoreError::Validation {
            message: format!("expected JSON string deployment status, got {other}"),
        }),
        (Some(OnWireProtocol::V2) | None, other) => Ok(DeployStatus(other.clone())),
    }
}

// ── MQTT setup ───────────────────────────────────────────────────────

/// Inputs for [`mqtt_setup`].
pub struct MqttSetup<'a> {
    pub connector: &'a dyn Connector,
    /// Embedded broker to launch first, if any.
    pub broker: Option<BrokerConfig>,
    pub ports: &'a PortRegistry,
    pub incoming: mpsc::Sender<IncomingMessage>,
    pub cancel: CancellationToken,
}

/// A connected transport and the broker behind it, if we launched one.
pub struct MqttLink {
    pub broker: Option<BrokerHandle>,
    pub link: TransportLink,
}

/// Launch the embedded broker (if configured) and connect. A failure,
/// including a broker port collision, is reported as an `"error"` notice
/// before it is returned; nothing launched so far is left running.
pub async fn mqtt_setup(
    setup: MqttSetup<'_>,
    notices: &broadcast::Sender<SessionNotice>,
) -> Result<MqttLink, CoreError> {
    match try_mqtt_setup(setup).await {
        Ok(link) => Ok(link),
        Err(e) => {
            warn!(error = %e, "MQTT setup failed");
            let _ = notices.send(SessionNotice::error(e.to_string()));
            Err(e)
        }
    }
}

async fn try_mqtt_setup(setup: MqttSetup<'_>) -> Result<MqttLink, CoreError> {
    let broker = match &setup.broker {
        Some(config) => Some(BrokerHandle::spawn(config, setup.ports).await?),
        None => None,
    };

    match setup.connector.connect(setup.incoming, setup.cancel).await {
        Ok(link) => Ok(MqttLink { broker, link }),
        Err(e) => {
            if let Some(broker) = broker {
                broker.stop().await;
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::SessionConfig;
    use crate::model::StreamStatus;
    use crate::model::device_config::tests::{sample, sample_json};

    fn dispatcher() -> ProtocolDispatcher {
        ProtocolDispatcher::new(Arc::new(DeviceState::new(&SessionConfig::default())))
    }

    fn encoded_state(doc: &Value) -> String {
        BASE64.encode(serde_json::to_vec(doc).unwrap())
    }

    #[tokio::test]
    async fn state_topic_replaces_config_and_stream_status() {
        let d = dispatcher();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            d.state().device_config.subscribe_async(move |new, old| {
                let seen = Arc::clone(&seen);
                async move { seen.lock().unwrap().push((new, old)) }
            });
        }

        let payload = json!({ "state/node/placeholder": encoded_state(&sample_json("Streaming")) });
        d.process_state_topic(&payload).await;

        assert_eq!(*seen.lock().unwrap(), vec![(sample("Streaming"), None)]);
        assert_eq!(d.state().stream_status.value(), Some(StreamStatus::Active));
    }

    #[tokio::test]
    async fn malformed_state_leaves_values_unchanged() {
        let d = dispatcher();
        let good = json!({ (topics::EA_STATE_TOPIC): encoded_state(&sample_json("Standby")) });
        d.process_state_topic(&good).await;

        for bad in [
            json!({ (topics::EA_STATE_TOPIC): BASE64.encode(br#"{"a":"b"}"#) }),
            json!({ (topics::EA_STATE_TOPIC): "%%% not base64 %%%" }),
            json!({ (topics::EA_STATE_TOPIC): BASE64.encode(b"not json") }),
            json!({ (topics::EA_STATE_TOPIC): 42 }),
        ] {
            d.process_state_topic(&bad).await;
            assert_eq!(d.state().device_config.value(), Some(sample("Standby")));
            assert_eq!(d.state().stream_status.value(), Some(StreamStatus::Inactive));
        }
    }

    #[tokio::test]
    async fn sysinfo_sets_protocol_once() {
        let d = dispatcher();
        d.process_sysinfo_topic(&json!({"systemInfo": {"protocolVersion": "evp2"}}))
            .await;
        d.process_sysinfo_topic(&json!({"protocolVersion": "evp1"})).await;

        assert_eq!(d.state().protocol(), Some(OnWireProtocol::V2));
        assert!(d.state().attributes_available());
    }

    #[tokio::test]
    async fn v1_and_v2_deploy_status_store_the_same_value() {
        let v1 = dispatcher();
        v1.state().set_protocol(OnWireProtocol::V1);
        v1.process_deploy_status_topic(&json!({"deploymentStatus": r#"{"a":"b"}"#}))
            .await;

        let v2 = dispatcher();
        v2.state().set_protocol(OnWireProtocol::V2);
        v2.process_deploy_status_topic(&json!({"deploymentStatus": {"a": "b"}}))
            .await;

        assert_eq!(v1.state().deploy_status.value(), v2.state().deploy_status.value());
        assert_eq!(
            v1.state().deploy_status.value(),
            Some(DeployStatus(json!({"a": "b"})))
        );
        assert!(v1.state().attributes_available());
        assert!(v2.state().attributes_available());
    }

    #[tokio::test]
    async fn v1_unparseable_status_is_dropped() {
        let d = dispatcher();
        d.state().set_protocol(OnWireProtocol::V1);
        d.process_deploy_status_topic(&json!({"deploymentStatus": "{broken"}))
            .await;
        assert!(d.state().deploy_status.value().is_none());
        assert!(d.state().attributes_available());
    }

    #[tokio::test]
    async fn telemetry_only_records_reception() {
        let d = dispatcher();
        let before = Utc::now();
        d.process_incoming(topics::TELEMETRY, &json!({"a": "b"})).await;

        let at = d.state().last_reception.value().unwrap();
        assert!(at >= before);
        assert!(d.state().device_config.value().is_none());
        assert!(!d.state().attributes_available());
    }

    #[tokio::test]
    async fn attributes_route_by_sub_key() {
        let d = dispatcher();
        let payload = json!({
            "systemInfo": {"protocolVersion": "evp2"},
            "deploymentStatus": {"deploymentId": "x", "reconcileStatus": "ok"},
            "state/backdoor-EA_Main/placeholder": encoded_state(&sample_json("Standby")),
        });
        d.process_incoming(topics::ATTRIBUTES, &payload).await;

        assert_eq!(d.state().protocol(), Some(OnWireProtocol::V2));
        assert_eq!(
            d.state().deploy_status.value().unwrap().deployment_id(),
            Some("x")
        );
        assert!(d.state().device_config.value().is_some());
        assert!(d.state().last_reception.value().is_none());
    }

    #[tokio::test]
    async fn run_applies_messages_in_order_until_cancelled() {
        let d = dispatcher();
        let state = Arc::clone(d.state());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(d.run(rx, cancel.clone()));

        tx.send(IncomingMessage::new(
            topics::ATTRIBUTES,
            json!({"deploymentStatus": {"deploymentId": "1"}}),
        ))
        .await
        .unwrap();
        tx.send(IncomingMessage::new(
            topics::ATTRIBUTES,
            json!({"deploymentStatus": {"deploymentId": "2"}}),
        ))
        .await
        .unwrap();

        let mut rx = state.deploy_status.watch();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if rx
                    .borrow_and_update()
                    .as_ref()
                    .and_then(DeployStatus::deployment_id)
                    == Some("2")
                {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
