// ── Transport seams ──
//
// The session never talks to rumqttc directly. It holds an
// `Arc<dyn Transport>` for outbound traffic and obtains one from a
// `Connector`, which also hands back the driver future that keeps the
// connection alive. Tests substitute in-memory fakes at both seams.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::topics;

/// A decoded inbound message: topic plus JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Value,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Outbound half of a device connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a JSON payload on `topic`. Resolves once the request is
    /// queued on the client.
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), Error>;

    /// Invoke `method` on the module instance `instance`. `params` is a
    /// JSON document in string form, as the device expects.
    async fn rpc(&self, instance: &str, method: &str, params: &str) -> Result<(), Error> {
        let payload = rpc_payload(instance, method, params)?;
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        self.publish(&topics::rpc_request_topic(&request_id), &payload)
            .await
    }

    /// Push a deployment manifest (already encoded for the wire protocol
    /// in use) through the attributes topic.
    async fn deploy(&self, manifest: Value) -> Result<(), Error> {
        let mut attrs = Map::new();
        attrs.insert(topics::DEPLOYMENT_KEY.to_string(), manifest);
        self.publish(topics::ATTRIBUTES, &Value::Object(attrs)).await
    }

    /// Close the connection. Further publishes fail with
    /// [`Error::NotConnected`].
    async fn disconnect(&self) {}
}

/// Future that keeps a connection serviced until its cancellation token fires.
pub type Driver = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A connected transport together with the task that drives it.
pub struct TransportLink {
    pub transport: Arc<dyn Transport>,
    pub driver: Driver,
}

/// Establishes a transport for one session.
///
/// Implementations must resolve only after the fixed topic set is
/// subscribed, forward every inbound message on `incoming`, and make the
/// returned driver exit when `cancel` fires.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        incoming: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<TransportLink, Error>;
}

/// Build the RPC request body for a module method call.
pub fn rpc_payload(instance: &str, method: &str, params: &str) -> Result<Value, Error> {
    let params: Value = serde_json::from_str(params)?;
    Ok(json!({
        "method": "ModuleMethodCall",
        "params": {
            "moduleMethod": method,
            "moduleInstance": instance,
            "params": params,
        }
    }))
}
