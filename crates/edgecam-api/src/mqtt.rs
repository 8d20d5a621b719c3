//! MQTT transport backed by `rumqttc`.
//!
//! [`MqttConnector::connect`] opens the connection, subscribes to the fixed
//! topic set and only resolves once every SUBACK has arrived. The returned
//! driver keeps polling the event loop, forwarding publishes as
//! [`IncomingMessage`]s, and backs off exponentially (with jitter) while the
//! broker is unreachable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::topics;
use crate::transport::{Connector, IncomingMessage, Transport, TransportLink};

const CLIENT_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

// ── Configuration ────────────────────────────────────────────────────

/// Exponential backoff configuration for broker reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failures before the driver gives up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Connection parameters for one device's broker.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive: Duration,
    /// How long to wait for the subscription set to be acknowledged.
    pub subscribe_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            tls: false,
            client_id: format!("edgecam-{}", uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// Outbound half of an MQTT connection.
pub struct MqttTransport {
    client: AsyncClient,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), Error> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let bytes = serde_json::to_vec(payload)?;
        tracing::debug!(topic, bytes = bytes.len(), "publishing");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.client.disconnect().await {
                tracing::debug!(error = %e, "MQTT disconnect request not delivered");
            }
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Creates [`MqttTransport`]s for a fixed [`MqttConfig`].
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn options(&self) -> MqttOptions {
        let cfg = &self.config;
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(cfg.keep_alive);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if cfg.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        incoming: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> Result<TransportLink, Error> {
        tracing::info!(host = %self.config.host, port = self.config.port, "Connecting to MQTT broker");

        let (client, mut eventloop) = AsyncClient::new(self.options(), CLIENT_CAPACITY);
        for topic in topics::SUBSCRIPTIONS {
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }

        let timeout = self.config.subscribe_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::NotConnected),
            result = tokio::time::timeout(
                timeout,
                await_subscribed(&mut eventloop, &incoming, topics::SUBSCRIPTIONS.len()),
            ) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::SubscribeTimeout {
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
        }

        tracing::info!("MQTT subscriptions acknowledged");

        let transport = Arc::new(MqttTransport {
            client: client.clone(),
            connected: AtomicBool::new(true),
        });
        let driver = Box::pin(drive(
            eventloop,
            client,
            incoming,
            self.config.reconnect.clone(),
            cancel,
        ));

        Ok(TransportLink { transport, driver })
    }
}

// ── Event loop ───────────────────────────────────────────────────────

/// Poll until `expected` SUBACKs have been seen. Publishes that arrive in
/// the meantime are forwarded, not dropped. Any connection error is fatal
/// here: a session that cannot subscribe does not start.
async fn await_subscribed(
    eventloop: &mut EventLoop,
    incoming: &mpsc::Sender<IncomingMessage>,
    expected: usize,
) -> Result<(), Error> {
    let mut acked = 0;
    while acked < expected {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => tracing::debug!("MQTT connected"),
            Ok(Event::Incoming(Packet::SubAck(_))) => acked += 1,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = incoming.send(decode_publish(&publish)).await;
            }
            Ok(_) => {}
            Err(e) => return Err(Error::MqttConnection(e.to_string())),
        }
    }
    Ok(())
}

/// Main loop: poll → forward → on error, backoff → poll again (rumqttc
/// reconnects on the next poll). Subscriptions are re-issued after every
/// reconnect since sessions are clean. Ends once a DISCONNECT has gone out.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    incoming: mpsc::Sender<IncomingMessage>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    attempt = 0;
                    if incoming.send(decode_publish(&publish)).await.is_err() {
                        tracing::debug!("incoming channel closed, stopping MQTT driver");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) if attempt > 0 => {
                    tracing::info!(attempt, "MQTT reconnected, resubscribing");
                    attempt = 0;
                    for topic in topics::SUBSCRIPTIONS {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            tracing::warn!(error = %e, topic, "resubscribe failed");
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("MQTT disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "MQTT connection error");

                    if let Some(max) = reconnect.max_retries {
                        if attempt >= max {
                            tracing::error!(max_retries = max, "MQTT reconnection limit reached, giving up");
                            break;
                        }
                    }

                    let delay = calculate_backoff(attempt, &reconnect);
                    tracing::info!(
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        attempt,
                        "Waiting before reconnect"
                    );

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            },
        }
    }

    tracing::debug!("MQTT driver exiting");
}

/// Decode a publish into an [`IncomingMessage`]. Non-JSON payloads become
/// `Value::Null`; only their arrival matters (telemetry).
fn decode_publish(publish: &Publish) -> IncomingMessage {
    let payload = serde_json::from_slice(&publish.payload).unwrap_or_else(|e| {
        tracing::debug!(error = %e, topic = %publish.topic, "non-JSON payload");
        Value::Null
    });
    IncomingMessage::new(publish.topic.clone(), payload)
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`, jitter is +-25%.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
