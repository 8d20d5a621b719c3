// edgecam-api: wire side of an edge-AI camera session (MQTT, broker, uploads)

pub mod broker;
pub mod error;
pub mod mqtt;
pub mod ports;
pub mod topics;
pub mod transport;
pub mod webserver;

pub use broker::{BrokerConfig, BrokerHandle};
pub use error::Error;
pub use mqtt::{MqttConfig, MqttConnector, MqttTransport, ReconnectConfig};
pub use ports::{PortLease, PortRegistry};
pub use transport::{Connector, Driver, IncomingMessage, Transport, TransportLink};
pub use webserver::{IngestionServer, WebserverConfig};
