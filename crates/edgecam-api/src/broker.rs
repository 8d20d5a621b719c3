//! Embedded MQTT broker.
//!
//! Runs a `mosquitto` child process listening on the session's broker port
//! with anonymous access. The port is leased from the [`PortRegistry`]
//! first, so two sessions in one process can never fight over it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use crate::error::Error;
use crate::ports::{PortLease, PortRegistry};

const READY_POLL: Duration = Duration::from_millis(100);

/// How to launch the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker executable. Resolved through `PATH` when relative.
    pub program: PathBuf,
    pub port: u16,
    /// How long to wait for the listener to accept connections.
    pub ready_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mosquitto"),
            port: 1883,
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// A running broker process. Killed on [`stop`](Self::stop) or drop.
#[derive(Debug)]
pub struct BrokerHandle {
    child: Child,
    _config_dir: TempDir,
    lease: PortLease,
}

impl BrokerHandle {
    pub async fn spawn(config: &BrokerConfig, registry: &PortRegistry) -> Result<Self, Error> {
        let port = config.port;
        let lease = registry.acquire(port, "mqtt broker")?;

        // A foreign listener on the port counts as a collision.
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(probe) => drop(probe),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(Error::Broker {
                    port,
                    reason: "address in use".into(),
                });
            }
            Err(e) => {
                return Err(Error::Broker {
                    port,
                    reason: e.to_string(),
                });
            }
        }

        let config_dir = tempfile::tempdir()?;
        let config_path = config_dir.path().join("mosquitto.conf");
        tokio::fs::write(&config_path, broker_config(port)).await?;

        let mut child = Command::new(&config.program)
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Broker {
                port,
                reason: format!("cannot launch {}: {e}", config.program.display()),
            })?;

        wait_ready(&mut child, port, config.ready_timeout).await?;
        tracing::info!(port, "MQTT broker started");

        Ok(Self {
            child,
            _config_dir: config_dir,
            lease,
        })
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Kill the broker and wait for it to exit. Releases the port lease.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "broker already exited");
        }
        match self.child.wait().await {
            Ok(status) => tracing::info!(port = self.port(), %status, "MQTT broker stopped"),
            Err(e) => tracing::warn!(port = self.port(), error = %e, "failed to reap broker"),
        }
    }
}

fn broker_config(port: u16) -> String {
    format!("listener {port}\nallow_anonymous true\n")
}

async fn wait_ready(child: &mut Child, port: u16, timeout: Duration) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::Broker {
                port,
                reason: format!("exited during startup ({status})"),
            });
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Broker {
                port,
                reason: format!("not accepting connections after {}s", timeout.as_secs()),
            });
        }
        tokio::time::sleep(READY_POLL).await;
    }
}
