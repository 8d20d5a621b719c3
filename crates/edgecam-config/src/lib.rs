//! Shared configuration for edgecam tools.
//!
//! TOML device profiles, Wi-Fi secret resolution (env + plaintext), and
//! translation to `edgecam_core::SessionConfig` and provisioning
//! parameters. The CLI layers its global flags on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use edgecam_core::{ApplicationConfig, ApplicationType, Endpoint, QrParams, SessionConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no device profile named '{name}'")]
    UnknownDevice { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Device used when `--device` is not given.
    pub default_device: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named device profiles.
    #[serde(default)]
    pub devices: HashMap<String, DeviceProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_device: Some("default".into()),
            defaults: Defaults::default(),
            devices: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Parent of per-device working directories.
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_broker_program")]
    pub broker_program: String,

    #[serde(default = "default_ntp_server")]
    pub ntp_server: String,

    /// Seconds to wait for a deployment to be confirmed.
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout: u64,

    /// Seconds between storage rescans.
    #[serde(default = "default_watch_interval")]
    pub watch_interval: u64,

    /// Seconds an unmatched image or inference waits for its counterpart.
    #[serde(default = "default_pair_timeout")]
    pub pair_timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            data_dir: None,
            broker_program: default_broker_program(),
            ntp_server: default_ntp_server(),
            deploy_timeout: default_deploy_timeout(),
            watch_interval: default_watch_interval(),
            pair_timeout: default_pair_timeout(),
        }
    }
}

fn default_broker_program() -> String {
    "mosquitto".into()
}
fn default_ntp_server() -> String {
    "pool.ntp.org".into()
}
fn default_deploy_timeout() -> u64 {
    30
}
fn default_watch_interval() -> u64 {
    5
}
fn default_pair_timeout() -> u64 {
    60
}

/// A named device profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceProfile {
    /// Broker host the device connects to.
    #[serde(default = "default_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default)]
    pub tls: bool,

    /// Address the ingestion webserver is advertised under.
    #[serde(default = "default_host")]
    pub webserver_host: String,

    #[serde(default = "default_webserver_port")]
    pub webserver_port: u16,

    /// Launch a local broker when `mqtt_host` is this machine.
    #[serde(default = "default_true")]
    pub spawn_broker: bool,

    /// Override the per-device working directory.
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub application: ApplicationType,

    /// FlatBuffers schema for inference decoding.
    pub schema_file: Option<PathBuf>,

    /// Quota for stored frames, in megabytes.
    pub storage_limit_mb: Option<u64>,

    /// Override the deployment timeout, in seconds.
    pub deploy_timeout: Option<u64>,

    // ── Provisioning ──
    pub wifi_ssid: Option<String>,

    /// Wi-Fi password (plaintext; prefer `wifi_password_env`).
    pub wifi_password: Option<String>,

    /// Environment variable holding the Wi-Fi password.
    pub wifi_password_env: Option<String>,

    pub ip_address: Option<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub dns_server: Option<String>,

    /// Override the NTP server from `defaults`.
    pub ntp_server: Option<String>,
}

fn default_host() -> String {
    "localhost".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_webserver_port() -> u16 {
    8000
}
fn default_true() -> bool {
    true
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "edgecam", "edgecam")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default parent of per-device working directories.
pub fn data_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("data"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn home_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("edgecam");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("EDGECAM_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profile resolution ──────────────────────────────────────────────

/// Pick the profile named `requested`, else the default device. With no
/// profiles configured at all, the built-in profile is used.
pub fn resolve_device(
    cfg: &Config,
    requested: Option<&str>,
) -> Result<(String, DeviceProfile), ConfigError> {
    let name = requested
        .map(str::to_string)
        .or_else(|| cfg.default_device.clone())
        .unwrap_or_else(|| "default".into());

    match cfg.devices.get(&name) {
        Some(profile) => Ok((name, profile.clone())),
        None if cfg.devices.is_empty() && requested.is_none() => {
            Ok((name, builtin_profile()))
        }
        None => Err(ConfigError::UnknownDevice { name }),
    }
}

/// The profile used when nothing is configured.
pub fn builtin_profile() -> DeviceProfile {
    DeviceProfile {
        mqtt_host: default_host(),
        mqtt_port: default_mqtt_port(),
        webserver_host: default_host(),
        webserver_port: default_webserver_port(),
        spawn_broker: true,
        ..DeviceProfile::default()
    }
}

/// Resolve the Wi-Fi password: named env var first, then plaintext.
pub fn resolve_wifi_password(profile: &DeviceProfile) -> Option<SecretString> {
    if let Some(ref env_name) = profile.wifi_password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }
    profile
        .wifi_password
        .as_ref()
        .map(|pw| SecretString::from(pw.clone()))
}

fn validate_host(field: &str, host: &str) -> Result<(), ConfigError> {
    if host.trim().is_empty() || host.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("'{host}' is not a host name or address"),
        });
    }
    Ok(())
}

fn validate_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

/// Build a `SessionConfig` from a profile. `webserver_port = 0` selects
/// an ephemeral port; the broker port must be concrete.
pub fn profile_to_session_config(
    profile: &DeviceProfile,
    name: &str,
    defaults: &Defaults,
) -> Result<SessionConfig, ConfigError> {
    validate_host("mqtt_host", &profile.mqtt_host)?;
    validate_host("webserver_host", &profile.webserver_host)?;
    if profile.mqtt_port == 0 {
        return Err(ConfigError::Validation {
            field: "mqtt_port".into(),
            reason: "port 0 cannot be dialed by the device".into(),
        });
    }
    let deploy_timeout = profile.deploy_timeout.unwrap_or(defaults.deploy_timeout);
    validate_positive("deploy_timeout", deploy_timeout)?;
    validate_positive("watch_interval", defaults.watch_interval)?;
    validate_positive("pair_timeout", defaults.pair_timeout)?;
    if let Some(limit) = profile.storage_limit_mb {
        validate_positive("storage_limit_mb", limit)?;
    }
    if let Some(schema) = &profile.schema_file {
        if !schema.is_file() {
            return Err(ConfigError::Validation {
                field: "schema_file".into(),
                reason: format!("{} is not a file", schema.display()),
            });
        }
    }

    let root = profile.data_dir.clone().unwrap_or_else(|| {
        defaults
            .data_dir
            .clone()
            .unwrap_or_else(data_dir)
            .join(name)
    });

    let mut session = SessionConfig::with_root(name, root);
    session.mqtt = Endpoint::new(profile.mqtt_host.clone(), profile.mqtt_port);
    session.tls = profile.tls;
    session.webserver = Endpoint::new(profile.webserver_host.clone(), profile.webserver_port);
    session.spawn_broker = profile.spawn_broker;
    session.broker_program = PathBuf::from(&defaults.broker_program);
    session.application = ApplicationConfig {
        app_type: profile.application,
        schema_file: profile.schema_file.clone(),
    };
    session.storage_limit = profile.storage_limit_mb.map(|mb| mb * 1024 * 1024);
    session.watch_interval = Duration::from_secs(defaults.watch_interval);
    session.deploy_timeout = Duration::from_secs(deploy_timeout);
    session.pair_timeout = Duration::from_secs(defaults.pair_timeout);
    Ok(session)
}

/// Provisioning parameters for a profile. `mqtt_host` is the address the
/// device should dial, which may differ from the configured one.
pub fn profile_to_qr_params(
    profile: &DeviceProfile,
    defaults: &Defaults,
    mqtt_host: String,
) -> QrParams {
    QrParams {
        mqtt_host,
        mqtt_port: profile.mqtt_port,
        tls_enabled: profile.tls,
        ntp_server: profile
            .ntp_server
            .clone()
            .unwrap_or_else(|| defaults.ntp_server.clone()),
        wifi_ssid: profile.wifi_ssid.clone(),
        wifi_password: resolve_wifi_password(profile),
        ip_address: profile.ip_address.clone(),
        subnet_mask: profile.subnet_mask.clone(),
        gateway: profile.gateway.clone(),
        dns_server: profile.dns_server.clone(),
    }
}
