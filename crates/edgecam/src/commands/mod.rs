//! Command handlers and the profile plumbing they share.

pub mod config_cmd;
pub mod deploy;
pub mod ifaces;
pub mod qr;
pub mod run;
pub mod sink;

use edgecam_config::{Config, ConfigError, DeviceProfile};
use edgecam_core::SessionConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config named by `--config`, or the canonical one.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let config = match &global.config {
        Some(path) => edgecam_config::load_config_from(path)?,
        None => edgecam_config::load_config()?,
    };
    Ok(config)
}

/// The active device profile, resolved from `--device` and the config.
pub struct ActiveDevice {
    pub config: Config,
    pub name: String,
    pub profile: DeviceProfile,
}

impl ActiveDevice {
    pub fn resolve(global: &GlobalOpts) -> Result<Self, CliError> {
        let config = load_config(global)?;
        let (name, profile) = match edgecam_config::resolve_device(&config, global.device.as_deref()) {
            Ok(found) => found,
            Err(ConfigError::UnknownDevice { name }) => {
                let mut available: Vec<_> = config.devices.keys().cloned().collect();
                available.sort();
                return Err(CliError::DeviceNotFound {
                    name,
                    available: available.join(", "),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            config,
            name,
            profile,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig, CliError> {
        let session = edgecam_config::profile_to_session_config(
            &self.profile,
            &self.name,
            &self.config.defaults,
        )?;
        Ok(session)
    }
}
