//! TOML configuration
//!
//! Looked up in this order:
//!
//! 1. the first command line argument
//! 2. `$EVDEV_JOY_CONFIG`
//! 3. `<config dir>/evdev-joy/config.toml`
//!
//! A missing file is not an error; every field has a default.

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::JoystickSettings;
use crate::mqtt::config::MqttConfig;

pub const CONFIG_ENV: &str = "EVDEV_JOY_CONFIG";
const CONFIG_DIR: &str = "evdev-joy";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct JoyConfig {
    pub device_file_path: PathBuf,
    pub axes_mapping: Vec<String>,
    pub buttons_mapping: Vec<String>,
    pub max_send_frequency: f64,
    pub fail_safe: bool,
    pub frame_id: String,
    pub mqtt: MqttConfig,
}

impl Default for JoyConfig {
    fn default() -> Self {
        Self {
            device_file_path: PathBuf::from("/dev/input/event0"),
            axes_mapping: Vec::new(),
            buttons_mapping: Vec::new(),
            max_send_frequency: 100.0,
            fail_safe: true,
            frame_id: "joy_link".to_string(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl JoyConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_send_frequency.is_finite() && self.max_send_frequency > 0.0) {
            return Err(eyre!(
                "max_send_frequency must be > 0, got {}",
                self.max_send_frequency
            ));
        }
        if self.axes_mapping.is_empty() && self.buttons_mapping.is_empty() {
            warn!("Neither axes nor buttons are mapped, published arrays will be empty");
        }
        Ok(())
    }

    /// Reads `path`, falling back to defaults if it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn joystick_settings(&self) -> JoystickSettings {
        JoystickSettings {
            device_file_path: self.device_file_path.clone(),
            axes_mapping: self.axes_mapping.clone(),
            buttons_mapping: self.buttons_mapping.clone(),
            max_send_frequency: self.max_send_frequency,
            fail_safe: self.fail_safe,
            frame_id: self.frame_id.clone(),
            ..JoystickSettings::default()
        }
    }
}

/// Picks the config path from the argument, the environment or the user config dir.
pub fn resolve_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    if let Some(arg) = arg {
        return PathBuf::from(arg);
    }
    if let Some(env) = env.filter(|env| !env.is_empty()) {
        return PathBuf::from(env);
    }

    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("No config directory found, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
