//! Configuration management for huddle
//!
//! Settings live in `<config dir>/huddle/config.toml`. Any value can be
//! overridden from the environment with a `HUDDLE_` prefix, nested keys
//! separated by `__` (e.g. `HUDDLE_SIGNAL_BUFFER__TTL_MS=2000`).

use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use voice_core::Error;

const ENV_PREFIX: &str = "HUDDLE";

/// Bounds for negotiation payloads received before their peer link exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBufferSettings {
    /// Payloads kept per participant; older ones are dropped first
    pub max_per_peer: usize,
    /// How long a buffered payload stays eligible for replay
    pub ttl_ms: u64,
}

impl Default for SignalBufferSettings {
    fn default() -> Self {
        Self {
            max_per_peer: 32,
            ttl_ms: 5000,
        }
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Display name announced to the channel
    pub username: String,

    /// WebSocket address of the signaling relay
    pub relay_url: String,

    /// List of STUN/TURN servers for WebRTC connectivity
    pub ice_servers: Vec<String>,

    /// Preferred audio input device (empty string means system default)
    pub audio_input_device: String,

    /// Preferred audio output device (empty string means system default)
    pub audio_output_device: String,

    /// Whether screen sharing may be started
    pub screen_share: bool,

    pub signal_buffer: SignalBufferSettings,

    /// Default log filter when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            relay_url: "ws://127.0.0.1:3001".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:3478".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            audio_input_device: "".to_string(),
            audio_output_device: "".to_string(),
            screen_share: true,
            signal_buffer: SignalBufferSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load settings from the user's config directory
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push("huddle");

        Self::with_file(config_dir.join("config.toml"))
    }

    /// Create a ConfigManager backed by a custom file path
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::load(path.as_ref(), ENV_PREFIX)
    }

    fn load(path: &Path, env_prefix: &str) -> Result<Self, Error> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
        }

        let defaults = Config::try_from(&Settings::default())
            .map_err(|e| Error::Config(format!("Failed to build defaults: {}", e)))?;
        let settings = Config::builder()
            .add_source(defaults)
            .add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ice_servers")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| Error::Config(format!("Failed to load config: {}", e)))?;

        Ok(Self {
            settings,
            config_file: path.to_path_buf(),
        })
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.config_file
    }
}
