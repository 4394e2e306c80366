//! Engine configuration
//!
//! Loaded from a YAML file, with `MIDI_INPUT`, `MIDI_OUTPUT` and
//! `MIDI_LATENCY` from the environment taking precedence.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::clock::Timestamp;
use crate::error::{MidiError, Result};
use crate::sysex::DeliveryOrder;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Period of the tick thread
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Packets taken from the driver per read
    #[serde(default = "default_read_batch")]
    pub read_batch: usize,
    /// Client name registered with the host MIDI system
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_port: Option<String>,
    /// Default latency for output streams, 0 for immediate-only
    #[serde(default)]
    pub latency_ms: Timestamp,
    #[serde(default)]
    pub delivery_order: DeliveryOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            read_batch: default_read_batch(),
            client_name: default_client_name(),
            input_port: None,
            output_port: None,
            latency_ms: 0,
            delivery_order: DeliveryOrder::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await.map_err(|e| {
            MidiError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&contents)
            .map_err(|e| MidiError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn parse(yaml: &str) -> std::result::Result<Self, String> {
        let config: EngineConfig = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| MidiError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, yaml).await.map_err(|e| {
            MidiError::Config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Overlay the process environment
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up through `lookup`. Empty values are ignored.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(name) = get("MIDI_INPUT") {
            self.input_port = Some(name);
        }
        if let Some(name) = get("MIDI_OUTPUT") {
            self.output_port = Some(name);
        }
        if let Some(value) = get("MIDI_LATENCY") {
            match value.trim().parse() {
                Ok(latency) => self.latency_ms = latency,
                Err(_) => warn!("Ignoring MIDI_LATENCY={:?}: not a number of milliseconds", value),
            }
        }
        self
    }

    /// Defaults plus the process environment
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be at least 1".to_string());
        }
        if self.read_batch == 0 {
            return Err("read_batch must be at least 1".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_tick_interval_ms() -> u64 { 1 }
fn default_read_batch() -> usize { 32 }
fn default_client_name() -> String { "midiclock".to_string() }
