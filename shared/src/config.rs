use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::edit::WritePolicy;
use crate::error::ConfigError;
use crate::image_processing::CompressionConfig;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after the last keystroke before a row edit is written.
    pub debounce_ms: u64,
    pub write_policy: WritePolicy,
    pub compression: CompressionConfig,
    /// Top-level folder for uploaded photos.
    pub storage_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            write_policy: WritePolicy::default(),
            compression: CompressionConfig::default(),
            storage_prefix: "seaRows".into(),
        }
    }
}

impl EngineConfig {
    const MAX_DEBOUNCE_MS: u64 = 60_000;

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ms == 0 || self.debounce_ms > Self::MAX_DEBOUNCE_MS {
            return Err(ConfigError::Invalid(format!(
                "debounce_ms must be in 1..={}",
                Self::MAX_DEBOUNCE_MS
            )));
        }
        let prefix = self.storage_prefix.as_str();
        if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(ConfigError::Invalid(
                "storage_prefix must be non-empty without leading or trailing '/'".into(),
            ));
        }
        self.write_policy.validate().map_err(ConfigError::Invalid)?;
        self.compression.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Parses overrides on top of the defaults and validates the result.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
