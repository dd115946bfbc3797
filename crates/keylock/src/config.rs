//! Registry configuration with TOML loading

use crate::locking::saturating_millis;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`KeyLock`](crate::KeyLock) registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLockConfig {
    /// Number of keys the map is pre-sized for
    pub initial_capacity: usize,

    /// Budget used by `acquire_with_default_timeout`, in milliseconds
    pub default_timeout_ms: u64,

    /// Buffer size of the lock event channel
    pub event_capacity: usize,
}

impl Default for KeyLockConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 0,
            default_timeout_ms: 30_000,
            event_capacity: 256,
        }
    }
}

impl KeyLockConfig {
    /// Set the initial map capacity
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// The default timeout as a [`Duration`]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: KeyLockConfig =
            toml::from_str(contents).context("Failed to parse keylock config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Serialize the configuration as TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize keylock config")
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}
