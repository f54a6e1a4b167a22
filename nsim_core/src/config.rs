//! Model configuration.

use crate::error::{NsimError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What happens when the retained snapshot count exceeds `state_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Drop every retained snapshot and start over (historical behaviour)
    #[default]
    HardReset,
    /// Evict the oldest snapshot, keeping the newest `state_memory`
    SlidingWindow,
}

/// Configuration for a model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Seed of the model's random stream
    pub seed: u64,

    /// Track an N x N utility matrix
    pub utility: bool,

    /// Maximum retained snapshots (0 = unbounded)
    pub state_memory: usize,

    /// Retain a snapshot every `memory_interval` ticks
    pub memory_interval: u64,

    /// Behaviour once `state_memory` is exceeded
    pub retention: RetentionPolicy,

    /// Stream snapshots to `path`
    pub save_disk: bool,

    /// Snapshot file path (required with `save_disk`)
    pub path: Option<PathBuf>,

    /// Write a snapshot to disk every `save_interval` ticks
    pub save_interval: u64,

    /// Log progress every `progress_interval` ticks (0 = silent)
    pub progress_interval: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            utility: false,
            state_memory: 0,
            memory_interval: 1,
            retention: RetentionPolicy::HardReset,
            save_disk: false,
            path: None,
            save_interval: 1,
            progress_interval: 100,
        }
    }
}

impl ModelConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_interval == 0 {
            return Err(NsimError::configuration("memory_interval must be at least 1"));
        }
        if self.save_interval == 0 {
            return Err(NsimError::configuration("save_interval must be at least 1"));
        }
        if self.save_disk && self.path.is_none() {
            return Err(NsimError::configuration("save_disk requires a path"));
        }
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_utility(mut self, utility: bool) -> Self {
        self.utility = utility;
        self
    }

    pub fn with_state_memory(mut self, cap: usize, retention: RetentionPolicy) -> Self {
        self.state_memory = cap;
        self.retention = retention;
        self
    }

    pub fn with_memory_interval(mut self, interval: u64) -> Self {
        self.memory_interval = interval;
        self
    }

    /// Enables disk streaming to `path` every `interval` ticks.
    pub fn with_disk(mut self, path: impl Into<PathBuf>, interval: u64) -> Self {
        self.save_disk = true;
        self.path = Some(path.into());
        self.save_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory_interval, 1);
        assert_eq!(config.retention, RetentionPolicy::HardReset);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ModelConfig::from_json_str(
            r#"{ "utility": true, "state_memory": 5, "retention": "sliding_window" }"#,
        )
        .unwrap();

        assert!(config.utility);
        assert_eq!(config.state_memory, 5);
        assert_eq!(config.retention, RetentionPolicy::SlidingWindow);
        assert_eq!(config.memory_interval, 1);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            ModelConfig::from_json_str(r#"{ "memory_interval": 0 }"#),
            Err(NsimError::Configuration(_))
        ));
        assert!(matches!(
            ModelConfig::from_json_str(r#"{ "save_disk": true }"#),
            Err(NsimError::Configuration(_))
        ));
        assert!(matches!(
            ModelConfig::from_json_str("{ not json"),
            Err(NsimError::Json(_))
        ));
    }
}
