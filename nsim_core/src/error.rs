//! Error types for the simulation engine.

use thiserror::Error;

/// Errors raised while configuring or running a model.
#[derive(Debug, Error)]
pub enum NsimError {
    /// The model was configured inconsistently (detected at setup time)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An update, condition or network operation failed during a tick
    #[error("Execution error: {0}")]
    Execution(String),

    /// Snapshot file could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file contents are malformed
    #[error("Snapshot format error: {0}")]
    Format(String),

    /// Configuration file could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NsimError {
    /// Creates a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Creates a snapshot format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Error for a state name that was never declared with `set_states`.
    pub fn unknown_state(name: &str) -> Self {
        Self::Configuration(format!("Unknown state '{}'", name))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NsimError>;
