//! Error types for the scenario harness.

use nsim_core::NsimError;
use thiserror::Error;

/// Errors raised by scenarios, exports and sensitivity runs.
#[derive(Debug, Error)]
pub enum SimError {
    /// The engine rejected the model or failed during a tick
    #[error(transparent)]
    Engine(#[from] NsimError),

    /// Unknown scenario name
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// Visualization settings do not match the model
    #[error("Export error: {0}")]
    Export(String),

    /// Sensitivity settings are invalid
    #[error("Sensitivity error: {0}")]
    Sensitivity(String),

    /// Export file could not be written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Export could not be serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Creates an export error.
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Creates a sensitivity error.
    pub fn sensitivity(msg: impl Into<String>) -> Self {
        Self::Sensitivity(msg.into())
    }
}

/// Result alias for the harness.
pub type Result<T> = std::result::Result<T, SimError>;
