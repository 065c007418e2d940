//! Error types for the xctest runner
//!
//! Messages name the configuration, device or service involved so a
//! failed run can be diagnosed from the error alone.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the xctest runner
#[derive(Error, Debug)]
pub enum Error {
    // === Run Admission Errors ===
    #[error("Cannot start a test run for {requested}: another run is already in progress")]
    ConcurrencyConflict { requested: String },

    // === Launch Errors ===
    #[error("Failed to write run configuration: {0}")]
    ConfigurationWrite(String),

    #[error("Test runner '{name}' not found. Searched: {searched}")]
    ToolNotFound { name: String, searched: String },

    #[error("Test runner failed to start: {0}")]
    SpawnFailed(String),

    #[error("Failed to query running processes: {0}")]
    InventoryQuery(String),

    // === Process Lifecycle Errors ===
    #[error("No output from test runner within {0:?}")]
    LivenessTimeout(Duration),

    #[error("{label} (pid {pid}) exited unsuccessfully: {status}")]
    ProcessFailed {
        label: String,
        pid: u32,
        status: String,
    },

    // === Device Errors ===
    #[error("Failed to open service '{service}': {reason}")]
    Channel { service: String, reason: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a tool not found error listing every location searched
    pub fn tool_not_found<S: AsRef<str>>(name: &str, searched: &[S]) -> Self {
        Self::ToolNotFound {
            name: name.to_string(),
            searched: searched
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Create a channel error for the given service
    pub fn channel(service: &str, reason: impl ToString) -> Self {
        Self::Channel {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from the single-flight guard rejecting a run
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
