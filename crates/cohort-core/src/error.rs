//! Core error types for cohort-core.
//!
//! This module defines a comprehensive error hierarchy using thiserror
//! for better error handling and reporting across the library.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for cohort-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Attachment-store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Collaborator service errors (directory, push gateway, ops webhook)
    #[error("Gateway error for '{service}': {message}")]
    Gateway {
        service: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Catalog errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Attachment-store errors. All variants are treated as transient by the
/// runner: the affected participant is skipped and retried next cycle.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport-level failure
    #[error("Request for '{key}' failed: {message}")]
    RequestFailed { key: String, message: String },

    /// Non-success HTTP status
    #[error("Store returned status {status} for '{key}'")]
    BadStatus { status: u16, key: String },

    /// Stored document did not match the expected shape
    #[error("Failed to decode document '{key}': {message}")]
    Decode { key: String, message: String },

    /// A verify-after-write readback did not match what was written
    #[error("Write to '{key}' was overwritten by a concurrent writer")]
    WriteConflict { key: String },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Missing required configuration key
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Catalog errors. A missing activity aborts the whole module activation
/// so the directory never ends up with a half-scheduled module.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// An activity named by a module descriptor does not exist for the
    /// participant
    #[error("Activity '{activity}' required by module '{module}' not found in directory")]
    MissingActivity { module: String, activity: String },

    /// A stored assignment references a module the catalog no longer knows
    #[error("Unknown module '{0}' in assignment record")]
    UnknownModule(String),

    /// No tier descriptor at the given position
    #[error("No incentive tier at index {0}")]
    UnknownTier(usize),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid time window
    #[error("Invalid window: end ({end_ms}) must be greater than start ({start_ms})")]
    InvalidWindow { start_ms: i64, end_ms: i64 },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

// Helper implementations for converting from other error types

impl From<Box<dyn std::error::Error + Send + Sync>> for CoreError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        CoreError::Custom(err.to_string())
    }
}

impl CoreError {
    /// Wrap a collaborator failure with the service name it came from.
    pub fn gateway(service: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Gateway {
            service: service.into(),
            message: message.into(),
            source: None,
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
