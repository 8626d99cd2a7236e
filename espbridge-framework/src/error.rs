//! Errors raised while starting and running a bridge.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Not valid JSON5, or does not match the configuration schema.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    /// The Zenoh session backing the telemetry feed could not be opened.
    #[error("Telemetry unavailable: {0}")]
    Telemetry(String),

    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}
