use thiserror::Error;

/// Errors from the shared bridge plumbing.
#[derive(Debug, Error)]
pub enum Error {
    /// The Zenoh settings cannot be turned into a session configuration.
    #[error("Invalid Zenoh settings: {0}")]
    ZenohConfig(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),

    #[error("Invalid key expression: {0}")]
    KeyExpr(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
