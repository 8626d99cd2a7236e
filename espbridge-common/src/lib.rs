//! Shared pieces of the ESPHome vehicle bridge.
//!
//! Entity values ([`StateValue`]), the configuration sections every bridge
//! carries ([`ZenohConfig`], [`LoggingConfig`]), Zenoh session setup and the
//! key expressions telemetry is published on.

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod session;
pub mod value;

pub use config::{LogFormat, LoggingConfig, ZenohConfig};
pub use error::{Error, Result};
pub use keyexpr::{DEFAULT_KEY_PREFIX, TopicBuilder};
pub use session::connect;
pub use value::StateValue;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber
/// is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let output = match config.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))
}
