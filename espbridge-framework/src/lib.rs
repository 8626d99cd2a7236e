//! ESPHome Bridge Framework
//!
//! Common abstractions for running a device bridge that serves an HTTP API
//! and publishes telemetry to Zenoh.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Publisher`] for publishing telemetry to Zenoh
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`StatusPublisher`] for availability announcements
//!
//! # Example
//!
//! ```ignore
//! use espbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("espbridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("espbridge", config, Some(&args)).await?;
//!
//!     // Spawn workers; they observe the runner's shutdown token
//!     let shutdown = runner.shutdown_token();
//!     runner.spawn(my_worker(shutdown));
//!
//!     // Run until Ctrl+C / SIGTERM
//!     runner.run().await
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{PublishStats, Publisher};
pub use runner::BridgeRunner;
pub use status::{Availability, BridgeStatus, StatusPublisher};

// Re-export commonly used types from espbridge-common
pub use espbridge_common::{LogFormat, LoggingConfig, StateValue, TopicBuilder, ZenohConfig};
