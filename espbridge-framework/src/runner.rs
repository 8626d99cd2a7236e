//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use espbridge_common::{LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;

/// How long spawned workers get to finish their teardown after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bridge runner that manages the lifecycle of the bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection (only when telemetry is enabled)
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C / SIGTERM through a [`CancellationToken`]
/// - Status publishing (optional)
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session, absent when telemetry is disabled.
    session: Option<Arc<zenoh::Session>>,
    /// Publisher for telemetry.
    publisher: Option<Publisher>,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
    /// Cancelled once on shutdown; every worker observes it.
    shutdown: CancellationToken,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config
    /// 2. Connect to Zenoh if telemetry is enabled
    /// 3. Create the publisher
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        // Initialize logging with optional CLI override
        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::Logging(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let (session, publisher) = match config.zenoh() {
            Some(zenoh_config) => {
                let session = Arc::new(
                    connect(zenoh_config)
                        .await
                        .map_err(|e| BridgeError::Telemetry(e.to_string()))?,
                );
                let publisher = Publisher::new(session.clone(), config.key_prefix());
                (Some(session), Some(publisher))
            }
            None => {
                tracing::info!("Telemetry disabled, not connecting to Zenoh");
                (None, None)
            }
        };

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled (and telemetry is on), the runner publishes status
    /// messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = self
            .publisher
            .clone()
            .map(|p| StatusPublisher::new(p, &self.name, &self.version));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the publisher, if telemetry is enabled.
    pub fn publisher(&self) -> Option<Publisher> {
        self.publisher.clone()
    }

    /// Token cancelled when the bridge shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// Workers should observe [`shutdown_token`](Self::shutdown_token); any
    /// still running after the grace period are aborted.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
            }
        });
        self.tasks.push(handle);
    }

    /// Run the bridge until Ctrl+C or SIGTERM is received.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for a shutdown signal
    /// 3. Cancel the shutdown token and wait for workers to finish
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the Zenoh session
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    pub async fn run_with_metadata(mut self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(status_pub) = self.status_publisher.as_mut() {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!(bridge = %self.name, "Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!(bridge = %self.name, "Shutdown requested");
            }
        }

        self.shutdown.cancel();

        let mut tasks = self.tasks;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Workers did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Some(session) = self.session {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "Error closing Zenoh session");
            }
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
