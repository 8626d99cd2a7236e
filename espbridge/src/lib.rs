//! Bridge between ESPHome-style vehicle controllers, an HTTP API and a
//! Zenoh telemetry feed.
//!
//! Each configured device gets one [`ConnectionSupervisor`] task that owns
//! its connection: connect, discover entities, subscribe to state changes,
//! keep the link alive and reconnect after failures. Normalized values land
//! in the device's [`StateStore`], are forwarded to telemetry, and are
//! served over HTTP. Commands go through the [`CommandDispatcher`], which
//! rides out reconnects with a bounded wait and a single retry.
//!
//! # Key Expressions
//!
//! ```text
//! evcc/tesla/<device>/<topic>     telemetry (soc, connected, charging)
//! evcc/tesla/@/status             bridge status (running / offline)
//! ```

pub mod client;
pub mod compat;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod http;
pub mod normalize;
pub mod registry;
pub mod simulator;
pub mod store;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod fake;

use std::sync::Arc;

use espbridge_framework::{BridgeArgs, BridgeRunner};
use tokio_util::sync::CancellationToken;

pub use client::{ConnectParams, DeviceClient, DeviceConnector, EntityDescriptor, StateMessage};
pub use compat::CompatibilityShim;
pub use config::EspBridgeConfig;
pub use dispatcher::{Action, CommandDispatcher, EntityCommand};
pub use entity::{EntityCatalog, EntityKind, EntityRecord};
pub use error::{ClientError, CommandError};
pub use registry::{ConnectionState, DeviceHandle, DeviceRegistry};
pub use store::{StateKey, StateSnapshot, StateStore};
pub use supervisor::{ConnectionSupervisor, SupervisorSettings};
pub use telemetry::{NoopTelemetry, TelemetrySink, TopicMap, ZenohTelemetry};

/// Core services wired from a configuration.
pub struct Bridge {
    pub registry: Arc<DeviceRegistry>,
    pub shim: Arc<CompatibilityShim>,
    /// One per configured device, not yet running.
    pub supervisors: Vec<ConnectionSupervisor>,
}

impl Bridge {
    /// Register every configured device and prepare its supervisor.
    ///
    /// Supervisors stop when `shutdown` is cancelled.
    pub fn new(
        config: &EspBridgeConfig,
        connector: Arc<dyn DeviceConnector>,
        telemetry: Arc<dyn TelemetrySink>,
        shutdown: &CancellationToken,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let topics = Arc::new(TopicMap::new(config.telemetry.topics.clone()));
        let settings = config.supervisor.settings();

        let supervisors = config
            .devices()
            .map(|(id, device)| {
                ConnectionSupervisor::new(
                    registry.get_or_create(id),
                    ConnectParams::from(device),
                    connector.clone(),
                    telemetry.clone(),
                    topics.clone(),
                    settings,
                    shutdown.child_token(),
                )
            })
            .collect();

        let dispatcher = CommandDispatcher::new(registry.clone(), config.dispatcher.connect_wait());
        let shim = Arc::new(CompatibilityShim::new(dispatcher));

        Self {
            registry,
            shim,
            supervisors,
        }
    }
}

/// Run the bridge until Ctrl+C or SIGTERM, with devices reached through `connector`.
pub async fn run_bridge(
    config: EspBridgeConfig,
    args: Option<&BridgeArgs>,
    connector: Arc<dyn DeviceConnector>,
) -> espbridge_framework::Result<()> {
    let listen = config.listen_addr()?;
    let mut runner = BridgeRunner::new_with_args("espbridge", config.clone(), args)
        .await?
        .with_status_publishing();
    let shutdown = runner.shutdown_token();

    let telemetry: Arc<dyn TelemetrySink> = match runner.publisher() {
        Some(publisher) => {
            let (sink, worker) = ZenohTelemetry::new(publisher, config.telemetry.queue_capacity);
            runner.spawn(worker.run(shutdown.clone()));
            Arc::new(sink)
        }
        None => Arc::new(NoopTelemetry),
    };

    let bridge = Bridge::new(&config, connector, telemetry, &shutdown);
    for supervisor in bridge.supervisors {
        runner.spawn(supervisor.run());
    }

    let server = http::HttpServer::new(
        http::AppState::new(bridge.shim.clone(), runner.version()),
        listen,
    );
    let token = shutdown.clone();
    runner.spawn_with_error("http".to_string(), async move {
        let result = server.run(token.clone()).await;
        if result.is_err() {
            token.cancel();
        }
        result
    });

    let metadata = serde_json::json!({
        "devices": config.device_ids(),
        "http": config.http.listen,
        "telemetry": config.telemetry.enable,
    });
    runner.run_with_metadata(Some(metadata)).await
}
