//! Per-device connection supervisor.
//!
//! One supervisor task owns one device connection. Each connection attempt
//! is an *epoch*: connect, discover, subscribe, serve until failure, tear
//! down, cool down, repeat. Only cancellation ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectParams, DeviceClient, DeviceConnector, StateMessage};
use crate::entity::EntityCatalog;
use crate::error::ClientError;
use crate::normalize;
use crate::registry::{Connection, ConnectionState, DeviceHandle};
use crate::telemetry::{TelemetrySink, TopicMap};

/// Supervisor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Delay between a failure and the next connection attempt.
    pub cooldown: Duration,
    /// Interval of the keepalive ping while ready.
    pub keepalive: Duration,
    /// Upper bound on the best-effort disconnect during teardown.
    pub disconnect_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            keepalive: Duration::from_secs(60),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives the connection lifecycle of one device.
pub struct ConnectionSupervisor {
    device: Arc<DeviceHandle>,
    params: ConnectParams,
    connector: Arc<dyn DeviceConnector>,
    telemetry: Arc<dyn TelemetrySink>,
    topics: Arc<TopicMap>,
    settings: SupervisorSettings,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        device: Arc<DeviceHandle>,
        params: ConnectParams,
        connector: Arc<dyn DeviceConnector>,
        telemetry: Arc<dyn TelemetrySink>,
        topics: Arc<TopicMap>,
        settings: SupervisorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            params,
            connector,
            telemetry,
            topics,
            settings,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let id = self.device.id().to_string();
        let Some(mut lost_rx) = self.device.take_lost_receiver() else {
            tracing::error!(device = %id, "Device already has a supervisor");
            return;
        };

        tracing::info!(
            device = %id,
            host = %self.params.host,
            port = self.params.port,
            "Starting connection supervisor"
        );

        let mut epoch = 0u64;
        loop {
            epoch += 1;
            let mut client = None;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Ok(()),
                outcome = self.serve(epoch, &mut client, &mut lost_rx) => outcome,
            };

            self.teardown(client).await;

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    self.device.set_state(ConnectionState::Disconnected);
                    tracing::warn!(
                        device = %id,
                        epoch,
                        error = %e,
                        cooldown_secs = self.settings.cooldown.as_secs_f64(),
                        "Device connection failed, retrying after cool-down"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.settings.cooldown) => {}
            }
        }

        self.device.set_state(ConnectionState::Stopped);
        tracing::info!(device = %id, "Connection supervisor stopped");
    }

    /// One epoch. `Ok` means cancelled; `Err` means the connection failed.
    async fn serve(
        &self,
        epoch: u64,
        slot: &mut Option<Arc<dyn DeviceClient>>,
        lost_rx: &mut mpsc::Receiver<u64>,
    ) -> Result<(), ClientError> {
        let id = self.device.id();

        self.device.set_state(ConnectionState::Connecting);
        tracing::debug!(device = %id, epoch, "Connecting");
        let client = self.connector.connect(id, &self.params).await?;
        *slot = Some(client.clone());

        self.device.set_state(ConnectionState::Discovering);
        let descriptors = client
            .list_entities()
            .await
            .map_err(|e| ClientError::ConnectionLost(format!("discovery failed: {e}")))?;
        let catalog = Arc::new(EntityCatalog::from_descriptors(epoch, descriptors));
        self.device.install_catalog(catalog.clone());
        tracing::debug!(device = %id, epoch, entities = catalog.len(), "Discovery complete");

        self.device.attach(Connection {
            epoch,
            client: client.clone(),
            catalog: catalog.clone(),
        });

        let mut updates = client.subscribe_states().await?;
        for message in client.get_states().await? {
            self.apply(&catalog, &message);
        }

        self.device.set_initialized(true);
        self.device.set_state(ConnectionState::Ready);
        tracing::info!(device = %id, epoch, entities = catalog.len(), "Device ready");

        let disconnected = client.wait_disconnected();
        tokio::pin!(disconnected);

        let period = self.settings.keepalive;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                message = updates.recv() => match message {
                    Some(message) => self.apply(&catalog, &message),
                    None => return Err(ClientError::ConnectionLost("state stream closed".into())),
                },
                _ = &mut disconnected => {
                    return Err(ClientError::ConnectionLost("device closed the connection".into()));
                }
                _ = keepalive.tick() => {
                    match timeout(self.settings.disconnect_timeout, client.ping()).await {
                        Ok(Ok(())) => tracing::trace!(device = %id, epoch, "Keepalive ok"),
                        Ok(Err(e)) => return Err(e),
                        Err(_) => return Err(ClientError::Timeout),
                    }
                }
                Some(lost) = lost_rx.recv() => {
                    if lost == epoch {
                        return Err(ClientError::ConnectionLost("command reported connection loss".into()));
                    }
                }
            }
        }
    }

    /// Make the device unavailable and close the connection, bounded by the disconnect timeout.
    async fn teardown(&self, client: Option<Arc<dyn DeviceClient>>) {
        let id = self.device.id();
        self.device.set_initialized(false);
        self.device.detach();

        let Some(client) = client else {
            return;
        };
        match timeout(self.settings.disconnect_timeout, client.disconnect()).await {
            Ok(Ok(())) => tracing::debug!(device = %id, "Disconnected"),
            Ok(Err(e)) => tracing::debug!(device = %id, error = %e, "Disconnect failed"),
            Err(_) => tracing::debug!(device = %id, "Disconnect timed out"),
        }
    }

    /// Normalize one update into the store and forward it to telemetry.
    fn apply(&self, catalog: &EntityCatalog, message: &StateMessage) {
        let id = self.device.id();
        let Some((field, value)) = normalize::extract(message) else {
            tracing::trace!(device = %id, key = message.key, "State message without value");
            return;
        };
        if value.is_nan() {
            tracing::debug!(device = %id, key = message.key, field, "Discarding NaN state update");
            return;
        }

        let object_id = catalog.get(message.key).and_then(|r| r.object_id.as_deref());
        self.device
            .store()
            .set_mirrored(message.key, object_id, value.clone());

        let Some(topic) = object_id.and_then(|oid| self.topics.topic_for(oid)) else {
            return;
        };
        if value.is_non_finite() {
            tracing::debug!(device = %id, topic, "Suppressing non-finite telemetry value");
            return;
        }
        self.telemetry.publish(id, topic, value.to_string());
    }
}
