//! Device connection collaborator.
//!
//! The binary device protocol lives behind [`DeviceConnector`] and
//! [`DeviceClient`]; the bridge core only talks to these traits.

use std::sync::Arc;

use async_trait::async_trait;
use espbridge_common::StateValue;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::error::ClientError;

/// Parameters for opening an authenticated device connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    /// Access credential sent at login.
    pub password: Option<String>,
    /// Shared secret for transport encryption.
    pub encryption_key: Option<String>,
}

impl From<&DeviceConfig> for ConnectParams {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            host: device.host.clone(),
            port: device.port,
            password: device.password.clone(),
            encryption_key: device.encryption_key.clone(),
        }
    }
}

/// One entity as announced by the device during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Numeric key, valid for the current connection only.
    pub key: u32,
    /// Protocol message kind, e.g. `ListEntitiesBinarySensorResponse`.
    pub message_kind: String,
    pub object_id: Option<String>,
    pub name: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
}

/// An inbound state update.
///
/// Only the fields relevant to the entity's kind are populated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMessage {
    pub key: u32,
    pub state: Option<StateValue>,
    pub position: Option<f64>,
    pub current_operation: Option<String>,
    pub brightness: Option<f64>,
    pub is_closed: Option<bool>,
    pub is_on: Option<bool>,
}

impl StateMessage {
    /// A message carrying a plain scalar `state`.
    pub fn scalar(key: u32, value: impl Into<StateValue>) -> Self {
        Self {
            key,
            state: Some(value.into()),
            ..Default::default()
        }
    }
}

/// A live connection to one device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Request the full entity list.
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, ClientError>;

    /// Subscribe to state changes. The stream ends when the connection drops.
    async fn subscribe_states(&self) -> Result<mpsc::Receiver<StateMessage>, ClientError>;

    /// One-shot pull of every current state.
    async fn get_states(&self) -> Result<Vec<StateMessage>, ClientError>;

    /// No-op round trip used as keepalive.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Resolves once the device reports the connection as closed.
    ///
    /// Clients without a disconnect notification never resolve.
    async fn wait_disconnected(&self) {
        std::future::pending::<()>().await;
    }

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), ClientError>;

    async fn button_command(&self, key: u32) -> Result<(), ClientError>;

    async fn switch_command(&self, key: u32, state: bool) -> Result<(), ClientError>;

    async fn number_command(&self, key: u32, value: f64) -> Result<(), ClientError>;
}

/// Opens authenticated connections to devices.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(
        &self,
        device_id: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn DeviceClient>, ClientError>;
}
