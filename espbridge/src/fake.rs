//! Scripted device client and connector for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use espbridge_common::StateValue;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectParams, DeviceClient, DeviceConnector, EntityDescriptor, StateMessage};
use crate::error::ClientError;

/// A protocol call observed by [`FakeClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Button(u32),
    Switch(u32, bool),
    Number(u32, f64),
    Disconnect,
}

pub fn entity(key: u32, message_kind: &str, object_id: &str) -> EntityDescriptor {
    EntityDescriptor {
        key,
        message_kind: message_kind.to_string(),
        object_id: Some(object_id.to_string()),
        name: object_id.to_string(),
        unit: None,
        device_class: None,
    }
}

/// The small vehicle used across tests.
pub fn vehicle_entities() -> Vec<EntityDescriptor> {
    vec![
        entity(1, "ListEntitiesSwitchResponse", "charger"),
        entity(2, "ListEntitiesSensorResponse", "charge_level"),
        entity(3, "ListEntitiesSensorResponse", "battery_level"),
        entity(4, "ListEntitiesNumberResponse", "charging_limit"),
        entity(5, "ListEntitiesNumberResponse", "charging_amps"),
        entity(6, "ListEntitiesButtonResponse", "wake_up"),
        entity(7, "ListEntitiesBinarySensorResponse", "charging"),
        entity(8, "ListEntitiesSensorResponse", "soc"),
    ]
}

#[derive(Default)]
pub struct FakeClient {
    entities: Vec<EntityDescriptor>,
    initial: Vec<StateMessage>,
    calls: Mutex<Vec<Call>>,
    command_failures: Mutex<VecDeque<ClientError>>,
    updates: Mutex<Option<mpsc::Sender<StateMessage>>>,
    dropped: CancellationToken,
    fail_discovery: AtomicBool,
    fail_ping: AtomicBool,
    stall_ping: AtomicBool,
}

impl FakeClient {
    pub fn new(entities: Vec<EntityDescriptor>) -> Self {
        Self {
            entities,
            ..Default::default()
        }
    }

    pub fn vehicle() -> Arc<Self> {
        Arc::new(Self::new(vehicle_entities()).with_state(2, 55.2).with_state(7, false))
    }

    pub fn with_state(mut self, key: u32, value: impl Into<StateValue>) -> Self {
        self.initial.push(StateMessage::scalar(key, value));
        self
    }

    pub fn failing_discovery(self) -> Self {
        self.fail_discovery.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_ping(self) -> Self {
        self.fail_ping.store(true, Ordering::SeqCst);
        self
    }

    /// Pings never answer.
    pub fn stalling_ping(self) -> Self {
        self.stall_ping.store(true, Ordering::SeqCst);
        self
    }

    /// Queue an error for the next typed command.
    pub fn fail_next_command(&self, error: ClientError) {
        self.command_failures.lock().push_back(error);
    }

    pub async fn push_update(&self, message: StateMessage) {
        let tx = self.updates.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(message).await;
        }
    }

    /// Simulate the device going away.
    pub fn drop_connection(&self) {
        self.updates.lock().take();
        self.dropped.cancel();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn command(&self, call: Call) -> Result<(), ClientError> {
        if let Some(error) = self.command_failures.lock().pop_front() {
            return Err(error);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for FakeClient {
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, ClientError> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("discovery refused".into()));
        }
        Ok(self.entities.clone())
    }

    async fn subscribe_states(&self) -> Result<mpsc::Receiver<StateMessage>, ClientError> {
        let (tx, rx) = mpsc::channel(16);
        *self.updates.lock() = Some(tx);
        Ok(rx)
    }

    async fn get_states(&self) -> Result<Vec<StateMessage>, ClientError> {
        Ok(self.initial.clone())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout);
        }
        if self.stall_ping.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_disconnected(&self) {
        self.dropped.cancelled().await;
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.calls.lock().push(Call::Disconnect);
        Ok(())
    }

    async fn button_command(&self, key: u32) -> Result<(), ClientError> {
        self.command(Call::Button(key))
    }

    async fn switch_command(&self, key: u32, state: bool) -> Result<(), ClientError> {
        self.command(Call::Switch(key, state))
    }

    async fn number_command(&self, key: u32, value: f64) -> Result<(), ClientError> {
        self.command(Call::Number(key, value))
    }
}

/// Hands out scripted clients in order, then refuses.
#[derive(Default)]
pub struct FakeConnector {
    script: Mutex<VecDeque<Result<Arc<FakeClient>, ClientError>>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new(script: impl IntoIterator<Item = Result<Arc<FakeClient>, ClientError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicUsize::new(0),
        })
    }

    /// A connector that refuses every attempt.
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    async fn connect(
        &self,
        _device_id: &str,
        _params: &ConnectParams,
    ) -> Result<Arc<dyn DeviceClient>, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Ok(client)) => Ok(client as Arc<dyn DeviceClient>),
            Some(Err(e)) => Err(e),
            None => Err(ClientError::Connect("connection refused".into())),
        }
    }
}

pub fn params() -> ConnectParams {
    ConnectParams {
        host: "127.0.0.1".into(),
        port: 6053,
        password: None,
        encryption_key: None,
    }
}
