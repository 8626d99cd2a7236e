//! Command dispatch against a possibly-reconnecting device.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, timeout_at};

use crate::entity::{EntityKind, EntityRecord};
use crate::error::{ClientError, CommandError};
use crate::registry::{Connection, DeviceHandle, DeviceRegistry};

/// What to do with an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Press,
    Switch(bool),
    SetNumber(f64),
    /// Infer the operation from the entity's kind, taking arguments from the body.
    Infer(Option<Value>),
}

/// A command addressed to an entity by object id.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCommand {
    pub object_id: String,
    pub action: Action,
}

impl EntityCommand {
    pub fn press(object_id: impl Into<String>) -> Self {
        Self::new(object_id, Action::Press)
    }

    pub fn switch(object_id: impl Into<String>, state: bool) -> Self {
        Self::new(object_id, Action::Switch(state))
    }

    pub fn number(object_id: impl Into<String>, value: f64) -> Self {
        Self::new(object_id, Action::SetNumber(value))
    }

    pub fn new(object_id: impl Into<String>, action: Action) -> Self {
        Self {
            object_id: object_id.into(),
            action,
        }
    }
}

/// A typed protocol call with the current epoch's key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProtocolCall {
    Button(u32),
    Switch(u32, bool),
    Number(u32, f64),
}

impl Action {
    /// Resolve against an entity record into a protocol call.
    pub fn resolve(&self, record: &EntityRecord) -> Result<ProtocolCall, CommandError> {
        let unsupported = || CommandError::UnsupportedOperation {
            object_id: record.object_id.clone().unwrap_or_default(),
            platform: record.platform.clone(),
        };

        match (self, record.kind) {
            (Action::Press, EntityKind::Button) => Ok(ProtocolCall::Button(record.key)),
            (Action::Switch(state), EntityKind::Switch) => {
                Ok(ProtocolCall::Switch(record.key, *state))
            }
            (Action::SetNumber(value), EntityKind::Number) => {
                Ok(ProtocolCall::Number(record.key, *value))
            }
            (Action::Infer(body), kind) => match kind {
                EntityKind::Button => Ok(ProtocolCall::Button(record.key)),
                EntityKind::Switch => {
                    let state = field(body.as_ref(), "state")
                        .ok_or_else(|| CommandError::bad_request("missing 'state'"))?;
                    Ok(ProtocolCall::Switch(record.key, truthy(state)))
                }
                EntityKind::Number => {
                    let value = field(body.as_ref(), "value")
                        .ok_or_else(|| CommandError::bad_request("missing 'value'"))?;
                    let value = as_number(value)
                        .ok_or_else(|| CommandError::bad_request("'value' is not a number"))?;
                    Ok(ProtocolCall::Number(record.key, value))
                }
                EntityKind::Sensor | EntityKind::Cover | EntityKind::Other => Err(unsupported()),
            },
            (Action::Press | Action::Switch(_) | Action::SetNumber(_), _) => Err(unsupported()),
        }
    }
}

/// A non-null field of a JSON object body.
pub fn field<'a>(body: Option<&'a Value>, name: &str) -> Option<&'a Value> {
    body.and_then(|b| b.get(name)).filter(|v| !v.is_null())
}

/// Loose truthiness of a JSON value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

/// Numeric value of a JSON number or numeric string.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

enum Failure {
    Lost(ClientError),
    Command(CommandError),
}

/// Runs commands against the device's current connection.
///
/// Waits a bounded time for a connection and retries exactly once when the
/// connection is lost mid-call. The wait and the retry share one deadline.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    connect_wait: Duration,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, connect_wait: Duration) -> Self {
        Self {
            registry,
            connect_wait,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub async fn invoke(&self, device_id: &str, command: &EntityCommand) -> Result<(), CommandError> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| CommandError::not_found(format!("device {device_id}")))?;

        let deadline = Instant::now() + self.connect_wait;
        let connection = self.wait_for_connection(&device, None, deadline).await?;
        let lost_epoch = match self.call(&connection, command).await {
            Ok(()) => return Ok(()),
            Err(Failure::Command(e)) => return Err(e),
            Err(Failure::Lost(e)) => {
                tracing::warn!(
                    device = %device_id,
                    entity = %command.object_id,
                    epoch = connection.epoch,
                    error = %e,
                    "Connection lost during command, retrying once"
                );
                device.report_connection_lost(connection.epoch);
                connection.epoch
            }
        };
        drop(connection);

        let connection = self
            .wait_for_connection(&device, Some(lost_epoch), deadline)
            .await?;
        match self.call(&connection, command).await {
            Ok(()) => Ok(()),
            Err(Failure::Command(e)) => Err(e),
            Err(Failure::Lost(e)) => {
                tracing::warn!(device = %device_id, entity = %command.object_id, error = %e, "Command retry failed");
                device.report_connection_lost(connection.epoch);
                Err(CommandError::ServiceUnavailable(device_id.to_string()))
            }
        }
    }

    /// Wait until `deadline` for an attached connection, skipping `stale_epoch`.
    async fn wait_for_connection(
        &self,
        device: &DeviceHandle,
        stale_epoch: Option<u64>,
        deadline: Instant,
    ) -> Result<Arc<Connection>, CommandError> {
        let mut changes = device.subscribe_state();

        loop {
            if let Some(connection) = device.connection() {
                if Some(connection.epoch) != stale_epoch {
                    return Ok(connection);
                }
            }
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(device = %device.id(), "No connection within wait budget");
                    return Err(CommandError::ServiceUnavailable(device.id().to_string()));
                }
            }
        }
    }

    async fn call(&self, connection: &Connection, command: &EntityCommand) -> Result<(), Failure> {
        let record = connection
            .catalog
            .lookup(&command.object_id)
            .ok_or_else(|| {
                Failure::Command(CommandError::not_found(format!("entity {}", command.object_id)))
            })?;
        let call = command.action.resolve(record).map_err(Failure::Command)?;

        tracing::debug!(entity = %command.object_id, ?call, epoch = connection.epoch, "Invoking");
        let result = match call {
            ProtocolCall::Button(key) => connection.client.button_command(key).await,
            ProtocolCall::Switch(key, state) => connection.client.switch_command(key, state).await,
            ProtocolCall::Number(key, value) => connection.client.number_command(key, value).await,
        };

        result.map_err(|e| {
            if e.is_connection_lost() {
                Failure::Lost(e)
            } else {
                Failure::Command(CommandError::CommandFailed(e.to_string()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityCatalog;
    use crate::fake::{self, Call, FakeClient};
    use crate::registry::ConnectionState;
    use serde_json::json;

    fn attach(device: &DeviceHandle, epoch: u64, client: Arc<FakeClient>) {
        let catalog = Arc::new(EntityCatalog::from_descriptors(epoch, fake::vehicle_entities()));
        device.attach(Connection {
            epoch,
            client,
            catalog,
        });
        device.set_state(ConnectionState::Ready);
    }

    fn setup() -> (Arc<DeviceRegistry>, Arc<DeviceHandle>, CommandDispatcher) {
        let registry = Arc::new(DeviceRegistry::new());
        let device = registry.get_or_create("car");
        let dispatcher = CommandDispatcher::new(registry.clone(), Duration::from_secs(10));
        (registry, device, dispatcher)
    }

    fn record(kind: &str) -> EntityRecord {
        let catalog = EntityCatalog::from_descriptors(1, vec![fake::entity(9, kind, "thing")]);
        catalog.get(9).cloned().unwrap()
    }

    #[test]
    fn test_resolve_explicit_actions() {
        assert_eq!(
            Action::Switch(true).resolve(&record("SwitchInfo")),
            Ok(ProtocolCall::Switch(9, true))
        );
        assert_eq!(
            Action::Press.resolve(&record("ButtonInfo")),
            Ok(ProtocolCall::Button(9))
        );
        assert!(matches!(
            Action::Press.resolve(&record("SwitchInfo")),
            Err(CommandError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_resolve_inferred_actions() {
        let body = json!({"state": true, "value": "16"});
        assert_eq!(
            Action::Infer(Some(body.clone())).resolve(&record("SwitchInfo")),
            Ok(ProtocolCall::Switch(9, true))
        );
        assert_eq!(
            Action::Infer(Some(body)).resolve(&record("NumberInfo")),
            Ok(ProtocolCall::Number(9, 16.0))
        );
        assert_eq!(
            Action::Infer(None).resolve(&record("ButtonInfo")),
            Ok(ProtocolCall::Button(9))
        );
        assert!(matches!(
            Action::Infer(None).resolve(&record("SwitchInfo")),
            Err(CommandError::BadRequest(_))
        ));
        assert!(matches!(
            Action::Infer(Some(json!({"value": null}))).resolve(&record("NumberInfo")),
            Err(CommandError::BadRequest(_))
        ));
        assert!(matches!(
            Action::Infer(None).resolve(&record("SensorInfo")),
            Err(CommandError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_json_coercions() {
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("on")));
        assert_eq!(as_number(&json!(80)), Some(80.0));
        assert_eq!(as_number(&json!(" 12.5 ")), Some(12.5));
        assert_eq!(as_number(&json!(true)), None);
    }

    #[tokio::test]
    async fn test_invoke_switch() {
        let (_registry, device, dispatcher) = setup();
        let client = FakeClient::vehicle();
        attach(&device, 1, client.clone());

        dispatcher
            .invoke("car", &EntityCommand::switch("charger", true))
            .await
            .unwrap();

        assert_eq!(client.calls(), vec![Call::Switch(1, true)]);
    }

    #[tokio::test]
    async fn test_unknown_device_and_entity() {
        let (_registry, device, dispatcher) = setup();
        attach(&device, 1, FakeClient::vehicle());

        let err = dispatcher
            .invoke("truck", &EntityCommand::press("wake_up"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));

        let err = dispatcher
            .invoke("car", &EntityCommand::press("horn"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_budget_is_bounded() {
        let (_registry, _device, dispatcher) = setup();
        let started = Instant::now();

        let err = dispatcher
            .invoke("car", &EntityCommand::press("wake_up"))
            .await
            .unwrap_err();

        assert_eq!(err, CommandError::ServiceUnavailable("car".into()));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_connection() {
        let (_registry, device, dispatcher) = setup();
        let client = FakeClient::vehicle();

        let late = {
            let device = device.clone();
            let client = client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                attach(&device, 1, client);
            })
        };

        dispatcher
            .invoke("car", &EntityCommand::press("wake_up"))
            .await
            .unwrap();
        late.await.unwrap();

        assert_eq!(client.calls(), vec![Call::Button(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_after_connection_loss() {
        let (_registry, device, dispatcher) = setup();
        let first = FakeClient::vehicle();
        first.fail_next_command(ClientError::ConnectionLost("eof".into()));
        attach(&device, 1, first.clone());

        let second = FakeClient::vehicle();
        let mut lost_rx = device.take_lost_receiver().unwrap();
        let reconnect = {
            let device = device.clone();
            let second = second.clone();
            tokio::spawn(async move {
                assert_eq!(lost_rx.recv().await, Some(1));
                device.detach();
                tokio::time::sleep(Duration::from_secs(2)).await;
                attach(&device, 2, second);
            })
        };

        dispatcher
            .invoke("car", &EntityCommand::number("charging_amps", 16.0))
            .await
            .unwrap();
        reconnect.await.unwrap();

        assert!(first.calls().is_empty());
        assert_eq!(second.calls(), vec![Call::Number(5, 16.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_losses_yield_unavailable() {
        let (_registry, device, dispatcher) = setup();
        let first = FakeClient::vehicle();
        first.fail_next_command(ClientError::ConnectionLost("eof".into()));
        attach(&device, 1, first);

        let second = FakeClient::vehicle();
        second.fail_next_command(ClientError::Timeout);
        let mut lost_rx = device.take_lost_receiver().unwrap();
        let reconnect = {
            let device = device.clone();
            tokio::spawn(async move {
                lost_rx.recv().await;
                attach(&device, 2, second);
                lost_rx.recv().await
            })
        };

        let err = dispatcher
            .invoke("car", &EntityCommand::switch("charger", false))
            .await
            .unwrap_err();

        assert_eq!(err, CommandError::ServiceUnavailable("car".into()));
        assert_eq!(reconnect.await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_epoch_yields_unavailable() {
        let (_registry, device, dispatcher) = setup();
        let first = FakeClient::vehicle();
        first.fail_next_command(ClientError::ConnectionLost("eof".into()));
        attach(&device, 1, first);

        let err = dispatcher
            .invoke("car", &EntityCommand::press("wake_up"))
            .await
            .unwrap_err();

        assert_eq!(err, CommandError::ServiceUnavailable("car".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_shares_the_wait_budget() {
        let (_registry, device, dispatcher) = setup();
        let first = FakeClient::vehicle();
        first.fail_next_command(ClientError::ConnectionLost("eof".into()));

        let late = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(6)).await;
                attach(&device, 1, first);
            })
        };
        let started = Instant::now();

        let err = dispatcher
            .invoke("car", &EntityCommand::press("wake_up"))
            .await
            .unwrap_err();
        late.await.unwrap();

        assert_eq!(err, CommandError::ServiceUnavailable("car".into()));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (_registry, device, dispatcher) = setup();
        let client = FakeClient::vehicle();
        client.fail_next_command(ClientError::Rejected("busy".into()));
        attach(&device, 1, client.clone());

        let err = dispatcher
            .invoke("car", &EntityCommand::press("wake_up"))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::CommandFailed(_)));
        assert!(client.calls().is_empty());
    }
}
