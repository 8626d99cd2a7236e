//! Vehicle-API compatibility layer.
//!
//! Translates the fleet command vocabulary into entity commands and
//! assembles read-shaped documents from state snapshots.

use std::sync::Arc;
use std::time::Duration;

use espbridge_common::StateValue;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::dispatcher::{Action, CommandDispatcher, EntityCommand, as_number, field, truthy};
use crate::error::CommandError;
use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::store::{StateKey, StateSnapshot};

/// Field names accepted for the charge limit, in priority order.
const CHARGE_LIMIT_FIELDS: &[&str] = &["percent", "charge_limit", "charging_limit"];

/// Translate a fleet command into an entity command.
///
/// Unknown names address the entity whose object id equals the command
/// name; the operation is inferred from its kind at dispatch time.
pub fn translate(command: &str, body: Option<&Value>) -> Result<EntityCommand, CommandError> {
    let cmd = match command {
        "wake_up" => EntityCommand::press("wake_up"),
        "charge_start" => EntityCommand::switch("charger", true),
        "charge_stop" => EntityCommand::switch("charger", false),
        "set_charging_amps" => {
            let amps = field(body, "charging_amps")
                .ok_or_else(|| CommandError::bad_request("missing 'charging_amps'"))?;
            EntityCommand::number("charging_amps", number(amps, "charging_amps")?)
        }
        "set_charge_limit" => {
            let limit = CHARGE_LIMIT_FIELDS
                .iter()
                .find_map(|name| field(body, name))
                .ok_or_else(|| CommandError::bad_request("missing 'percent'"))?;
            EntityCommand::number("charging_limit", number(limit, "percent")?)
        }
        "auto_conditioning_start" => EntityCommand::switch("climate", true),
        "auto_conditioning_stop" => EntityCommand::switch("climate", false),
        "charge_port_door_open" => EntityCommand::switch("charge_port", true),
        "charge_port_door_close" => EntityCommand::switch("charge_port", false),
        "flash_lights" => EntityCommand::press("flash_light"),
        "honk_horn" => EntityCommand::press("sound_horn"),
        "unlock_charge_port" => EntityCommand::press("unlock_charge_port"),
        "set_sentry_mode" => {
            let on = field(body, "on").ok_or_else(|| CommandError::bad_request("missing 'on'"))?;
            EntityCommand::switch("sentry_mode", truthy(on))
        }
        other => EntityCommand::new(other, Action::Infer(body.cloned())),
    };
    Ok(cmd)
}

fn number(value: &Value, name: &str) -> Result<f64, CommandError> {
    as_number(value).ok_or_else(|| CommandError::bad_request(format!("'{name}' is not a number")))
}

/// Charging target a command waits for, if any.
fn charging_target(command: &str) -> Option<bool> {
    match command {
        "charge_start" => Some(true),
        "charge_stop" => Some(false),
        _ => None,
    }
}

/// One row of the entity listing.
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    pub key: u32,
    pub name: String,
    pub object_id: Option<String>,
    pub unit: Option<String>,
    pub platform: String,
    pub device_class: Option<String>,
    pub state: Option<StateValue>,
}

/// Read and command facade used by the HTTP layer.
#[derive(Clone)]
pub struct CompatibilityShim {
    dispatcher: CommandDispatcher,
    charge_wait: Duration,
    charge_poll: Duration,
}

impl CompatibilityShim {
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        Self {
            dispatcher,
            charge_wait: Duration::from_secs(10),
            charge_poll: Duration::from_secs(1),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.dispatcher.registry()
    }

    fn device(&self, device_id: &str) -> Result<Arc<DeviceHandle>, CommandError> {
        self.registry()
            .get(device_id)
            .ok_or_else(|| CommandError::not_found(format!("device {device_id}")))
    }

    /// Run a fleet command, optionally waiting for charging to follow.
    pub async fn command(
        &self,
        device_id: &str,
        command: &str,
        body: Option<&Value>,
        wait: bool,
    ) -> Result<(), CommandError> {
        let entity_command = translate(command, body)?;
        tracing::info!(device = %device_id, command, entity = %entity_command.object_id, "Running command");
        self.dispatcher.invoke(device_id, &entity_command).await?;

        if wait {
            if let Some(target) = charging_target(command) {
                self.wait_for_charging(device_id, target).await;
            }
        }
        Ok(())
    }

    /// Run an entity command directly.
    pub async fn entity_command(
        &self,
        device_id: &str,
        command: &EntityCommand,
    ) -> Result<(), CommandError> {
        self.dispatcher.invoke(device_id, command).await
    }

    /// Best effort: poll `charging` until it matches or the budget runs out.
    async fn wait_for_charging(&self, device_id: &str, target: bool) {
        let Ok(device) = self.device(device_id) else {
            return;
        };
        let attempts = (self.charge_wait.as_millis() / self.charge_poll.as_millis().max(1)).max(1);
        for _ in 0..attempts {
            tokio::time::sleep(self.charge_poll).await;
            let charging = device
                .store()
                .get("charging")
                .is_some_and(|v| v.is_truthy());
            if charging == target {
                tracing::debug!(device = %device_id, charging, "Charging state reached");
                return;
            }
        }
        tracing::debug!(device = %device_id, target, "Charging state not reached in time");
    }

    /// State by object id, or by numeric key of the current epoch.
    pub fn state(&self, device_id: &str, name: &str) -> Result<StateValue, CommandError> {
        let store = self.device(device_id)?.store().snapshot();
        let value = store.by_id(name).or_else(|| {
            name.parse::<u32>()
                .ok()
                .and_then(|key| store.get(&StateKey::Key(key)))
        });
        value
            .map(StateValue::sanitized)
            .ok_or_else(|| CommandError::not_found(format!("state {name}")))
    }

    /// Entities of the last discovery with their current values.
    pub fn entities(&self, device_id: &str) -> Result<Vec<EntityView>, CommandError> {
        let device = self.device(device_id)?;
        let catalog = device.catalog();
        let snapshot = device.store().snapshot();

        Ok(catalog
            .iter()
            .map(|record| EntityView {
                key: record.key,
                name: record.name.clone(),
                object_id: record.object_id.clone(),
                unit: record.unit.clone(),
                platform: record.platform.clone(),
                device_class: record.device_class.clone(),
                state: snapshot.by_key(record.key).map(StateValue::sanitized),
            })
            .collect())
    }

    /// Battery percentage document.
    pub fn battery(&self, device_id: &str) -> Result<Value, CommandError> {
        let snapshot = self.device(device_id)?.store().snapshot();
        Ok(json!({ "battery_pct": value(&snapshot, "charge_level") }))
    }

    /// Vehicle data document, optionally restricted to some sections.
    pub fn vehicle_data(
        &self,
        device_id: &str,
        sections: Option<&[String]>,
    ) -> Result<Value, CommandError> {
        let snapshot = self.device(device_id)?.store().snapshot();
        let wanted = |name: &str| sections.is_none_or(|s| s.iter().any(|x| x == name));

        let mut doc = Map::new();
        if wanted("charge_state") {
            doc.insert("charge_state".into(), charge_state(&snapshot));
        }
        if wanted("climate_state") {
            doc.insert("climate_state".into(), climate_state(&snapshot));
        }
        Ok(Value::Object(doc))
    }

    /// Lock and sleep status document.
    pub fn body_controller_state(&self, device_id: &str) -> Result<Value, CommandError> {
        let snapshot = self.device(device_id)?.store().snapshot();
        let locked = snapshot.truthy("vehicle_locked");
        let asleep = !snapshot.truthy("connected");

        Ok(json!({
            "vehicleLockState": if locked { "VEHICLELOCKSTATE_LOCKED" } else { "VEHICLELOCKSTATE_UNLOCKED" },
            "vehicleSleepStatus": if asleep { "VEHICLE_SLEEP_STATUS_ASLEEP" } else { "VEHICLE_SLEEP_STATUS_AWAKE" },
            "userPresence": "VEHICLE_USER_PRESENCE_UNKNOWN",
        }))
    }
}

/// Sanitized JSON value of an object id; null when absent or non-finite.
fn value(snapshot: &StateSnapshot, object_id: &str) -> Value {
    snapshot
        .by_id(object_id)
        .map(|v| Value::from(v.clone()))
        .unwrap_or(Value::Null)
}

fn charge_state(snapshot: &StateSnapshot) -> Value {
    json!({
        "battery_level": value(snapshot, "battery_level"),
        "charge_port_door_open": value(snapshot, "charge_port_door_open"),
        "charging_state": if snapshot.truthy("charging") { "Charging" } else { "Stopped" },
        "charge_limit_soc": value(snapshot, "charging_limit"),
        "charge_current_request": value(snapshot, "charging_amps"),
    })
}

fn climate_state(snapshot: &StateSnapshot) -> Value {
    json!({
        "inside_temp": value(snapshot, "inside_temp"),
        "outside_temp": value(snapshot, "outside_temp"),
        "is_auto_conditioning_on": value(snapshot, "is_auto_conditioning_on"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityCatalog;
    use crate::fake::{self, Call, FakeClient};
    use crate::registry::{Connection, ConnectionState};
    use tokio::time::Instant;

    fn setup() -> (Arc<DeviceHandle>, Arc<FakeClient>, CompatibilityShim) {
        let registry = Arc::new(DeviceRegistry::new());
        let device = registry.get_or_create("car");
        let client = FakeClient::vehicle();
        let catalog = Arc::new(EntityCatalog::from_descriptors(1, fake::vehicle_entities()));
        device.install_catalog(catalog.clone());
        device.attach(Connection {
            epoch: 1,
            client: client.clone(),
            catalog,
        });
        device.set_state(ConnectionState::Ready);
        let shim = CompatibilityShim::new(CommandDispatcher::new(registry, Duration::from_secs(10)));
        (device, client, shim)
    }

    #[test]
    fn test_translate_vocabulary() {
        assert_eq!(translate("wake_up", None), Ok(EntityCommand::press("wake_up")));
        assert_eq!(
            translate("charge_start", None),
            Ok(EntityCommand::switch("charger", true))
        );
        assert_eq!(
            translate("honk_horn", None),
            Ok(EntityCommand::press("sound_horn"))
        );
        assert_eq!(
            translate("auto_conditioning_stop", None),
            Ok(EntityCommand::switch("climate", false))
        );
        assert_eq!(
            translate("set_sentry_mode", Some(&json!({"on": true}))),
            Ok(EntityCommand::switch("sentry_mode", true))
        );
        assert!(matches!(
            translate("set_sentry_mode", Some(&json!({}))),
            Err(CommandError::BadRequest(_))
        ));
    }

    #[test]
    fn test_translate_charge_limit_alternatives() {
        for name in ["percent", "charge_limit", "charging_limit"] {
            let mut fields = Map::new();
            fields.insert(name.to_string(), json!(80));
            let body = Value::Object(fields);
            assert_eq!(
                translate("set_charge_limit", Some(&body)),
                Ok(EntityCommand::number("charging_limit", 80.0))
            );
        }
        assert!(matches!(
            translate("set_charge_limit", Some(&json!({"limit": 80}))),
            Err(CommandError::BadRequest(_))
        ));
        assert!(matches!(
            translate("set_charge_limit", None),
            Err(CommandError::BadRequest(_))
        ));
    }

    #[test]
    fn test_translate_fallback() {
        let body = json!({"state": true});
        assert_eq!(
            translate("heated_seats", Some(&body)),
            Ok(EntityCommand::new("heated_seats", Action::Infer(Some(body.clone()))))
        );
    }

    #[tokio::test]
    async fn test_charge_start_switches_charger() {
        let (_device, client, shim) = setup();

        shim.command("car", "charge_start", None, false).await.unwrap();

        assert_eq!(client.calls(), vec![Call::Switch(1, true)]);
    }

    #[tokio::test]
    async fn test_set_charge_limit_percent() {
        let (_device, client, shim) = setup();

        shim.command("car", "set_charge_limit", Some(&json!({"percent": 80})), false)
            .await
            .unwrap();

        assert_eq!(client.calls(), vec![Call::Number(4, 80.0)]);
    }

    #[tokio::test]
    async fn test_generic_fallback_kinds() {
        let (_device, client, shim) = setup();

        shim.command("car", "charger", Some(&json!({"state": false})), false)
            .await
            .unwrap();
        let err = shim.command("car", "charger", None, false).await.unwrap_err();
        assert!(matches!(err, CommandError::BadRequest(_)));
        let err = shim.command("car", "charge_level", None, false).await.unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedOperation { .. }));
        let err = shim.command("car", "teleport", None, false).await.unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));

        assert_eq!(client.calls(), vec![Call::Switch(1, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_when_charging_matches() {
        let (device, _client, shim) = setup();
        let updater = {
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                device.store().set("charging", StateValue::Bool(true));
            })
        };
        let started = Instant::now();

        shim.command("car", "charge_start", None, true).await.unwrap();
        updater.await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_after_budget() {
        let (_device, _client, shim) = setup();
        let started = Instant::now();

        shim.command("car", "charge_start", None, true).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_state_by_id_and_key() {
        let (device, _client, shim) = setup();
        device
            .store()
            .set_mirrored(8, Some("soc"), StateValue::Number(55.2));

        assert_eq!(shim.state("car", "soc"), Ok(StateValue::Number(55.2)));
        assert_eq!(shim.state("car", "8"), Ok(StateValue::Number(55.2)));
        assert!(matches!(shim.state("car", "missing"), Err(CommandError::NotFound(_))));
        assert!(matches!(shim.state("van", "soc"), Err(CommandError::NotFound(_))));
    }

    #[test]
    fn test_vehicle_data_document() {
        let (device, _client, shim) = setup();
        let store = device.store();
        store.set("battery_level", StateValue::Number(71.0));
        store.set("charging", StateValue::Bool(true));
        store.set("charging_limit", StateValue::Number(80.0));
        store.set("inside_temp", StateValue::Number(f64::INFINITY));

        let doc = shim.vehicle_data("car", None).unwrap();
        assert_eq!(doc["charge_state"]["battery_level"], json!(71.0));
        assert_eq!(doc["charge_state"]["charging_state"], json!("Charging"));
        assert_eq!(doc["charge_state"]["charge_limit_soc"], json!(80.0));
        assert_eq!(doc["charge_state"]["charge_current_request"], Value::Null);
        assert_eq!(doc["climate_state"]["inside_temp"], Value::Null);

        let only_charge = shim
            .vehicle_data("car", Some(&["charge_state".to_string()]))
            .unwrap();
        assert!(only_charge.get("charge_state").is_some());
        assert!(only_charge.get("climate_state").is_none());
    }

    #[test]
    fn test_body_controller_state() {
        let (device, _client, shim) = setup();
        device.store().set("vehicle_locked", StateValue::Bool(true));

        let doc = shim.body_controller_state("car").unwrap();
        assert_eq!(doc["vehicleLockState"], "VEHICLELOCKSTATE_LOCKED");
        assert_eq!(doc["vehicleSleepStatus"], "VEHICLE_SLEEP_STATUS_ASLEEP");

        device.store().set("connected", StateValue::Bool(true));
        let doc = shim.body_controller_state("car").unwrap();
        assert_eq!(doc["vehicleSleepStatus"], "VEHICLE_SLEEP_STATUS_AWAKE");
    }

    #[test]
    fn test_entities_listing() {
        let (device, _client, shim) = setup();
        device
            .store()
            .set_mirrored(2, Some("charge_level"), StateValue::Number(55.2));

        let entities = shim.entities("car").unwrap();
        assert_eq!(entities.len(), fake::vehicle_entities().len());
        let level = entities.iter().find(|e| e.key == 2).unwrap();
        assert_eq!(level.platform, "_sensor");
        assert_eq!(level.state, Some(StateValue::Number(55.2)));
        let charging = entities.iter().find(|e| e.key == 7).unwrap();
        assert_eq!(charging.platform, "binary_sensor");
    }
}
