//! Simulated vehicle backend.
//!
//! Implements [`DeviceConnector`] with an in-process vehicle model so the
//! bridge can run end-to-end without hardware. Each connection renumbers
//! the entity keys, like a device that reflashed between sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use espbridge_common::StateValue;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectParams, DeviceClient, DeviceConnector, EntityDescriptor, StateMessage};
use crate::config::SimulatorConfig;
use crate::error::ClientError;

/// Entities exposed by the simulated vehicle.
struct EntitySpec {
    object_id: &'static str,
    name: &'static str,
    message_kind: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
}

const fn spec(
    object_id: &'static str,
    name: &'static str,
    message_kind: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
) -> EntitySpec {
    EntitySpec {
        object_id,
        name,
        message_kind,
        unit,
        device_class,
    }
}

const ENTITIES: &[EntitySpec] = &[
    spec("wake_up", "Wake Up", "ListEntitiesButtonResponse", None, None),
    spec("flash_light", "Flash Lights", "ListEntitiesButtonResponse", None, None),
    spec("sound_horn", "Sound Horn", "ListEntitiesButtonResponse", None, None),
    spec("unlock_charge_port", "Unlock Charge Port", "ListEntitiesButtonResponse", None, None),
    spec("charger", "Charger", "ListEntitiesSwitchResponse", None, None),
    spec("charge_port", "Charge Port Door", "ListEntitiesSwitchResponse", None, None),
    spec("climate", "Climate", "ListEntitiesSwitchResponse", None, None),
    spec("sentry_mode", "Sentry Mode", "ListEntitiesSwitchResponse", None, None),
    spec("charging_amps", "Charging Amps", "ListEntitiesNumberResponse", Some("A"), Some("current")),
    spec("charging_limit", "Charging Limit", "ListEntitiesNumberResponse", Some("%"), None),
    spec("charge_level", "Charge Level", "ListEntitiesSensorResponse", Some("%"), Some("battery")),
    spec("battery_level", "Battery Level", "ListEntitiesSensorResponse", Some("%"), Some("battery")),
    spec("inside_temp", "Inside Temperature", "ListEntitiesSensorResponse", Some("°C"), Some("temperature")),
    spec("outside_temp", "Outside Temperature", "ListEntitiesSensorResponse", Some("°C"), Some("temperature")),
    spec("charging", "Charging", "ListEntitiesBinarySensorResponse", None, Some("battery_charging")),
    spec("connected", "Awake", "ListEntitiesBinarySensorResponse", None, Some("connectivity")),
    spec("charge_port_door_open", "Charge Port Open", "ListEntitiesBinarySensorResponse", None, Some("door")),
    spec("is_auto_conditioning_on", "Climate Active", "ListEntitiesBinarySensorResponse", None, None),
    spec("vehicle_locked", "Locked", "ListEntitiesBinarySensorResponse", None, Some("lock")),
];

/// Keys of one connection start at `epoch * KEY_STRIDE`.
const KEY_STRIDE: u32 = 100;

/// Vehicle physics, shared by every connection to the same device.
struct VehicleModel {
    rng: SmallRng,
    awake: bool,
    charger_on: bool,
    port_open: bool,
    climate: bool,
    sentry: bool,
    locked: bool,
    soc: f64,
    limit: f64,
    amps: f64,
    inside: f64,
    outside: f64,
}

impl VehicleModel {
    fn new(seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let outside = rng.random_range(5.0..25.0);
        Self {
            soc: rng.random_range(35.0..70.0),
            inside: outside + 2.0,
            outside,
            rng,
            awake: true,
            charger_on: false,
            port_open: false,
            climate: false,
            sentry: false,
            locked: true,
            limit: 80.0,
            amps: 16.0,
        }
    }

    fn charging(&self) -> bool {
        self.awake && self.charger_on && self.port_open && self.soc < self.limit
    }

    /// Advance one tick of simulated time.
    fn step(&mut self, tick: Duration) {
        let hours = tick.as_secs_f64() / 3600.0;
        if self.charging() {
            // ~11 kW at 32 A on a 75 kWh pack, sped up for visibility
            let rate = self.amps / 32.0 * 15.0 * 60.0;
            self.soc = (self.soc + rate * hours).min(self.limit);
        } else if !self.charger_on {
            self.soc = (self.soc - 0.5 * hours).max(0.0);
        }

        self.outside += self.rng.random_range(-0.05..0.05);
        let target = if self.climate { 21.0 } else { self.outside + 2.0 };
        self.inside += (target - self.inside) * 0.1 + self.rng.random_range(-0.02..0.02);

        if !self.climate && !self.sentry && !self.charging() && self.rng.random_bool(0.01) {
            self.awake = false;
        }
    }

    fn value(&self, object_id: &str) -> StateValue {
        let round1 = |v: f64| (v * 10.0).round() / 10.0;
        match object_id {
            "charger" => StateValue::Bool(self.charger_on),
            "charge_port" | "charge_port_door_open" => StateValue::Bool(self.port_open),
            "climate" | "is_auto_conditioning_on" => StateValue::Bool(self.climate),
            "sentry_mode" => StateValue::Bool(self.sentry),
            "charging_amps" => StateValue::Number(self.amps),
            "charging_limit" => StateValue::Number(self.limit),
            "charge_level" => StateValue::Number(round1(self.soc)),
            "battery_level" => StateValue::Number(self.soc.round()),
            "inside_temp" => StateValue::Number(round1(self.inside)),
            "outside_temp" => StateValue::Number(round1(self.outside)),
            "charging" => StateValue::Bool(self.charging()),
            "connected" => StateValue::Bool(self.awake),
            "vehicle_locked" => StateValue::Bool(self.locked),
            _ => StateValue::Null,
        }
    }

    fn values(&self) -> Vec<StateValue> {
        ENTITIES.iter().map(|e| self.value(e.object_id)).collect()
    }

    fn press(&mut self, object_id: &str) {
        self.awake = true;
        match object_id {
            "unlock_charge_port" => self.port_open = false,
            "wake_up" | "flash_light" | "sound_horn" => {}
            other => tracing::debug!(entity = other, "Simulated button has no effect"),
        }
    }

    fn switch(&mut self, object_id: &str, on: bool) {
        self.awake = true;
        match object_id {
            "charger" => {
                self.charger_on = on;
                if on {
                    self.port_open = true;
                }
            }
            "charge_port" => self.port_open = on,
            "climate" => self.climate = on,
            "sentry_mode" => self.sentry = on,
            _ => {}
        }
    }

    fn number(&mut self, object_id: &str, value: f64) {
        self.awake = true;
        match object_id {
            "charging_amps" => self.amps = value.clamp(0.0, 32.0),
            "charging_limit" => self.limit = value.clamp(50.0, 100.0),
            _ => {}
        }
    }
}

/// Connector producing simulated vehicles.
pub struct SimulatedConnector {
    settings: SimulatorConfig,
    vehicles: Mutex<HashMap<String, Arc<Mutex<VehicleModel>>>>,
    connections: AtomicU32,
}

impl SimulatedConnector {
    pub fn new(settings: SimulatorConfig) -> Self {
        Self {
            settings,
            vehicles: Mutex::new(HashMap::new()),
            connections: AtomicU32::new(0),
        }
    }

    fn vehicle(&self, device_id: &str) -> Arc<Mutex<VehicleModel>> {
        let mut vehicles = self.vehicles.lock();
        let seed = self.settings.seed.wrapping_add(vehicles.len() as u64);
        vehicles
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VehicleModel::new(seed))))
            .clone()
    }
}

#[async_trait]
impl DeviceConnector for SimulatedConnector {
    async fn connect(
        &self,
        device_id: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn DeviceClient>, ClientError> {
        let n = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            device = %device_id,
            host = %params.host,
            port = params.port,
            connection = n,
            "Opening simulated link"
        );

        Ok(Arc::new(SimulatedLink {
            model: self.vehicle(device_id),
            key_base: (n % 1000) * KEY_STRIDE,
            tick: Duration::from_millis(self.settings.tick_ms),
            drop_after: self.settings.drop_after_secs.map(Duration::from_secs),
            closed: CancellationToken::new(),
        }))
    }
}

/// One simulated connection.
pub struct SimulatedLink {
    model: Arc<Mutex<VehicleModel>>,
    key_base: u32,
    tick: Duration,
    drop_after: Option<Duration>,
    closed: CancellationToken,
}

impl SimulatedLink {
    fn entity(&self, key: u32) -> Result<&'static EntitySpec, ClientError> {
        key.checked_sub(self.key_base)
            .and_then(|i| ENTITIES.get(i as usize))
            .ok_or_else(|| ClientError::Rejected(format!("unknown key {key}")))
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.is_cancelled() {
            Err(ClientError::ConnectionLost("link closed".into()))
        } else {
            Ok(())
        }
    }

    fn expect_kind(spec: &EntitySpec, kind: &str) -> Result<(), ClientError> {
        if spec.message_kind.contains(kind) {
            Ok(())
        } else {
            Err(ClientError::Rejected(format!("{} is not a {}", spec.object_id, kind)))
        }
    }
}

#[async_trait]
impl DeviceClient for SimulatedLink {
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, ClientError> {
        self.ensure_open()?;
        Ok(ENTITIES
            .iter()
            .zip(self.key_base..)
            .map(|(e, key)| EntityDescriptor {
                key,
                message_kind: e.message_kind.to_string(),
                object_id: Some(e.object_id.to_string()),
                name: e.name.to_string(),
                unit: e.unit.map(str::to_string),
                device_class: e.device_class.map(str::to_string),
            })
            .collect())
    }

    async fn subscribe_states(&self) -> Result<mpsc::Receiver<StateMessage>, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(64);
        let model = self.model.clone();
        let closed = self.closed.clone();
        let key_base = self.key_base;
        let tick = self.tick;
        let deadline = self.drop_after.map(|d| Instant::now() + d);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = model.lock().values();

            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::debug!("Simulated link dropping connection");
                    closed.cancel();
                    break;
                }

                let current = {
                    let mut model = model.lock();
                    model.step(tick);
                    model.values()
                };
                for ((key, value), previous) in (key_base..).zip(&current).zip(&last) {
                    if value != previous
                        && tx.send(StateMessage::scalar(key, value.clone())).await.is_err()
                    {
                        return;
                    }
                }
                last = current;
            }
        });

        Ok(rx)
    }

    async fn get_states(&self) -> Result<Vec<StateMessage>, ClientError> {
        self.ensure_open()?;
        let values = self.model.lock().values();
        Ok((self.key_base..)
            .zip(values)
            .map(|(key, value)| StateMessage::scalar(key, value))
            .collect())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.ensure_open()
    }

    async fn wait_disconnected(&self) {
        self.closed.cancelled().await;
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.closed.cancel();
        Ok(())
    }

    async fn button_command(&self, key: u32) -> Result<(), ClientError> {
        self.ensure_open()?;
        let spec = self.entity(key)?;
        Self::expect_kind(spec, "Button")?;
        self.model.lock().press(spec.object_id);
        Ok(())
    }

    async fn switch_command(&self, key: u32, state: bool) -> Result<(), ClientError> {
        self.ensure_open()?;
        let spec = self.entity(key)?;
        Self::expect_kind(spec, "Switch")?;
        self.model.lock().switch(spec.object_id, state);
        Ok(())
    }

    async fn number_command(&self, key: u32, value: f64) -> Result<(), ClientError> {
        self.ensure_open()?;
        let spec = self.entity(key)?;
        Self::expect_kind(spec, "Number")?;
        self.model.lock().number(spec.object_id, value);
        Ok(())
    }
}
