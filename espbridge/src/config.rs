//! Configuration for the bridge.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use espbridge_common::DEFAULT_KEY_PREFIX;
use espbridge_framework::{BridgeConfig, BridgeError, LoggingConfig, ZenohConfig};
use serde::{Deserialize, Serialize};

use crate::supervisor::SupervisorSettings;
use crate::telemetry::default_topics;

/// Id given to a single device configured without one.
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EspBridgeConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Built-in simulated backend settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Devices to bridge.
    #[serde(alias = "vehicles")]
    pub devices: Vec<DeviceConfig>,
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address (default: "0.0.0.0:8000").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Telemetry feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Key expression prefix (default: "evcc/tesla").
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Object ids forwarded to telemetry, mapped to topic names.
    #[serde(default = "default_topics")]
    pub topics: HashMap<String, String>,

    /// Samples buffered before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: default_true(),
            key_prefix: default_key_prefix(),
            zenoh: ZenohConfig::default(),
            topics: default_topics(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Connection supervisor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
}

fn default_cooldown() -> u64 {
    5
}

fn default_keepalive() -> u64 {
    60
}

fn default_disconnect_timeout() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            keepalive_secs: default_keepalive(),
            disconnect_timeout_secs: default_disconnect_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            cooldown: Duration::from_secs(self.cooldown_secs),
            keepalive: Duration::from_secs(self.keepalive_secs),
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_secs),
        }
    }
}

/// Command dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How long a command waits for a connection.
    #[serde(default = "default_connect_wait")]
    pub connect_wait_secs: u64,
}

fn default_connect_wait() -> u64 {
    10
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_wait_secs: default_connect_wait(),
        }
    }
}

impl DispatcherConfig {
    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_secs)
    }
}

/// Simulated vehicle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Seed for reproducible telemetry.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Interval between simulated state changes.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Drop each connection after this many seconds.
    #[serde(default)]
    pub drop_after_secs: Option<u64>,
}

fn default_seed() -> u64 {
    42
}

fn default_tick_ms() -> u64 {
    1000
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            tick_ms: default_tick_ms(),
            drop_after_secs: None,
        }
    }
}

/// One device to bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device id, e.g. a vehicle identification number.
    #[serde(default, alias = "vin")]
    pub id: Option<String>,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Access credential.
    #[serde(default)]
    pub password: Option<String>,

    /// Transport encryption key.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_port() -> u16 {
    6053
}

impl EspBridgeConfig {
    /// Devices with their effective ids.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &DeviceConfig)> {
        let single = self.devices.len() == 1;
        self.devices.iter().map(move |device| {
            let id = match device.id.as_deref() {
                Some(id) => id,
                None if single => DEFAULT_DEVICE_ID,
                None => "",
            };
            (id, device)
        })
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices().map(|(id, _)| id.to_string()).collect()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.http.listen.parse().map_err(|e| {
            BridgeError::validation(format!("invalid http.listen '{}': {}", self.http.listen, e))
        })
    }
}

impl BridgeConfig for EspBridgeConfig {
    fn zenoh(&self) -> Option<&ZenohConfig> {
        self.telemetry.enable.then_some(&self.telemetry.zenoh)
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.telemetry.key_prefix
    }

    fn validate(&self) -> espbridge_framework::Result<()> {
        if self.devices.is_empty() {
            return Err(BridgeError::validation("At least one device must be configured"));
        }

        let mut seen = HashSet::new();
        for (id, device) in self.devices() {
            if id.is_empty() {
                return Err(BridgeError::validation(format!(
                    "Device at {}:{} needs an id",
                    device.host, device.port
                )));
            }
            if !seen.insert(id.to_ascii_uppercase()) {
                return Err(BridgeError::validation(format!("Duplicate device id: {}", id)));
            }
            if device.host.is_empty() {
                return Err(BridgeError::validation(format!("Device {} has no host", id)));
            }
        }

        self.listen_addr()?;

        if self.supervisor.cooldown_secs == 0
            || self.supervisor.keepalive_secs == 0
            || self.supervisor.disconnect_timeout_secs == 0
        {
            return Err(BridgeError::validation("Supervisor durations must be positive"));
        }
        if self.dispatcher.connect_wait_secs == 0 {
            return Err(BridgeError::validation("dispatcher.connect_wait_secs must be positive"));
        }
        if self.simulator.tick_ms == 0 {
            return Err(BridgeError::validation("simulator.tick_ms must be positive"));
        }

        if self.telemetry.enable {
            for id in self.device_ids() {
                espbridge_common::keyexpr::validate_chunk(&id).map_err(|e| {
                    BridgeError::validation(format!("Device id '{}' cannot be published: {}", id, e))
                })?;
            }
            for topic in self.telemetry.topics.values() {
                espbridge_common::keyexpr::validate_chunk(topic).map_err(|e| {
                    BridgeError::validation(format!("Invalid telemetry topic '{}': {}", topic, e))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = EspBridgeConfig::parse(r#"{ devices: [ { host: "10.0.0.5" } ] }"#).unwrap();

        assert_eq!(config.device_ids(), vec!["default".to_string()]);
        assert_eq!(config.devices[0].port, 6053);
        assert_eq!(config.http.listen, "0.0.0.0:8000");
        assert_eq!(config.key_prefix(), "evcc/tesla");
        assert_eq!(config.telemetry.topics.get("battery_level").map(String::as_str), Some("soc"));
        assert_eq!(config.supervisor.settings(), SupervisorSettings::default());
        assert_eq!(config.dispatcher.connect_wait(), Duration::from_secs(10));
        assert!(config.zenoh().is_some());
    }

    #[test]
    fn test_full_config() {
        let config = EspBridgeConfig::parse(
            r#"{
                logging: { level: "debug", format: "json" },
                http: { listen: "127.0.0.1:9000" },
                telemetry: {
                    enable: false,
                    key_prefix: "garage/ev",
                    topics: { battery_level: "soc" },
                },
                supervisor: { cooldown_secs: 10 },
                vehicles: [
                    { vin: "5YJ3E1EA7KF000001", host: "10.0.0.5", password: "pw" },
                    { id: "5YJ3E1EA7KF000002", host: "10.0.0.6", port: 6054, encryption_key: "a2V5" },
                ],
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.device_ids(),
            vec!["5YJ3E1EA7KF000001".to_string(), "5YJ3E1EA7KF000002".to_string()]
        );
        assert_eq!(config.devices[0].password.as_deref(), Some("pw"));
        assert_eq!(config.devices[1].port, 6054);
        assert!(config.zenoh().is_none());
        assert_eq!(config.key_prefix(), "garage/ev");
        assert_eq!(config.supervisor.settings().cooldown, Duration::from_secs(10));
        assert_eq!(config.supervisor.keepalive_secs, 60);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("espbridge.json5");
        std::fs::write(
            &path,
            r#"{
                // single vehicle on the bench
                vehicles: [ { vin: "LRW3E7FA1MC000001", host: "esp-car.local" } ],
            }"#,
        )
        .unwrap();

        let config = EspBridgeConfig::load(&path).unwrap();
        assert_eq!(config.device_ids(), vec!["LRW3E7FA1MC000001".to_string()]);

        let err = EspBridgeConfig::load(dir.path().join("missing.json5")).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_no_devices_is_rejected() {
        let err = EspBridgeConfig::parse("{ devices: [] }").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }

    #[test]
    fn test_missing_devices_is_parse_error() {
        let err = EspBridgeConfig::parse("{}").unwrap_err();
        assert!(matches!(err, BridgeError::ConfigParse(_)));
    }

    #[test]
    fn test_multiple_devices_need_ids() {
        let err = EspBridgeConfig::parse(r#"{ devices: [ { host: "a" }, { id: "x", host: "b" } ] }"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }

    #[test]
    fn test_duplicate_ids_ignore_case() {
        let err = EspBridgeConfig::parse(
            r#"{ devices: [ { id: "abc", host: "a" }, { id: "ABC", host: "b" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }

    #[test]
    fn test_device_ids_must_be_key_chunks_with_telemetry() {
        let err = EspBridgeConfig::parse(r#"{ devices: [ { id: "car/1", host: "a" } ] }"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));

        let config = EspBridgeConfig::parse(
            r#"{ telemetry: { enable: false }, devices: [ { id: "car/1", host: "a" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.device_ids(), vec!["car/1".to_string()]);
    }

    #[test]
    fn test_bad_listen_and_durations() {
        let err = EspBridgeConfig::parse(
            r#"{ http: { listen: "nowhere" }, devices: [ { host: "a" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));

        let err = EspBridgeConfig::parse(
            r#"{ supervisor: { cooldown_secs: 0 }, devices: [ { host: "a" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }
}
