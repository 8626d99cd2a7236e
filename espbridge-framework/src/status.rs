//! Bridge availability announcements.
//!
//! Subscribers find the current availability of a bridge on
//! `{key_prefix}/@/status`: `running` once startup completes and `offline`
//! after a clean shutdown.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::publisher::Publisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Running,
    Offline,
}

/// Payload of a status announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub bridge: String,
    pub version: String,
    pub status: Availability,
    /// Bridge-specific details, e.g. the configured devices.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl BridgeStatus {
    pub fn new(
        bridge: impl Into<String>,
        version: impl Into<String>,
        status: Availability,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status,
            details: Map::new(),
        }
    }

    /// Merge details into the announcement.
    ///
    /// Object fields are merged at the top level; any other non-null value
    /// is kept under `details`.
    pub fn with_details(mut self, details: Value) -> Self {
        match details {
            Value::Object(fields) => self.details.extend(fields),
            Value::Null => {}
            other => {
                self.details.insert("details".to_string(), other);
            }
        }
        self
    }
}

/// Publishes the bridge's availability on startup and shutdown.
///
/// Details given with the `running` announcement are repeated in the
/// `offline` one so subscribers can tell which devices went away.
pub struct StatusPublisher {
    publisher: Publisher,
    bridge: String,
    version: String,
    details: Value,
}

impl StatusPublisher {
    pub fn new(publisher: Publisher, bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            publisher,
            bridge: bridge.into(),
            version: version.into(),
            details: Value::Null,
        }
    }

    fn status(&self, availability: Availability) -> BridgeStatus {
        BridgeStatus::new(&self.bridge, &self.version, availability).with_details(self.details.clone())
    }

    async fn announce(&self, availability: Availability) -> Result<()> {
        let key = self.publisher.topics().status_key();
        tracing::debug!(key = %key, status = ?availability, "Announcing bridge status");
        self.publisher
            .publish_json(&key, &self.status(availability))
            .await
    }

    /// Announce `running`, remembering `details` for later announcements.
    pub async fn publish_running(&mut self, details: Option<Value>) -> Result<()> {
        if let Some(details) = details {
            self.details = details;
        }
        self.announce(Availability::Running).await
    }

    pub async fn publish_offline(&self) -> Result<()> {
        self.announce(Availability::Offline).await
    }
}
