//! Telemetry publishing over Zenoh.

use std::sync::Arc;

use espbridge_common::TopicBuilder;
use espbridge_common::keyexpr::validate_chunk;

use crate::error::{BridgeError, Result};

/// Puts telemetry values on `<prefix>/<device>/<topic>`.
///
/// Cheap to clone; clones share the Zenoh session.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    topics: TopicBuilder,
}

impl Publisher {
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            session,
            topics: TopicBuilder::new(key_prefix),
        }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Publish a stringified value for one device topic.
    ///
    /// Device ids and topics that are not valid key expression chunks are
    /// rejected before anything is sent.
    pub async fn publish_text(&self, device: &str, topic: &str, payload: &str) -> Result<()> {
        let key = self.topics.build(device, topic);
        validate_chunk(device)
            .and_then(|()| validate_chunk(topic))
            .map_err(|e| BridgeError::Publish {
                key: key.clone(),
                message: e.to_string(),
            })?;
        self.put(&key, payload.as_bytes().to_vec()).await
    }

    /// Publish a value encoded as JSON.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.put(key, payload).await
    }

    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}

/// Running totals of publish outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: u64,
    pub failed: u64,
    /// Samples discarded before reaching Zenoh, e.g. on a full queue.
    pub dropped: u64,
}

impl PublishStats {
    pub fn total(&self) -> u64 {
        self.success + self.failed + self.dropped
    }

    /// Percentage of samples that were delivered, 100 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 100.0,
            total => self.success as f64 * 100.0 / total as f64,
        }
    }
}
