//! Fire-and-forget telemetry feed.

use std::collections::HashMap;
use std::sync::Arc;

use espbridge_framework::{PublishStats, Publisher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receives normalized updates destined for the telemetry feed.
///
/// `publish` must return immediately; delivery is best effort.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, device_id: &str, topic: &str, payload: String);
}

/// Discards everything. Used when telemetry is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn publish(&self, _device_id: &str, _topic: &str, _payload: String) {}
}

/// Allow-list of object ids forwarded to telemetry, with their topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    topics: HashMap<String, String>,
}

impl TopicMap {
    pub fn new(topics: HashMap<String, String>) -> Self {
        Self { topics }
    }

    /// Topic for an object id, if it is forwarded.
    pub fn topic_for(&self, object_id: &str) -> Option<&str> {
        self.topics.get(object_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::new(default_topics())
    }
}

/// The stock allow-list: battery level, connectivity and charging.
pub fn default_topics() -> HashMap<String, String> {
    [
        ("battery_level", "soc"),
        ("connected", "connected"),
        ("charging", "charging"),
    ]
    .into_iter()
    .map(|(id, topic)| (id.to_string(), topic.to_string()))
    .collect()
}

#[derive(Debug)]
struct Sample {
    device_id: String,
    topic: String,
    payload: String,
}

/// Telemetry sink backed by a Zenoh [`Publisher`].
///
/// Samples go through a bounded queue to a background worker; a full
/// queue drops the sample instead of blocking the caller.
#[derive(Debug, Clone)]
pub struct ZenohTelemetry {
    tx: mpsc::Sender<Sample>,
    stats: Arc<Mutex<PublishStats>>,
}

/// Background half of [`ZenohTelemetry`].
pub struct TelemetryWorker {
    publisher: Publisher,
    rx: mpsc::Receiver<Sample>,
    stats: Arc<Mutex<PublishStats>>,
}

impl ZenohTelemetry {
    pub fn new(publisher: Publisher, capacity: usize) -> (Self, TelemetryWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(Mutex::new(PublishStats::default()));
        (
            Self {
                tx,
                stats: stats.clone(),
            },
            TelemetryWorker {
                publisher,
                rx,
                stats,
            },
        )
    }

    pub fn stats(&self) -> PublishStats {
        *self.stats.lock()
    }
}

impl TelemetrySink for ZenohTelemetry {
    fn publish(&self, device_id: &str, topic: &str, payload: String) {
        let sample = Sample {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            payload,
        };
        if let Err(e) = self.tx.try_send(sample) {
            self.stats.lock().dropped += 1;
            tracing::debug!(device = %device_id, topic = %topic, error = %e, "Telemetry sample dropped");
        }
    }
}

impl TelemetryWorker {
    /// Drain the queue into Zenoh until cancelled or every sender is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let sample = tokio::select! {
                _ = shutdown.cancelled() => break,
                sample = self.rx.recv() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };

            match self
                .publisher
                .publish_text(&sample.device_id, &sample.topic, &sample.payload)
                .await
            {
                Ok(()) => self.stats.lock().success += 1,
                Err(e) => {
                    self.stats.lock().failed += 1;
                    tracing::warn!(device = %sample.device_id, topic = %sample.topic, error = %e, "Telemetry publish failed");
                }
            }
        }

        let stats = *self.stats.lock();
        tracing::info!(
            published = stats.success,
            failed = stats.failed,
            dropped = stats.dropped,
            success_rate = stats.success_rate(),
            "Telemetry worker stopped"
        );
    }
}
