use crate::error::{Error, Result};

/// Default key expression prefix for vehicle telemetry.
pub const DEFAULT_KEY_PREFIX: &str = "evcc/tesla";

/// Builder for telemetry key expressions.
///
/// Key expressions follow the pattern:
/// `<prefix>/<device>/<topic>`
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    /// Create a builder with the given prefix.
    ///
    /// Leading and trailing slashes are trimmed.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// The normalized prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the key expression for one device topic.
    ///
    /// # Example
    /// ```
    /// use espbridge_common::keyexpr::TopicBuilder;
    ///
    /// let builder = TopicBuilder::new("evcc/tesla");
    /// assert_eq!(builder.build("vin1", "soc"), "evcc/tesla/vin1/soc");
    /// ```
    pub fn build(&self, device: &str, topic: &str) -> String {
        format!("{}/{}/{}", self.prefix, device, topic)
    }

    /// Key expression for bridge status.
    ///
    /// # Example
    /// ```
    /// use espbridge_common::keyexpr::TopicBuilder;
    ///
    /// let builder = TopicBuilder::new("evcc/tesla");
    /// assert_eq!(builder.status_key(), "evcc/tesla/@/status");
    /// ```
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Validate a single key expression chunk (device id or topic name).
///
/// Chunks must be non-empty and must not contain Zenoh special characters.
pub fn validate_chunk(chunk: &str) -> Result<()> {
    if chunk.is_empty() {
        return Err(Error::KeyExpr("empty key chunk".to_string()));
    }
    if let Some(c) = chunk
        .chars()
        .find(|c| matches!(c, '/' | '*' | '$' | '?' | '#' | '@'))
    {
        return Err(Error::KeyExpr(format!(
            "invalid character '{}' in key chunk '{}'",
            c, chunk
        )));
    }
    Ok(())
}
