//! Error taxonomy of the bridge core.

use thiserror::Error;

/// Failures reported by a device client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Opening or authenticating the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection dropped; the epoch is over.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The device answered but refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The device did not answer in time.
    #[error("request timed out")]
    Timeout,
}

impl ClientError {
    /// Whether this error ends the current connection epoch.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::ConnectionLost(_) | ClientError::Timeout)
    }
}

/// Errors surfaced to HTTP callers by the dispatcher and the compatibility layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    /// No usable connection within the wait budget.
    #[error("device {0} is not connected")]
    ServiceUnavailable(String),

    /// The device rejected or failed the command.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The caller's payload is missing required fields.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The entity exists but has no compatible command kind.
    #[error("entity '{object_id}' of type {platform} does not support this operation")]
    UnsupportedOperation { object_id: String, platform: String },

    /// Unknown device, entity or state key.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CommandError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_classification() {
        assert!(ClientError::ConnectionLost("eof".into()).is_connection_lost());
        assert!(ClientError::Timeout.is_connection_lost());
        assert!(!ClientError::Rejected("bad key".into()).is_connection_lost());
        assert!(!ClientError::Connect("refused".into()).is_connection_lost());
    }

    #[test]
    fn test_unsupported_message() {
        let err = CommandError::UnsupportedOperation {
            object_id: "battery_level".into(),
            platform: "sensor".into(),
        };
        assert_eq!(
            err.to_string(),
            "entity 'battery_level' of type sensor does not support this operation"
        );
    }
}
