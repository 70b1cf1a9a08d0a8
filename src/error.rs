//! Error types for the Memphis client

use std::fmt::Display;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, MemphisError>;

/// Client errors
#[derive(Error, Debug)]
pub enum MemphisError {
    /// Bad construction parameters, raised before any broker call
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection is dead")]
    ConnectionDead,

    /// Nobody answered on the subject
    #[error("No responders available for {0}")]
    NoResponders(String),

    #[error("Produce operation has failed, please check whether Station/Producer still exist")]
    TargetMissing,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Error text returned by the broker or its control plane
    #[error("{0}")]
    Broker(String),

    #[error("Schema validation has failed: {0}")]
    SchemaValidation(String),

    #[error("Unsupported message type")]
    UnsupportedMessage,

    #[error("Invalid schema for station {station}: {reason}")]
    InvalidSchema { station: String, reason: String },

    #[error("Keys in headers should not start with $memphis")]
    ReservedHeader,

    #[error("station/consumer were not found")]
    ConsumerNotFound,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemphisError {
    /// Wrap a transport or control-plane error, scrubbing the transport's name
    pub fn broker(err: impl Display) -> Self {
        MemphisError::Broker(normalize(&err.to_string()))
    }

    /// Destructive operations treat "does not exist" replies as success
    pub fn is_not_found(&self) -> bool {
        match self {
            MemphisError::Broker(msg) => msg.contains("not exist"),
            _ => false,
        }
    }

    /// Whether the error came from schema validation and is dead-letter eligible
    pub fn is_schema_validation(&self) -> bool {
        matches!(self, MemphisError::SchemaValidation(_))
    }
}

/// Replace the underlying transport's name so callers see one error domain
pub fn normalize(message: &str) -> String {
    static TRANSPORT: OnceLock<Regex> = OnceLock::new();
    let re = TRANSPORT.get_or_init(|| {
        Regex::new(r"NatsError|Nats|nats|NATS").expect("transport pattern is valid")
    });
    re.replace_all(message, "memphis").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_transport_name() {
        assert_eq!(normalize("NatsError: TIMEOUT"), "memphis: TIMEOUT");
        assert_eq!(normalize("nats: no responders"), "memphis: no responders");
        assert_eq!(normalize("station orders does not exist"), "station orders does not exist");
    }

    #[test]
    fn test_not_found_detection() {
        assert!(MemphisError::broker("Consumer c1 at station orders does not exist").is_not_found());
        assert!(!MemphisError::broker("permission denied").is_not_found());
        assert!(!MemphisError::TargetMissing.is_not_found());
    }

    #[test]
    fn test_validation_display() {
        let err = MemphisError::SchemaValidation("\"total\" is a required property".to_string());
        assert!(err.is_schema_validation());
        assert_eq!(
            err.to_string(),
            "Schema validation has failed: \"total\" is a required property"
        );
    }
}
