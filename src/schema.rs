//! Schema metadata as pushed by the broker

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Kind of schema attached to a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// Protocol Buffers (`.proto` text plus a message type name)
    Protobuf,
    /// JSON Schema, any supported dialect
    Json,
    /// GraphQL SDL
    Graphql,
    /// No schema enforced; unknown kinds land here too
    #[default]
    #[serde(other)]
    None,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::Protobuf => "protobuf",
            SchemaKind::Json => "json",
            SchemaKind::Graphql => "graphql",
            SchemaKind::None => "none",
        }
    }
}

/// The active version of an attached schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaVersion {
    pub version_number: u64,
    pub schema_content: String,
    /// Protobuf only: the message type payloads are validated against
    pub message_struct_name: String,
}

/// Raw schema metadata for one station. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    #[serde(default)]
    pub schema_name: String,
    #[serde(rename = "type", default)]
    pub kind: SchemaKind,
    #[serde(default)]
    pub active_version: SchemaVersion,
}

impl SchemaMetadata {
    pub fn new(name: impl Into<String>, kind: SchemaKind, content: impl Into<String>) -> Self {
        Self {
            schema_name: name.into(),
            kind,
            active_version: SchemaVersion {
                version_number: 1,
                schema_content: content.into(),
                message_struct_name: String::new(),
            },
        }
    }

    /// Protobuf schema validating against `message`
    pub fn protobuf(
        name: impl Into<String>,
        content: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut metadata = Self::new(name, SchemaKind::Protobuf, content);
        metadata.active_version.message_struct_name = message.into();
        metadata
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.active_version.version_number = version;
        self
    }

    /// The drop-signal: an update with an empty schema name detaches the schema
    pub fn drop_signal() -> Self {
        Self::default()
    }

    pub fn is_drop(&self) -> bool {
        self.schema_name.is_empty()
    }

    pub fn content(&self) -> &str {
        &self.active_version.schema_content
    }

    pub fn version(&self) -> u64 {
        self.active_version.version_number
    }

    /// Checksum over the schema content
    pub fn checksum(&self) -> Checksum {
        Checksum::of(self.content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_payload() {
        let metadata: SchemaMetadata = serde_json::from_str(
            r#"{
                "schema_name": "orders-schema",
                "type": "json",
                "active_version": {
                    "version_number": 3,
                    "schema_content": "{\"type\": \"object\"}",
                    "message_struct_name": ""
                }
            }"#,
        )
        .unwrap();

        assert_eq!(metadata.kind, SchemaKind::Json);
        assert_eq!(metadata.version(), 3);
        assert!(!metadata.is_drop());
    }

    #[test]
    fn test_unknown_kind_is_none() {
        let metadata: SchemaMetadata =
            serde_json::from_str(r#"{"schema_name": "x", "type": "avro"}"#).unwrap();
        assert_eq!(metadata.kind, SchemaKind::None);
    }

    #[test]
    fn test_drop_signal() {
        let metadata: SchemaMetadata = serde_json::from_str(r#"{"schema_name": ""}"#).unwrap();
        assert!(metadata.is_drop());
        assert!(SchemaMetadata::drop_signal().is_drop());
    }
}
