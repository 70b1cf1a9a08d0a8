//! Schema compiler and validation dispatch
//!
//! Turns [`SchemaMetadata`] into a [`StationSchema`], the compiled form the
//! producer validates against. Each variant owns one validate-and-encode
//! operation; dispatch is an exhaustive match, never a string compare.

mod graphql;
mod json;
mod protobuf;

pub use graphql::GraphQlValidator;
pub use json::{JsonDialect, JsonSchemaValidator, DIALECT_FALLBACK};
pub use protobuf::ProtobufValidator;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{MemphisError, Result};
use crate::payload::Payload;
use crate::schema::{SchemaKind, SchemaMetadata};

/// Compiled validator for one station
#[derive(Debug)]
pub enum StationSchema {
    /// No schema enforced
    NoSchema,
    Protobuf(ProtobufValidator),
    JsonSchema(JsonSchemaValidator),
    GraphQl(GraphQlValidator),
    /// The last applied schema failed to compile; producing is refused until
    /// a usable update arrives
    Unusable { reason: String },
}

impl StationSchema {
    /// Compile `metadata` for `station`
    pub fn compile(station: &str, metadata: &SchemaMetadata) -> Result<Self> {
        if metadata.is_drop() {
            return Ok(StationSchema::NoSchema);
        }

        let compiled = match metadata.kind {
            SchemaKind::None => Ok(StationSchema::NoSchema),
            SchemaKind::Protobuf => ProtobufValidator::compile(metadata).map(StationSchema::Protobuf),
            SchemaKind::Json => JsonSchemaValidator::compile(metadata.content()).map(StationSchema::JsonSchema),
            SchemaKind::Graphql => GraphQlValidator::compile(metadata.content()).map(StationSchema::GraphQl),
        };

        compiled.map_err(|reason| MemphisError::InvalidSchema {
            station: station.to_string(),
            reason,
        })
    }

    pub fn kind(&self) -> SchemaKind {
        match self {
            StationSchema::NoSchema | StationSchema::Unusable { .. } => SchemaKind::None,
            StationSchema::Protobuf(_) => SchemaKind::Protobuf,
            StationSchema::JsonSchema(_) => SchemaKind::Json,
            StationSchema::GraphQl(_) => SchemaKind::Graphql,
        }
    }

    /// Validate `payload` and return the bytes to publish
    pub fn validate(&self, station: &str, payload: &Payload) -> Result<Bytes> {
        match self {
            StationSchema::NoSchema => encode_unvalidated(payload),
            StationSchema::Protobuf(validator) => validator.validate(payload),
            StationSchema::JsonSchema(validator) => validator.validate(payload),
            StationSchema::GraphQl(validator) => validator.validate(payload),
            StationSchema::Unusable { reason } => Err(MemphisError::InvalidSchema {
                station: station.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Stations without a schema accept bytes and plain objects only
fn encode_unvalidated(payload: &Payload) -> Result<Bytes> {
    match payload {
        Payload::Bytes(bytes) => Ok(bytes.clone()),
        Payload::Json(value @ Value::Object(_)) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        _ => Err(MemphisError::UnsupportedMessage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_schema_accepts_bytes_and_objects() {
        let schema = StationSchema::NoSchema;
        assert_eq!(
            schema.validate("s", &Payload::from(&b"\x00\xff"[..])).unwrap(),
            Bytes::from_static(b"\x00\xff")
        );
        assert_eq!(
            schema.validate("s", &Payload::from(json!({"a": 1}))).unwrap(),
            Bytes::from_static(br#"{"a":1}"#)
        );
    }

    #[test]
    fn test_no_schema_rejects_other_types() {
        let schema = StationSchema::NoSchema;
        assert!(matches!(
            schema.validate("s", &Payload::from("text")),
            Err(MemphisError::UnsupportedMessage)
        ));
        assert!(matches!(
            schema.validate("s", &Payload::from(json!([1, 2]))),
            Err(MemphisError::UnsupportedMessage)
        ));
    }

    #[test]
    fn test_compile_dispatches_on_kind() {
        let json_schema = SchemaMetadata::new("s", SchemaKind::Json, r#"{"type": "object"}"#);
        assert_eq!(StationSchema::compile("st", &json_schema).unwrap().kind(), SchemaKind::Json);

        let none = SchemaMetadata::new("s", SchemaKind::None, "");
        assert_eq!(StationSchema::compile("st", &none).unwrap().kind(), SchemaKind::None);
    }

    #[test]
    fn test_compile_failure_names_station() {
        let broken = SchemaMetadata::new("s", SchemaKind::Json, "{not json");
        match StationSchema::compile("orders", &broken) {
            Err(MemphisError::InvalidSchema { station, .. }) => assert_eq!(station, "orders"),
            other => panic!("Expected InvalidSchema, got {:?}", other),
        }
    }

    #[test]
    fn test_unusable_refuses_to_validate() {
        let schema = StationSchema::Unusable { reason: "invalid json schema".to_string() };
        assert!(matches!(
            schema.validate("orders", &Payload::from(json!({}))),
            Err(MemphisError::InvalidSchema { .. })
        ));
    }
}
