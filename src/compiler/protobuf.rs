//! Protobuf stations

use bytes::Bytes;
use prost::Message as _;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use serde_json::Value;

use crate::error::{MemphisError, Result};
use crate::payload::Payload;
use crate::schema::SchemaMetadata;

const INVALID_FORMAT: &str = "Invalid message format, expecting protobuf";

/// Validator bound to one message type of a compiled `.proto` file
#[derive(Debug, Clone)]
pub struct ProtobufValidator {
    descriptor: MessageDescriptor,
}

impl ProtobufValidator {
    /// Parse the `.proto` text and resolve the configured message type
    pub fn compile(metadata: &SchemaMetadata) -> std::result::Result<Self, String> {
        let file_name = format!("{}_{}.proto", metadata.schema_name, metadata.version());
        let file = protox_parse::parse(&file_name, metadata.content())
            .map_err(|e| format!("invalid protobuf schema: {}", e))?;

        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file)
            .map_err(|e| format!("invalid protobuf schema: {}", e))?;

        let wanted = metadata.active_version.message_struct_name.as_str();
        let descriptor = pool
            .get_message_by_name(wanted)
            .or_else(|| pool.all_messages().find(|m| m.name() == wanted))
            .ok_or_else(|| format!("message type {} not found in schema", wanted))?;

        Ok(Self { descriptor })
    }

    /// Fully-qualified name of the validated message type
    pub fn message_name(&self) -> &str {
        self.descriptor.full_name()
    }

    /// Decode bytes into a dynamic message
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicMessage> {
        DynamicMessage::decode(self.descriptor.clone(), bytes).map_err(|e| {
            let reason = e.to_string();
            if is_wire_format_error(&reason) {
                MemphisError::SchemaValidation(INVALID_FORMAT.to_string())
            } else {
                MemphisError::SchemaValidation(reason)
            }
        })
    }

    /// Verify an object field by field, then encode it to wire format
    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        let message = DynamicMessage::deserialize(self.descriptor.clone(), value.clone())
            .map_err(|e| MemphisError::SchemaValidation(e.to_string()))?;
        Ok(Bytes::from(message.encode_to_vec()))
    }

    pub fn validate(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Bytes(bytes) => {
                self.decode(bytes)?;
                Ok(bytes.clone())
            }
            Payload::Json(value @ Value::Object(_)) => self.encode(value),
            _ => Err(MemphisError::SchemaValidation("Unsupported message type".to_string())),
        }
    }
}

fn is_wire_format_error(reason: &str) -> bool {
    ["wire type", "buffer underflow", "invalid varint", "index out of range"]
        .iter()
        .any(|marker| reason.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_PROTO: &str = r#"
        syntax = "proto3";
        package shop;

        message Order {
            string id = 1;
            double total = 2;
            repeated string tags = 3;
        }
    "#;

    fn validator() -> ProtobufValidator {
        ProtobufValidator::compile(&SchemaMetadata::protobuf("orders", ORDER_PROTO, "Order")).unwrap()
    }

    #[test]
    fn test_resolves_short_and_full_names() {
        assert_eq!(validator().message_name(), "shop.Order");
        let full = SchemaMetadata::protobuf("orders", ORDER_PROTO, "shop.Order");
        assert!(ProtobufValidator::compile(&full).is_ok());
    }

    #[test]
    fn test_missing_message_type() {
        let metadata = SchemaMetadata::protobuf("orders", ORDER_PROTO, "Invoice");
        let err = ProtobufValidator::compile(&metadata).unwrap_err();
        assert!(err.contains("Invoice"));
    }

    #[test]
    fn test_object_round_trip() {
        let validator = validator();
        let original = json!({"id": "a-1", "total": 12.5, "tags": ["x", "y"]});

        let bytes = validator.validate(&Payload::from(original.clone())).unwrap();
        let decoded = validator.decode(&bytes).unwrap();
        assert_eq!(serde_json::to_value(&decoded).unwrap(), original);
    }

    #[test]
    fn test_object_with_wrong_field_type() {
        let err = validator()
            .validate(&Payload::from(json!({"id": 7})))
            .unwrap_err();
        assert!(err.is_schema_validation());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = validator()
            .validate(&Payload::from(json!({"id": "a", "color": "red"})))
            .unwrap_err();
        assert!(err.is_schema_validation());
    }

    #[test]
    fn test_garbage_bytes_are_invalid_format() {
        // field 1 declared with wire type 7, which does not exist
        let err = validator()
            .validate(&Payload::from(vec![0x0f, 0x01]))
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Schema validation has failed: {}", INVALID_FORMAT));
    }

    #[test]
    fn test_text_is_unsupported() {
        let err = validator().validate(&Payload::from("id: a")).unwrap_err();
        assert!(err.to_string().contains("Unsupported message type"));
    }
}
