//! JSON Schema stations

use std::fmt;

use bytes::Bytes;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::{MemphisError, Result};
use crate::payload::Payload;

/// A JSON Schema dialect the compiler can try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonDialect {
    /// Whatever `$schema` declares, draft-07 otherwise
    Detected,
    Draft7,
    Draft4,
    Draft202012,
    Draft6,
}

/// Order in which dialects are tried; the first successful compilation wins
pub const DIALECT_FALLBACK: [JsonDialect; 5] = [
    JsonDialect::Detected,
    JsonDialect::Draft7,
    JsonDialect::Draft4,
    JsonDialect::Draft202012,
    JsonDialect::Draft6,
];

impl JsonDialect {
    fn draft(self) -> Option<Draft> {
        match self {
            JsonDialect::Detected => None,
            JsonDialect::Draft7 => Some(Draft::Draft7),
            JsonDialect::Draft4 => Some(Draft::Draft4),
            JsonDialect::Draft202012 => Some(Draft::Draft202012),
            JsonDialect::Draft6 => Some(Draft::Draft6),
        }
    }

    /// Compile `schema` under this dialect
    pub fn compile(self, schema: &Value) -> std::result::Result<JSONSchema, String> {
        let mut options = JSONSchema::options();
        if let Some(draft) = self.draft() {
            options.with_draft(draft);
        }
        options.compile(schema).map_err(|e| e.to_string())
    }
}

/// Compiled JSON Schema validator
pub struct JsonSchemaValidator {
    compiled: JSONSchema,
    dialect: JsonDialect,
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl JsonSchemaValidator {
    /// Parse schema text and compile it with the default dialect fallback
    pub fn compile(content: &str) -> std::result::Result<Self, String> {
        let schema: Value =
            serde_json::from_str(content).map_err(|e| format!("invalid json schema: {}", e))?;
        Self::compile_with(&schema, &DIALECT_FALLBACK)
    }

    /// Try each dialect in order
    pub fn compile_with(schema: &Value, dialects: &[JsonDialect]) -> std::result::Result<Self, String> {
        let mut failures = Vec::with_capacity(dialects.len());
        for &dialect in dialects {
            match dialect.compile(schema) {
                Ok(compiled) => return Ok(Self { compiled, dialect }),
                Err(e) => failures.push(format!("{:?}: {}", dialect, e)),
            }
        }
        Err(format!("invalid json schema ({})", failures.join("; ")))
    }

    /// Dialect the schema compiled under
    pub fn dialect(&self) -> JsonDialect {
        self.dialect
    }

    /// Bytes must hold JSON text; objects are serialized before validation
    pub fn validate(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Bytes(bytes) => {
                let value: Value = serde_json::from_slice(bytes).map_err(|e| {
                    MemphisError::SchemaValidation(format!("Expecting Json format: {}", e))
                })?;
                self.check(&value)?;
                Ok(bytes.clone())
            }
            Payload::Json(value @ Value::Object(_)) => {
                self.check(value)?;
                Ok(Bytes::from(serde_json::to_vec(value)?))
            }
            _ => Err(MemphisError::SchemaValidation("Unsupported message type".to_string())),
        }
    }

    fn check(&self, value: &Value) -> Result<()> {
        if let Err(errors) = self.compiled.validate(value) {
            let details: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{} {}", path, e)
                    }
                })
                .collect();
            return Err(MemphisError::SchemaValidation(details.join(", ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_SCHEMA: &str = r#"{
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "total": { "type": "number" }
        },
        "required": ["id", "total"]
    }"#;

    #[test]
    fn test_valid_object_passes() {
        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        let bytes = validator.validate(&Payload::from(json!({"id": "a", "total": 5}))).unwrap();
        let round: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round["total"], 5);
    }

    #[test]
    fn test_missing_field_is_named() {
        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        let err = validator.validate(&Payload::from(json!({"id": "a"}))).unwrap_err();
        assert!(err.is_schema_validation());
        assert!(err.to_string().contains("total"), "got: {}", err);
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        let err = validator
            .validate(&Payload::from(json!({"id": 7, "total": 5})))
            .unwrap_err();
        assert!(err.to_string().contains("/id"), "got: {}", err);
    }

    #[test]
    fn test_bytes_must_be_json() {
        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        let err = validator.validate(&Payload::from(&b"not json"[..])).unwrap_err();
        assert!(err.to_string().contains("Expecting Json format"));

        let ok = validator
            .validate(&Payload::from(&br#"{"id": "a", "total": 1.5}"#[..]))
            .unwrap();
        assert_eq!(&ok[..], br#"{"id": "a", "total": 1.5}"#);
    }

    #[test]
    fn test_text_is_unsupported() {
        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        let err = validator.validate(&Payload::from("{}")).unwrap_err();
        assert!(err.to_string().contains("Unsupported message type"));
    }

    #[test]
    fn test_fallback_order() {
        assert_eq!(DIALECT_FALLBACK[0], JsonDialect::Detected);
        assert_eq!(DIALECT_FALLBACK[3], JsonDialect::Draft202012);
        assert_eq!(DIALECT_FALLBACK[4], JsonDialect::Draft6);

        let validator = JsonSchemaValidator::compile(ORDER_SCHEMA).unwrap();
        assert_eq!(validator.dialect(), JsonDialect::Detected);
    }

    #[test]
    fn test_draft4_schema_compiles() {
        let schema = r#"{
            "$schema": "http://json-schema.org/draft-04/schema#",
            "type": "object",
            "properties": { "age": { "type": "integer", "minimum": 0, "exclusiveMinimum": true } }
        }"#;
        let validator = JsonSchemaValidator::compile(schema).unwrap();
        assert!(validator.validate(&Payload::from(json!({"age": 0}))).is_err());
        assert!(validator.validate(&Payload::from(json!({"age": 1}))).is_ok());
    }

    #[test]
    fn test_unparseable_schema_fails() {
        let err = JsonSchemaValidator::compile("{oops").unwrap_err();
        assert!(err.starts_with("invalid json schema"));
    }
}
