//! Outbound message payloads

use apollo_compiler::ast::Document;
use bytes::Bytes;
use serde_json::Value;

/// A message handed to [`Producer::produce`](crate::Producer::produce).
///
/// Which variants a station accepts depends on its schema kind.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Raw bytes, sent as-is once validated
    Bytes(Bytes),
    /// Text; accepted by GraphQL stations
    Text(String),
    /// Structured object; serialized (JSON) or encoded (protobuf) before sending
    Json(Value),
    /// Pre-parsed GraphQL document
    Document(Box<Document>),
}

impl Payload {
    /// Stable byte form used when the payload has to be recorded in a dead letter
    pub fn to_dead_letter_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.to_vec(),
            Payload::Text(text) => text.clone().into_bytes(),
            Payload::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Payload::Document(document) => document.to_string().into_bytes(),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => "bytes",
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
            Payload::Document(_) => "graphql document",
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Document> for Payload {
    fn from(document: Document) -> Self {
        Payload::Document(Box::new(document))
    }
}
