//! GraphQL stations

use apollo_compiler::ast::Document;
use apollo_compiler::validation::Valid;
use apollo_compiler::Schema;
use bytes::Bytes;

use crate::error::{MemphisError, Result};
use crate::payload::Payload;

const INVALID_FORMAT: &str = "Invalid message format, expecting GraphQL";

/// Document schema built from the station's SDL
#[derive(Debug)]
pub struct GraphQlValidator {
    schema: Valid<Schema>,
}

impl GraphQlValidator {
    pub fn compile(sdl: &str) -> std::result::Result<Self, String> {
        let schema = Schema::parse_and_validate(sdl, "schema.graphql")
            .map_err(|e| format!("invalid graphql schema: {}", e.errors))?;
        Ok(Self { schema })
    }

    /// Accepts bytes, text or a pre-parsed document
    pub fn validate(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| MemphisError::SchemaValidation(INVALID_FORMAT.to_string()))?;
                self.check(&parse(text)?)?;
                Ok(bytes.clone())
            }
            Payload::Text(text) => {
                self.check(&parse(text)?)?;
                Ok(Bytes::from(text.clone()))
            }
            Payload::Document(document) => {
                self.check(document)?;
                Ok(Bytes::from(document.to_string()))
            }
            Payload::Json(_) => {
                Err(MemphisError::SchemaValidation("Unsupported message type".to_string()))
            }
        }
    }

    fn check(&self, document: &Document) -> Result<()> {
        document
            .to_executable_validate(&self.schema)
            .map(|_| ())
            .map_err(|e| MemphisError::SchemaValidation(e.errors.to_string()))
    }
}

/// Syntax errors collapse into a single format failure
fn parse(text: &str) -> Result<Document> {
    Document::parse(text, "message.graphql")
        .map_err(|_| MemphisError::SchemaValidation(INVALID_FORMAT.to_string()))
}
