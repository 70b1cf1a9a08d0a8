//! Dead-letter records for messages that failed schema validation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{MemphisError, Result};
use crate::headers::{Headers, CONNECTION_ID, PRODUCED_BY};

static RECORD_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Producer identity attached to a dead letter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerIdentity {
    pub name: String,
    pub connection_id: String,
}

/// The rejected message itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    /// Payload bytes, hex encoded
    pub data: String,
    pub headers: BTreeMap<String, String>,
}

/// Record published to `$memphis-<station>-dls.schema.<id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub station_name: String,
    pub producer: ProducerIdentity,
    /// Milliseconds since the epoch
    pub creation_unix: i64,
    pub message: DeadLetterMessage,
}

impl DeadLetterRecord {
    /// Build a record for `payload` rejected on `station`.
    ///
    /// Caller headers are merged with the producer's identity headers; the id
    /// combines a process-wide counter with a microsecond timestamp.
    pub fn new(
        station: &str,
        producer: &str,
        connection_id: &str,
        payload: &[u8],
        headers: Option<&Headers>,
    ) -> Self {
        let now = Utc::now();
        let sequence = RECORD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}~{}~{}~{}", station, producer, sequence, now.timestamp_micros());

        let mut merged = headers.map(Headers::to_map).unwrap_or_default();
        merged.insert(CONNECTION_ID.to_string(), connection_id.to_string());
        merged.insert(PRODUCED_BY.to_string(), producer.to_string());

        Self {
            id,
            station_name: station.to_string(),
            producer: ProducerIdentity {
                name: producer.to_string(),
                connection_id: connection_id.to_string(),
            },
            creation_unix: now.timestamp_millis(),
            message: DeadLetterMessage {
                data: hex::encode(payload),
                headers: merged,
            },
        }
    }

    /// Original payload bytes
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        hex::decode(&self.message.data)
            .map_err(|e| MemphisError::Broker(format!("malformed dead-letter payload: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
