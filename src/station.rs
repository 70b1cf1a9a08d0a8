//! Stations: naming, subjects and the station handle

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::Client;
use crate::error::Result;
use crate::protocol::{DestroyStationRequest, STATION_DESTRUCTIONS};

/// Internal delimiter replacing `.` in station names
pub const DELIMITER: char = '#';

/// Normalize any station/consumer/group name into its internal form
pub fn internal_name(name: &str) -> String {
    name.to_lowercase().replace('.', &DELIMITER.to_string())
}

/// A station name together with its internal key.
///
/// `Orders.EU` and `orders#eu` share the key `orders#eu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StationName {
    name: String,
    internal: String,
}

impl StationName {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            internal: internal_name(name),
        }
    }

    /// Lower-cased name as sent to the control plane
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Registry key and subject component
    pub fn internal(&self) -> &str {
        &self.internal
    }

    /// Primary subject producers publish to
    pub fn final_subject(&self) -> String {
        format!("{}.final", self.internal)
    }

    pub fn schema_updates_subject(&self) -> String {
        format!("$memphis_schema_updates_{}", self.internal)
    }

    /// Subject for a schema-failure dead letter with id `id`
    pub fn dls_schema_subject(&self, id: &str) -> String {
        format!("$memphis-{}-dls.schema.{}", self.internal, id)
    }

    /// Dead-letter redelivery subject for a consumer group
    pub fn dls_subject(&self, group: &str) -> String {
        format!("$memphis_dls_{}_{}", self.internal, internal_name(group))
    }

    /// Queue group shared by a consumer group's dead-letter subscribers
    pub fn dls_queue(&self, group: &str) -> String {
        format!("$memphis_{}_{}", self.internal, internal_name(group))
    }
}

impl fmt::Display for StationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Retention policy for a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    #[default]
    #[serde(rename = "message_age_sec")]
    MaxMessageAgeSeconds,
    Messages,
    Bytes,
}

impl RetentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionType::MaxMessageAgeSeconds => "message_age_sec",
            RetentionType::Messages => "messages",
            RetentionType::Bytes => "bytes",
        }
    }
}

/// Persistence storage for a station's messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    #[serde(rename = "file")]
    Disk,
    Memory,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Disk => "file",
            StorageType::Memory => "memory",
        }
    }
}

/// Station creation options
#[derive(Debug, Clone)]
pub struct StationOptions {
    pub name: String,
    pub retention_type: RetentionType,
    pub retention_value: u64,
    pub storage_type: StorageType,
    pub replicas: u32,
    /// Window in which duplicate message ids are dropped
    pub idempotency_window_ms: u64,
    pub schema_name: String,
    pub send_poison_msg_to_dls: bool,
    pub send_schema_failed_msg_to_dls: bool,
}

impl StationOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retention_type: RetentionType::default(),
            retention_value: 604_800,
            storage_type: StorageType::default(),
            replicas: 1,
            idempotency_window_ms: 120_000,
            schema_name: String::new(),
            send_poison_msg_to_dls: true,
            send_schema_failed_msg_to_dls: true,
        }
    }

    pub fn schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn send_schema_failed_msg_to_dls(mut self, enabled: bool) -> Self {
        self.send_schema_failed_msg_to_dls = enabled;
        self
    }
}

/// Handle to a created station
#[derive(Debug, Clone)]
pub struct Station {
    client: Client,
    name: StationName,
}

impl Station {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: StationName::new(name),
        }
    }

    pub fn name(&self) -> &StationName {
        &self.name
    }

    /// Destroy the station. Destroying a station that is already gone succeeds.
    pub async fn destroy(&self) -> Result<()> {
        self.client.registry().remove_station(self.name.internal()).await?;

        let request = DestroyStationRequest {
            station_name: self.name.as_str().to_string(),
            username: self.client.username().to_string(),
        };
        match self.client.control_request(STATION_DESTRUCTIONS, &request).await {
            Ok(()) => {
                info!(station = %self.name, "station destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
