//! Control-plane subjects and wire payloads
//!
//! Requests are JSON bodies carrying a `username`; replies are an empty string
//! on success or the error text otherwise (producer creation replies with JSON).

use serde::{Deserialize, Serialize};

use crate::schema::SchemaMetadata;

pub const STATION_CREATIONS: &str = "$memphis_station_creations";
pub const STATION_DESTRUCTIONS: &str = "$memphis_station_destructions";
pub const PRODUCER_CREATIONS: &str = "$memphis_producer_creations";
pub const PRODUCER_DESTRUCTIONS: &str = "$memphis_producer_destructions";
pub const CONSUMER_CREATIONS: &str = "$memphis_consumer_creations";
pub const CONSUMER_DESTRUCTIONS: &str = "$memphis_consumer_destructions";
pub const SCHEMA_ATTACHMENTS: &str = "$memphis_schema_attachments";
pub const SCHEMA_DETACHMENTS: &str = "$memphis_schema_detachments";

/// Process-wide cluster toggles
pub const SDK_CONFIG_UPDATES: &str = "$memphis_sdk_configurations_updates";
pub const NOTIFICATIONS: &str = "$memphis_notifications";
/// Pseudo-acks for dead-letter redeliveries
pub const PM_ACKS: &str = "$memphis_pm_acks";

pub const SCHEMA_VALIDATION_FAIL_ALERT: &str = "schema_validation_fail_alert";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStationRequest {
    pub name: String,
    pub retention_type: String,
    pub retention_value: u64,
    pub storage_type: String,
    pub replicas: u32,
    pub idempotency_window_in_ms: u64,
    pub schema_name: String,
    pub dls_configuration: DlsConfiguration,
    pub username: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DlsConfiguration {
    pub poison: bool,
    #[serde(rename = "Schemaverse")]
    pub schemaverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyStationRequest {
    pub station_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProducerRequest {
    pub name: String,
    pub station_name: String,
    pub connection_id: String,
    pub producer_type: String,
    pub req_version: u32,
    pub username: String,
}

/// Reply to a producer creation; seeds the schema registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateProducerResponse {
    pub error: String,
    pub schema_update: Option<SchemaMetadata>,
    pub schemaverse_to_dls: bool,
    pub send_notification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyProducerRequest {
    pub name: String,
    pub station_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    pub name: String,
    pub station_name: String,
    pub connection_id: String,
    pub consumer_type: String,
    pub consumers_group: String,
    pub max_ack_time_ms: u64,
    pub max_msg_deliveries: u32,
    pub start_consume_from_sequence: i64,
    pub last_messages: i64,
    pub req_version: u32,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyConsumerRequest {
    pub name: String,
    pub station_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachSchemaRequest {
    pub name: String,
    pub station_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachSchemaRequest {
    pub station_name: String,
    pub username: String,
}

/// Payload on `$memphis_schema_updates_<station>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaUpdateNotification {
    pub init: SchemaMetadata,
}

/// Payload on `$memphis_sdk_configurations_updates`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfigUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub station_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmAck {
    pub id: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_response_tolerates_missing_fields() {
        let res: CreateProducerResponse = serde_json::from_str(r#"{"error": ""}"#).unwrap();
        assert!(res.error.is_empty());
        assert!(res.schema_update.is_none());
        assert!(!res.schemaverse_to_dls);
    }

    #[test]
    fn test_dls_configuration_wire_names() {
        let json = serde_json::to_value(DlsConfiguration { poison: true, schemaverse: false }).unwrap();
        assert_eq!(json["poison"], true);
        assert_eq!(json["Schemaverse"], false);
    }

    #[test]
    fn test_sdk_config_update_parsing() {
        let update: SdkConfigUpdate = serde_json::from_str(
            r#"{"type": "schemaverse_to_dls", "update": true, "station_name": "orders"}"#,
        )
        .unwrap();
        assert_eq!(update.kind, "schemaverse_to_dls");
        assert!(update.update);
    }
}
