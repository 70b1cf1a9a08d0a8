//! Producer Pipeline Tests
//!
//! Drives stations, schema attachment and producers against the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use memphis_schemaverse::{
    Client, DeadLetterRecord, Headers, MemoryBroker, MemphisError, ProduceOptions, SchemaKind,
    SchemaMetadata, StationOptions,
};
use serde_json::json;

const ORDERS_SCHEMA: &str = include_str!("fixtures/orders.schema.json");
const ORDERS_PROTO: &str = include_str!("fixtures/orders.proto");
const ORDERS_GRAPHQL: &str = include_str!("fixtures/orders.graphql");

async fn setup() -> (Arc<MemoryBroker>, Client) {
    let broker = Arc::new(MemoryBroker::new());
    let client = Client::with_broker(broker.clone(), "root").await.unwrap();
    (broker, client)
}

fn orders_schema() -> SchemaMetadata {
    SchemaMetadata::new("orders-schema", SchemaKind::Json, ORDERS_SCHEMA)
}

/// Produce `payload` until it is rejected, giving pushed updates time to land
async fn wait_until_rejected(producer: &memphis_schemaverse::Producer, payload: serde_json::Value) -> MemphisError {
    for _ in 0..100 {
        match producer.produce(payload.clone(), None, ProduceOptions::default()).await {
            Err(e) => return e,
            Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("payload was never rejected");
}

// =============================================================================
// JSON Schema Stations
// =============================================================================

#[tokio::test]
async fn test_orders_schema_with_dead_letter() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    client
        .station(StationOptions::new("orders").schema("orders-schema"))
        .await
        .unwrap();

    let producer = client.producer("orders", "checkout", false).await.unwrap();

    producer
        .produce(json!({"id": "a-1", "total": 5}), None, ProduceOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.stream_messages("orders").len(), 1);

    let rejected = json!({"id": "a-2"});
    let err = producer
        .produce(rejected.clone(), None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_schema_validation());
    assert!(err.to_string().contains("total"), "got: {}", err);

    assert_eq!(broker.stream_messages("orders").len(), 1);
    let dead_letters = broker.dead_letters("orders");
    assert_eq!(dead_letters.len(), 1);
    assert!(dead_letters[0].subject.starts_with("$memphis-orders-dls.schema.orders~checkout~"));

    let record: DeadLetterRecord = serde_json::from_slice(&dead_letters[0].payload).unwrap();
    assert_eq!(record.station_name, "orders");
    assert_eq!(record.producer.name, "checkout");
    assert_eq!(record.producer.connection_id, client.connection_id());
    let original: serde_json::Value = serde_json::from_slice(&record.decode_payload().unwrap()).unwrap();
    assert_eq!(original, rejected);
}

#[tokio::test]
async fn test_bytes_are_parsed_as_json() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    client
        .station(StationOptions::new("orders").schema("orders-schema"))
        .await
        .unwrap();
    let producer = client.producer("orders", "raw", false).await.unwrap();

    producer
        .produce(&br#"{"id": "b-1", "total": 1.25}"#[..], None, ProduceOptions::default())
        .await
        .unwrap();

    let err = producer
        .produce(&b"not json"[..], None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Expecting Json format"));
}

#[tokio::test]
async fn test_dead_letter_disabled_for_station() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    client
        .station(
            StationOptions::new("quiet")
                .schema("orders-schema")
                .send_schema_failed_msg_to_dls(false),
        )
        .await
        .unwrap();
    let producer = client.producer("quiet", "p", false).await.unwrap();

    let err = producer
        .produce(json!({"id": 1}), None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_schema_validation());
    assert!(broker.dead_letters("quiet").is_empty());
}

#[tokio::test]
async fn test_failure_notification() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    broker.set_send_notification(true);
    client
        .station(StationOptions::new("orders").schema("orders-schema"))
        .await
        .unwrap();
    let producer = client.producer("orders", "checkout", false).await.unwrap();

    producer
        .produce(json!({"total": 3}), None, ProduceOptions::default())
        .await
        .unwrap_err();

    let notifications = broker.published("$memphis_notifications");
    assert_eq!(notifications.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&notifications[0].payload).unwrap();
    assert_eq!(body["title"], "Schema validation has failed");
    assert_eq!(body["type"], "schema_validation_fail_alert");
    assert!(body["msg"].as_str().unwrap().contains("Producer: checkout"));
}

// =============================================================================
// Schema Hot-Swap
// =============================================================================

#[tokio::test]
async fn test_attach_and_detach_are_picked_up() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    client.station(StationOptions::new("orders")).await.unwrap();
    let producer = client.producer("orders", "p", false).await.unwrap();

    let missing_total = json!({"id": "x"});
    producer
        .produce(missing_total.clone(), None, ProduceOptions::default())
        .await
        .unwrap();

    client.attach_schema("orders-schema", "orders").await.unwrap();
    let err = wait_until_rejected(&producer, missing_total.clone()).await;
    assert!(err.is_schema_validation());

    client.detach_schema("orders").await.unwrap();
    let mut accepted = false;
    for _ in 0..100 {
        if producer
            .produce(missing_total.clone(), None, ProduceOptions::default())
            .await
            .is_ok()
        {
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(accepted, "detached schema still enforced");
}

#[tokio::test]
async fn test_producers_share_one_registry_entry() {
    let (broker, client) = setup().await;
    client.station(StationOptions::new("orders")).await.unwrap();
    let first = client.producer("orders", "p", true).await.unwrap();
    let second = client.producer("orders", "p", true).await.unwrap();
    assert_ne!(first.name(), second.name());

    first.destroy().await.unwrap();
    broker.push_schema_update("orders", orders_schema());

    let err = wait_until_rejected(&second, json!({"id": "x"})).await;
    assert!(err.is_schema_validation());
}

#[tokio::test]
async fn test_schemaverse_toggle_from_cluster() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-schema", orders_schema());
    client
        .station(StationOptions::new("orders").schema("orders-schema"))
        .await
        .unwrap();
    let producer = client.producer("orders", "p", false).await.unwrap();

    broker.set_schemaverse_to_dls("orders", false);
    let mut stopped = false;
    for _ in 0..100 {
        let before = broker.dead_letters("orders").len();
        let err = producer
            .produce(json!({}), None, ProduceOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_schema_validation());
        if broker.dead_letters("orders").len() == before {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped, "dead-letter routing never turned off");
}

// =============================================================================
// Protobuf and GraphQL Stations
// =============================================================================

#[tokio::test]
async fn test_protobuf_station_encodes_objects() {
    let (broker, client) = setup().await;
    broker.register_schema("orders-proto", SchemaMetadata::protobuf("orders-proto", ORDERS_PROTO, "Order"));
    client
        .station(StationOptions::new("proto-orders").schema("orders-proto"))
        .await
        .unwrap();
    let producer = client.producer("proto-orders", "p", false).await.unwrap();

    producer
        .produce(json!({"id": "p-1", "total": 9.5, "items": ["a"]}), None, ProduceOptions::default())
        .await
        .unwrap();

    let stored = broker.stream_messages("proto-orders");
    assert_eq!(stored.len(), 1);
    // field 1, length-delimited, "p-1"
    assert_eq!(&stored[0].payload[..5], &[0x0a, 0x03, b'p', b'-', b'1']);

    let err = producer
        .produce(&[0x0f, 0x01][..], None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expecting protobuf"));
    assert_eq!(broker.dead_letters("proto-orders").len(), 1);
}

#[tokio::test]
async fn test_graphql_station_accepts_documents() {
    let (broker, client) = setup().await;
    broker.register_schema(
        "orders-gql",
        SchemaMetadata::new("orders-gql", SchemaKind::Graphql, ORDERS_GRAPHQL),
    );
    client
        .station(StationOptions::new("gql").schema("orders-gql"))
        .await
        .unwrap();
    let producer = client.producer("gql", "p", false).await.unwrap();

    producer
        .produce("query { orders { id total } }", None, ProduceOptions::default())
        .await
        .unwrap();
    let err = producer
        .produce("query { orders { color } }", None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_schema_validation());
}

// =============================================================================
// No-Schema Stations and Headers
// =============================================================================

#[tokio::test]
async fn test_no_schema_acceptance() {
    let (broker, client) = setup().await;
    client.station(StationOptions::new("plain")).await.unwrap();
    let producer = client.producer("plain", "p", false).await.unwrap();

    producer
        .produce(vec![0u8, 1, 2], None, ProduceOptions::default())
        .await
        .unwrap();
    producer
        .produce(json!({"any": "object"}), None, ProduceOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.stream_messages("plain").len(), 2);

    let err = producer
        .produce("text", None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemphisError::UnsupportedMessage));
    assert!(broker.dead_letters("plain").is_empty());
}

#[tokio::test]
async fn test_internal_headers_attached() {
    let (broker, client) = setup().await;
    client.station(StationOptions::new("plain")).await.unwrap();
    let producer = client.producer("plain", "writer", false).await.unwrap();

    let mut headers = client.headers();
    headers.add("trace", "t-1").unwrap();
    producer
        .produce(&b"x"[..], Some(headers), ProduceOptions::default().msg_id("m-1"))
        .await
        .unwrap();

    let stored = &broker.stream_messages("plain")[0];
    assert_eq!(stored.headers.get("trace"), Some("t-1"));
    assert_eq!(stored.headers.get("msg-id"), Some("m-1"));
    assert_eq!(stored.headers.get("$memphis_producedBy"), Some("writer"));
    assert_eq!(stored.headers.get("$memphis_connectionId"), Some(client.connection_id()));
}

#[test]
fn test_reserved_headers_rejected() {
    let mut headers = Headers::new();
    let err = headers.add("$memphis_pm_id", "1").unwrap_err();
    assert_eq!(err.to_string(), "Keys in headers should not start with $memphis");
}

#[tokio::test]
async fn test_async_produce() {
    let (broker, client) = setup().await;
    client.station(StationOptions::new("plain")).await.unwrap();
    let producer = client.producer("plain", "p", false).await.unwrap();

    producer
        .produce(&b"fire"[..], None, ProduceOptions::default().async_produce(true))
        .await
        .unwrap();
    assert_eq!(broker.stream_messages("plain").len(), 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_missing_station_is_target_missing() {
    let (broker, client) = setup().await;
    let station = client.station(StationOptions::new("temp")).await.unwrap();
    let producer = client.producer("temp", "p", false).await.unwrap();

    station.destroy().await.unwrap();
    station.destroy().await.unwrap();

    let err = producer
        .produce(&b"x"[..], None, ProduceOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemphisError::TargetMissing));
    assert_eq!(
        err.to_string(),
        "Produce operation has failed, please check whether Station/Producer still exist"
    );
    assert!(!broker.station_exists("temp"));
}

#[tokio::test]
async fn test_station_creation_is_idempotent() {
    let (_broker, client) = setup().await;
    client.station(StationOptions::new("orders")).await.unwrap();
    let again = client.station(StationOptions::new("Orders")).await.unwrap();
    assert_eq!(again.name().internal(), "orders");
}

#[tokio::test]
async fn test_producer_destroy_twice() {
    let (_broker, client) = setup().await;
    let producer = client.producer("orders", "p", false).await.unwrap();
    producer.destroy().await.unwrap();
    producer.destroy().await.unwrap();
}

#[tokio::test]
async fn test_attach_unknown_schema_fails() {
    let (_broker, client) = setup().await;
    client.station(StationOptions::new("orders")).await.unwrap();
    let err = client.attach_schema("ghost", "orders").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_close_disconnects() {
    let (_broker, client) = setup().await;
    client.close().await.unwrap();
    assert!(!client.is_connected());

    let err = client.station(StationOptions::new("orders")).await.unwrap_err();
    assert!(matches!(err, MemphisError::ConnectionDead));
}
