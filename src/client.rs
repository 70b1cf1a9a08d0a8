//! Client handle
//!
//! [`Client`] owns the broker connection, the schema registry actor and the
//! cluster-configuration listener. It is cheap to clone; every station,
//! producer and consumer created from it holds a clone.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, DeliveryStream, NatsBroker};
use crate::config::ConnectionConfig;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::{MemphisError, Result};
use crate::headers::Headers;
use crate::producer::Producer;
use crate::protocol::{
    AttachSchemaRequest, CreateConsumerRequest, CreateProducerRequest, CreateProducerResponse,
    CreateStationRequest, DetachSchemaRequest, DlsConfiguration, SdkConfigUpdate,
    CONSUMER_CREATIONS, PRODUCER_CREATIONS, SCHEMA_ATTACHMENTS, SCHEMA_DETACHMENTS,
    SDK_CONFIG_UPDATES, STATION_CREATIONS,
};
use crate::registry::SchemaRegistry;
use crate::station::{internal_name, Station, StationName, StationOptions};

const REQ_VERSION: u32 = 1;

/// Connected client
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    broker: Arc<dyn Broker>,
    registry: SchemaRegistry,
    connection_id: String,
    username: String,
    config_listener: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.config_listener.cancel();
    }
}

impl Client {
    /// Connect to the broker described by `config`
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(MemphisError::Config("host is required".to_string()));
        }
        if config.username.is_empty() {
            return Err(MemphisError::Config("username is required".to_string()));
        }
        config.tls()?;

        let connection_id = generate_connection_id();
        let connection_name = format!("{}::{}", connection_id, config.username);
        let broker = NatsBroker::connect(&config, &connection_name).await?;
        Self::start(Arc::new(broker), connection_id, config.username).await
    }

    /// Build a client on an already established broker handle
    pub async fn with_broker(broker: Arc<dyn Broker>, username: impl Into<String>) -> Result<Self> {
        Self::start(broker, generate_connection_id(), username.into()).await
    }

    async fn start(broker: Arc<dyn Broker>, connection_id: String, username: String) -> Result<Self> {
        let registry = SchemaRegistry::spawn(broker.clone());
        let updates = broker.subscribe(SDK_CONFIG_UPDATES).await?;
        let config_listener = CancellationToken::new();
        tokio::spawn(listen_for_config_updates(
            updates,
            registry.clone(),
            config_listener.clone(),
        ));

        debug!(connection_id = %connection_id, username = %username, "client started");
        Ok(Self {
            inner: Arc::new(ClientInner {
                broker,
                registry,
                connection_id,
                username,
                config_listener,
            }),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn is_connected(&self) -> bool {
        self.inner.broker.is_connected()
    }

    /// Empty header set for use with [`Producer::produce`]
    pub fn headers(&self) -> Headers {
        Headers::new()
    }

    /// Create a station. A station that already exists is returned as-is.
    pub async fn station(&self, options: StationOptions) -> Result<Station> {
        if options.name.is_empty() {
            return Err(MemphisError::Config("station name is required".to_string()));
        }

        let request = CreateStationRequest {
            name: options.name.to_lowercase(),
            retention_type: options.retention_type.as_str().to_string(),
            retention_value: options.retention_value,
            storage_type: options.storage_type.as_str().to_string(),
            replicas: options.replicas,
            idempotency_window_in_ms: options.idempotency_window_ms,
            schema_name: options.schema_name.clone(),
            dls_configuration: DlsConfiguration {
                poison: options.send_poison_msg_to_dls,
                schemaverse: options.send_schema_failed_msg_to_dls,
            },
            username: self.username().to_string(),
        };

        match self.control_request(STATION_CREATIONS, &request).await {
            Ok(()) => info!(station = %options.name, "station created"),
            Err(MemphisError::Broker(msg)) if msg.contains("already exists") => {
                debug!(station = %options.name, "station already exists");
            }
            Err(e) => return Err(e),
        }
        Ok(Station::new(self.clone(), &options.name))
    }

    /// Attach the named schema to a station
    pub async fn attach_schema(&self, name: &str, station: &str) -> Result<()> {
        if name.is_empty() {
            return Err(MemphisError::Config("name can not be empty".to_string()));
        }
        if station.is_empty() {
            return Err(MemphisError::Config("station name can not be empty".to_string()));
        }
        let request = AttachSchemaRequest {
            name: name.to_string(),
            station_name: station.to_lowercase(),
            username: self.username().to_string(),
        };
        self.control_request(SCHEMA_ATTACHMENTS, &request).await?;
        info!(schema = name, station, "schema attached");
        Ok(())
    }

    /// Detach whatever schema the station has
    pub async fn detach_schema(&self, station: &str) -> Result<()> {
        if station.is_empty() {
            return Err(MemphisError::Config("station name can not be empty".to_string()));
        }
        let request = DetachSchemaRequest {
            station_name: station.to_lowercase(),
            username: self.username().to_string(),
        };
        self.control_request(SCHEMA_DETACHMENTS, &request).await?;
        info!(station, "schema detached");
        Ok(())
    }

    /// Create a producer on `station`
    pub async fn producer(&self, station: &str, name: &str, gen_unique_suffix: bool) -> Result<Producer> {
        if station.is_empty() {
            return Err(MemphisError::Config("station name is required".to_string()));
        }
        if name.is_empty() {
            return Err(MemphisError::Config("producer name is required".to_string()));
        }

        let name = unique_name(name, gen_unique_suffix);
        let station_name = StationName::new(station);
        let request = CreateProducerRequest {
            name: name.clone(),
            station_name: station_name.as_str().to_string(),
            connection_id: self.connection_id().to_string(),
            producer_type: "application".to_string(),
            req_version: REQ_VERSION,
            username: self.username().to_string(),
        };

        let reply = self.control_reply(PRODUCER_CREATIONS, &request).await?;
        let response = parse_producer_reply(&reply)?;

        self.inner
            .registry
            .register_producer(&station_name, response.schema_update)
            .await?;
        self.inner
            .registry
            .set_schema_dls(station_name.internal(), response.schemaverse_to_dls)?;
        self.inner.registry.set_notifications(response.send_notification)?;

        info!(station = %station_name, producer = %name, "producer created");
        Ok(Producer::new(self.clone(), station_name, name))
    }

    /// Create a consumer. Options are validated before the broker is contacted.
    pub async fn consumer(&self, options: ConsumerOptions) -> Result<Consumer> {
        options.validate()?;

        let mut options = options;
        options.consumer_name = unique_name(&options.consumer_name, options.gen_unique_suffix);
        if options.consumer_group.is_empty() {
            options.consumer_group = options.consumer_name.clone();
        }

        let station = StationName::new(&options.station_name);
        let request = CreateConsumerRequest {
            name: options.consumer_name.clone(),
            station_name: station.as_str().to_string(),
            connection_id: self.connection_id().to_string(),
            consumer_type: "application".to_string(),
            consumers_group: options.consumer_group.clone(),
            max_ack_time_ms: millis(options.max_ack_time),
            max_msg_deliveries: options.max_msg_deliveries,
            start_consume_from_sequence: options.start_consume_from_sequence,
            last_messages: options.last_messages,
            req_version: REQ_VERSION,
            username: self.username().to_string(),
        };
        self.control_request(CONSUMER_CREATIONS, &request).await?;

        info!(
            station = %station,
            consumer = %options.consumer_name,
            group = %options.consumer_group,
            "consumer created"
        );
        Ok(Consumer::new(self.clone(), station, options))
    }

    /// Stop the listeners, clear the registry and close the connection
    pub async fn close(&self) -> Result<()> {
        self.inner.config_listener.cancel();
        if let Err(e) = self.inner.registry.shutdown().await {
            debug!(error = %e, "registry already stopped");
        }
        self.inner.broker.close().await?;
        info!(connection_id = %self.connection_id(), "client closed");
        Ok(())
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub(crate) fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.broker.is_connected() {
            Ok(())
        } else {
            Err(MemphisError::ConnectionDead)
        }
    }

    /// Control-plane request whose reply is empty on success, error text otherwise
    pub(crate) async fn control_request<T: Serialize>(&self, subject: &str, body: &T) -> Result<()> {
        let reply = self.control_reply(subject, body).await?;
        if reply.is_empty() {
            Ok(())
        } else {
            Err(MemphisError::broker(String::from_utf8_lossy(&reply)))
        }
    }

    async fn control_reply<T: Serialize>(&self, subject: &str, body: &T) -> Result<bytes::Bytes> {
        self.ensure_connected()?;
        let payload = serde_json::to_vec(body)?;
        self.inner.broker.request(subject, payload.into()).await
    }
}

/// Producer creation replies with JSON; older servers reply with bare error text
fn parse_producer_reply(reply: &[u8]) -> Result<CreateProducerResponse> {
    if reply.is_empty() {
        return Ok(CreateProducerResponse::default());
    }
    match serde_json::from_slice::<CreateProducerResponse>(reply) {
        Ok(response) if response.error.is_empty() => Ok(response),
        Ok(response) => Err(MemphisError::broker(response.error)),
        Err(_) => Err(MemphisError::broker(String::from_utf8_lossy(reply))),
    }
}

async fn listen_for_config_updates(
    mut updates: DeliveryStream,
    registry: SchemaRegistry,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = updates.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let update: SdkConfigUpdate = match serde_json::from_slice(&delivery.payload) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "malformed configuration update ignored");
                continue;
            }
        };

        let applied = match update.kind.as_str() {
            "send_notification" => registry.set_notifications(update.update),
            "schemaverse_to_dls" => {
                registry.set_schema_dls(&internal_name(&update.station_name), update.update)
            }
            other => {
                debug!(kind = other, "unknown configuration update ignored");
                Ok(())
            }
        };
        if applied.is_err() {
            break;
        }
    }
    debug!("configuration listener stopped");
}

fn generate_connection_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn unique_name(name: &str, gen_unique_suffix: bool) -> String {
    let name = name.to_lowercase();
    if gen_unique_suffix {
        format!("{}_{}", name, hex::encode(rand::random::<[u8; 4]>()))
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_shape() {
        let id = generate_connection_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_connection_id());
    }

    #[test]
    fn test_unique_suffix() {
        assert_eq!(unique_name("Orders-Writer", false), "orders-writer");
        let name = unique_name("writer", true);
        let (base, suffix) = name.split_once('_').unwrap();
        assert_eq!(base, "writer");
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_producer_reply_parsing() {
        assert!(parse_producer_reply(b"").unwrap().schema_update.is_none());

        let ok = parse_producer_reply(br#"{"error":"","schemaverse_to_dls":true}"#).unwrap();
        assert!(ok.schemaverse_to_dls);

        let err = parse_producer_reply(br#"{"error":"nats: station is missing"}"#).unwrap_err();
        assert_eq!(err.to_string(), "memphis: station is missing");

        let legacy = parse_producer_reply(b"Producer name is not valid").unwrap_err();
        assert!(matches!(legacy, MemphisError::Broker(_)));
    }

    #[tokio::test]
    async fn test_empty_names_are_config_errors() {
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        let client = Client::with_broker(broker, "root").await.unwrap();

        assert!(matches!(client.attach_schema("", "orders").await, Err(MemphisError::Config(_))));
        assert!(matches!(client.detach_schema("").await, Err(MemphisError::Config(_))));
        assert!(matches!(client.producer("orders", "", false).await, Err(MemphisError::Config(_))));
    }

    #[tokio::test]
    async fn test_dead_connection_fails_fast() {
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        let client = Client::with_broker(broker.clone(), "root").await.unwrap();
        broker.disconnect();

        let err = client.station(StationOptions::new("orders")).await.unwrap_err();
        assert!(matches!(err, MemphisError::ConnectionDead));
    }
}
