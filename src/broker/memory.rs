//! In-process broker
//!
//! Emulates the parts of the server the client depends on: the control plane
//! (station, producer and consumer bookkeeping, schema attachment with update
//! fan-out), station streams with durable group cursors, core subscriptions
//! with queue groups, and dead-letter storage. Used by the test suites and by
//! anyone who wants to drive the client without a server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{receiver_stream, Acker, Broker, Delivery, DeliveryStream, PullBinding, Puller};
use crate::error::{MemphisError, Result};
use crate::headers::{Headers, PM_ID, PM_SEQUENCE};
use crate::protocol::{
    AttachSchemaRequest, CreateConsumerRequest, CreateProducerRequest, CreateProducerResponse,
    CreateStationRequest, DestroyConsumerRequest, DestroyProducerRequest, DestroyStationRequest,
    DetachSchemaRequest, PmAck, SchemaUpdateNotification, SdkConfigUpdate, CONSUMER_CREATIONS,
    CONSUMER_DESTRUCTIONS, PM_ACKS, PRODUCER_CREATIONS, PRODUCER_DESTRUCTIONS, SCHEMA_ATTACHMENTS,
    SCHEMA_DETACHMENTS, SDK_CONFIG_UPDATES, STATION_CREATIONS, STATION_DESTRUCTIONS,
};
use crate::schema::SchemaMetadata;
use crate::station::{internal_name, StationName};

/// A message as stored or observed by the in-process broker
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Stream sequence; 0 for core publishes
    pub sequence: u64,
}

struct Subscriber {
    subject: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next undelivered stream message
    cursor: usize,
    members: HashSet<String>,
    acked: Vec<u64>,
}

struct StationState {
    schema: Option<String>,
    schemaverse_to_dls: bool,
    producers: HashSet<String>,
    groups: HashMap<String, GroupState>,
    messages: Vec<StoredMessage>,
    dead_letters: Vec<StoredMessage>,
}

impl StationState {
    fn new(schema: Option<String>, schemaverse_to_dls: bool) -> Self {
        Self {
            schema,
            schemaverse_to_dls,
            producers: HashSet::new(),
            groups: HashMap::new(),
            messages: Vec::new(),
            dead_letters: Vec::new(),
        }
    }
}

struct MemoryState {
    connected: bool,
    closed: bool,
    stations: HashMap<String, StationState>,
    schemas: HashMap<String, SchemaMetadata>,
    subscribers: Vec<Subscriber>,
    queue_turns: HashMap<(String, String), usize>,
    published: Vec<StoredMessage>,
    pm_acks: Vec<PmAck>,
    send_notification: bool,
}

/// Broker living entirely in this process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("connected", &state.connected)
            .field("stations", &state.stations.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                connected: true,
                closed: false,
                stations: HashMap::new(),
                schemas: HashMap::new(),
                subscribers: Vec::new(),
                queue_turns: HashMap::new(),
                published: Vec::new(),
                pm_acks: Vec::new(),
                send_notification: false,
            })),
        }
    }

    /// Make a schema known so stations can attach it by name
    pub fn register_schema(&self, name: &str, metadata: SchemaMetadata) {
        self.state.lock().schemas.insert(name.to_string(), metadata);
    }

    /// Push a schema update to the station's listeners without touching the
    /// station's attachment
    pub fn push_schema_update(&self, station: &str, metadata: SchemaMetadata) {
        let subject = StationName::new(station).schema_updates_subject();
        let body = encode(&SchemaUpdateNotification { init: metadata });
        self.state.lock().fan_out(&subject, &Headers::new(), body);
    }

    /// Toggle dead-letter routing of schema failures, announcing it to clients
    pub fn set_schemaverse_to_dls(&self, station: &str, enabled: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state.stations.get_mut(&internal_name(station)) {
            entry.schemaverse_to_dls = enabled;
        }
        let body = encode(&SdkConfigUpdate {
            kind: "schemaverse_to_dls".to_string(),
            update: enabled,
            station_name: station.to_string(),
        });
        state.fan_out(SDK_CONFIG_UPDATES, &Headers::new(), body);
    }

    /// Toggle schema-failure notifications, announcing it to clients
    pub fn set_send_notification(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.send_notification = enabled;
        let body = encode(&SdkConfigUpdate {
            kind: "send_notification".to_string(),
            update: enabled,
            station_name: String::new(),
        });
        state.fan_out(SDK_CONFIG_UPDATES, &Headers::new(), body);
    }

    /// Redeliver a payload on a consumer group's dead-letter subject
    pub fn inject_dead_letter(&self, station: &str, group: &str, payload: &[u8], pm_id: &str, pm_sequence: u64) {
        let subject = StationName::new(station).dls_subject(group);
        let mut headers = Headers::new();
        headers.push(PM_ID, pm_id);
        headers.push(PM_SEQUENCE, pm_sequence.to_string());
        self.state
            .lock()
            .fan_out(&subject, &headers, Bytes::copy_from_slice(payload));
    }

    pub fn station_exists(&self, station: &str) -> bool {
        self.state.lock().stations.contains_key(&internal_name(station))
    }

    /// Messages stored on the station's primary stream
    pub fn stream_messages(&self, station: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .stations
            .get(&internal_name(station))
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Dead letters recorded for the station
    pub fn dead_letters(&self, station: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .stations
            .get(&internal_name(station))
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Core publishes whose subject starts with `prefix`
    pub fn published(&self, prefix: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.subject.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn pm_acks(&self) -> Vec<PmAck> {
        self.state.lock().pm_acks.clone()
    }

    /// Stream sequences natively acked by a consumer group
    pub fn acked(&self, station: &str, group: &str) -> Vec<u64> {
        self.state
            .lock()
            .stations
            .get(&internal_name(station))
            .and_then(|s| s.groups.get(&internal_name(group)))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    pub fn has_consumer_group(&self, station: &str, group: &str) -> bool {
        self.state
            .lock()
            .stations
            .get(&internal_name(station))
            .is_some_and(|s| s.groups.contains_key(&internal_name(group)))
    }

    /// Drop a consumer group behind the client's back
    pub fn remove_consumer_group(&self, station: &str, group: &str) {
        if let Some(entry) = self.state.lock().stations.get_mut(&internal_name(station)) {
            entry.groups.remove(&internal_name(group));
        }
    }

    /// Simulate a lost connection; control-plane calls fail until reconnect
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.connected = true;
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(MemphisError::ConnectionDead)
        }
    }

    fn subscribe_inner(&self, subject: &str, queue: Option<&str>) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(MemphisError::ConnectionDead);
        }
        state.subscribers.push(Subscriber {
            subject: subject.to_string(),
            queue: queue.map(str::to_string),
            tx,
        });
        Ok(receiver_stream(rx))
    }

    fn store(&self, subject: &str, headers: &Headers, payload: Bytes) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(MemphisError::ConnectionDead);
        }

        if let Some(station) = subject.strip_suffix(".final") {
            let entry = state
                .stations
                .get_mut(station)
                .ok_or_else(|| MemphisError::NoResponders(subject.to_string()))?;
            let sequence = entry.messages.len() as u64 + 1;
            entry.messages.push(StoredMessage {
                subject: subject.to_string(),
                payload,
                headers: headers.clone(),
                sequence,
            });
            return Ok(sequence);
        }

        let dead_letter_station = subject
            .strip_prefix("$memphis-")
            .and_then(|rest| rest.split_once("-dls."))
            .map(|(station, _)| station.to_string());
        if let Some(station) = dead_letter_station {
            let entry = state
                .stations
                .get_mut(&station)
                .ok_or_else(|| MemphisError::NoResponders(subject.to_string()))?;
            let sequence = entry.dead_letters.len() as u64 + 1;
            entry.dead_letters.push(StoredMessage {
                subject: subject.to_string(),
                payload,
                headers: headers.clone(),
                sequence,
            });
            return Ok(sequence);
        }

        Err(MemphisError::NoResponders(subject.to_string()))
    }
}

impl MemoryState {
    /// Deliver to every plain subscriber and one member per queue group
    fn fan_out(&mut self, subject: &str, headers: &Headers, payload: Bytes) {
        self.subscribers.retain(|s| !s.tx.is_closed());

        let mut queues: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            if subscriber.subject != subject {
                continue;
            }
            match &subscriber.queue {
                None => {
                    let _ = subscriber
                        .tx
                        .send(Delivery::core(subject, payload.clone(), headers.clone()));
                }
                Some(queue) => queues.entry(queue.clone()).or_default().push(index),
            }
        }

        for (queue, members) in queues {
            let turn = self.queue_turns.entry((subject.to_string(), queue)).or_insert(0);
            let picked = members[*turn % members.len()];
            *turn += 1;
            let _ = self.subscribers[picked]
                .tx
                .send(Delivery::core(subject, payload.clone(), headers.clone()));
        }
    }

    fn handle_request(&mut self, subject: &str, body: &[u8]) -> Result<String> {
        match subject {
            STATION_CREATIONS => {
                let req: CreateStationRequest = serde_json::from_slice(body)?;
                let key = internal_name(&req.name);
                if self.stations.contains_key(&key) {
                    return Ok(format!("Station {} already exists", req.name));
                }
                let schema = Some(req.schema_name.clone()).filter(|s| !s.is_empty());
                self.stations
                    .insert(key, StationState::new(schema, req.dls_configuration.schemaverse));
                Ok(String::new())
            }
            STATION_DESTRUCTIONS => {
                let req: DestroyStationRequest = serde_json::from_slice(body)?;
                match self.stations.remove(&internal_name(&req.station_name)) {
                    Some(_) => Ok(String::new()),
                    None => Ok(format!("Station {} does not exist", req.station_name)),
                }
            }
            PRODUCER_CREATIONS => {
                let req: CreateProducerRequest = serde_json::from_slice(body)?;
                let entry = self
                    .stations
                    .entry(internal_name(&req.station_name))
                    .or_insert_with(|| StationState::new(None, true));
                entry.producers.insert(req.name);
                let response = CreateProducerResponse {
                    error: String::new(),
                    schema_update: entry
                        .schema
                        .as_ref()
                        .and_then(|name| self.schemas.get(name).cloned()),
                    schemaverse_to_dls: entry.schemaverse_to_dls,
                    send_notification: self.send_notification,
                };
                Ok(serde_json::to_string(&response)?)
            }
            PRODUCER_DESTRUCTIONS => {
                let req: DestroyProducerRequest = serde_json::from_slice(body)?;
                let removed = self
                    .stations
                    .get_mut(&internal_name(&req.station_name))
                    .is_some_and(|s| s.producers.remove(&req.name));
                if removed {
                    Ok(String::new())
                } else {
                    Ok(format!(
                        "Producer {} at station {} does not exist",
                        req.name, req.station_name
                    ))
                }
            }
            CONSUMER_CREATIONS => {
                let req: CreateConsumerRequest = serde_json::from_slice(body)?;
                let entry = self
                    .stations
                    .entry(internal_name(&req.station_name))
                    .or_insert_with(|| StationState::new(None, true));
                let available = entry.messages.len();
                let group = entry
                    .groups
                    .entry(internal_name(&req.consumers_group))
                    .or_insert_with(|| GroupState {
                        cursor: if req.last_messages >= 0 {
                            available.saturating_sub(req.last_messages as usize)
                        } else {
                            (req.start_consume_from_sequence.max(1) - 1) as usize
                        },
                        ..GroupState::default()
                    });
                group.members.insert(req.name);
                Ok(String::new())
            }
            CONSUMER_DESTRUCTIONS => {
                let req: DestroyConsumerRequest = serde_json::from_slice(body)?;
                let station = self.stations.get_mut(&internal_name(&req.station_name));
                let removed = station.is_some_and(|s| {
                    let found = s.groups.values_mut().any(|g| g.members.remove(&req.name));
                    s.groups.retain(|_, g| !g.members.is_empty());
                    found
                });
                if removed {
                    Ok(String::new())
                } else {
                    Ok(format!(
                        "Consumer {} at station {} does not exist",
                        req.name, req.station_name
                    ))
                }
            }
            SCHEMA_ATTACHMENTS => {
                let req: AttachSchemaRequest = serde_json::from_slice(body)?;
                let Some(metadata) = self.schemas.get(&req.name).cloned() else {
                    return Ok(format!("Schema {} does not exist", req.name));
                };
                let station = StationName::new(&req.station_name);
                let Some(entry) = self.stations.get_mut(station.internal()) else {
                    return Ok(format!("Station {} does not exist", req.station_name));
                };
                entry.schema = Some(req.name);
                let body = encode(&SchemaUpdateNotification { init: metadata });
                self.fan_out(&station.schema_updates_subject(), &Headers::new(), body);
                Ok(String::new())
            }
            SCHEMA_DETACHMENTS => {
                let req: DetachSchemaRequest = serde_json::from_slice(body)?;
                let station = StationName::new(&req.station_name);
                let Some(entry) = self.stations.get_mut(station.internal()) else {
                    return Ok(format!("Station {} does not exist", req.station_name));
                };
                entry.schema = None;
                let body = encode(&SchemaUpdateNotification {
                    init: SchemaMetadata::drop_signal(),
                });
                self.fan_out(&station.schema_updates_subject(), &Headers::new(), body);
                Ok(String::new())
            }
            other => Err(MemphisError::NoResponders(other.to_string())),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}

struct MemoryPuller {
    state: Arc<Mutex<MemoryState>>,
    station: String,
    group: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl Puller for MemoryPuller {
    async fn pull(&self, batch: usize, _expires: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(MemphisError::ConnectionDead);
        }
        let entry = state
            .stations
            .get_mut(&self.station)
            .ok_or_else(|| MemphisError::broker("stream not found"))?;
        let group = entry
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| MemphisError::broker("consumer not found"))?;

        // cursor may point past the stream end for a future start sequence
        let len = entry.messages.len();
        if group.cursor >= len {
            return Ok(());
        }
        let end = (group.cursor + batch).min(len);
        for message in &entry.messages[group.cursor..end] {
            let delivery = Delivery {
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                sequence: message.sequence,
                delivered: 1,
                acker: Some(Box::new(MemoryAcker {
                    state: self.state.clone(),
                    station: self.station.clone(),
                    group: self.group.clone(),
                    sequence: message.sequence,
                })),
            };
            if self.tx.send(delivery).is_err() {
                break;
            }
        }
        group.cursor = group.cursor.max(end);
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<MemoryState>>,
    station: String,
    group: String,
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.state.lock();
        let group = state
            .stations
            .get_mut(&self.station)
            .and_then(|s| s.groups.get_mut(&self.group))
            .ok_or_else(|| MemphisError::broker("consumer not found"))?;
        group.acked.push(self.sequence);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, headers: Option<&Headers>, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(MemphisError::ConnectionDead);
        }
        let headers = headers.cloned().unwrap_or_default();
        if subject == PM_ACKS {
            match serde_json::from_slice::<PmAck>(&payload) {
                Ok(ack) => state.pm_acks.push(ack),
                Err(e) => warn!(error = %e, "malformed pm ack"),
            }
        }
        state.published.push(StoredMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
            sequence: 0,
        });
        state.fan_out(subject, &headers, payload);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes> {
        self.ensure_connected()?;
        let reply = self.state.lock().handle_request(subject, &payload)?;
        debug!(subject, reply = %reply, "control request handled");
        Ok(Bytes::from(reply))
    }

    async fn subscribe(&self, subject: &str) -> Result<DeliveryStream> {
        self.subscribe_inner(subject, None)
    }

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<DeliveryStream> {
        self.subscribe_inner(subject, Some(queue))
    }

    async fn stream_publish(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        _ack_wait: Duration,
    ) -> Result<u64> {
        self.store(subject, headers, payload)
    }

    async fn stream_publish_detached(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        _ack_wait: Duration,
    ) -> Result<()> {
        if let Err(e) = self.store(subject, headers, payload) {
            warn!(subject, error = %e, "detached publish failed");
        }
        Ok(())
    }

    async fn pull_subscribe(&self, stream: &str, durable: &str) -> Result<PullBinding> {
        self.consumer_info(stream, durable).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(PullBinding {
            puller: Box::new(MemoryPuller {
                state: self.state.clone(),
                station: stream.to_string(),
                group: durable.to_string(),
                tx,
            }),
            messages: receiver_stream(rx),
        })
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<()> {
        let state = self.state.lock();
        if !state.connected {
            return Err(MemphisError::ConnectionDead);
        }
        let exists = state
            .stations
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(durable));
        if exists {
            Ok(())
        } else {
            Err(MemphisError::broker("consumer not found"))
        }
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.connected && !state.closed
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.connected = false;
        state.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn station_request(name: &str) -> Bytes {
        encode(&CreateStationRequest {
            name: name.to_string(),
            retention_type: "message_age_sec".to_string(),
            retention_value: 604_800,
            storage_type: "file".to_string(),
            replicas: 1,
            idempotency_window_in_ms: 120_000,
            schema_name: String::new(),
            dls_configuration: crate::protocol::DlsConfiguration { poison: true, schemaverse: true },
            username: "root".to_string(),
        })
    }

    #[tokio::test]
    async fn test_station_creation_is_idempotent_by_reply() {
        let broker = MemoryBroker::new();
        let first = broker.request(STATION_CREATIONS, station_request("Orders")).await.unwrap();
        assert!(first.is_empty());
        let second = broker.request(STATION_CREATIONS, station_request("orders")).await.unwrap();
        assert!(String::from_utf8_lossy(&second).contains("already exists"));
    }

    #[tokio::test]
    async fn test_unknown_subject_has_no_responders() {
        let broker = MemoryBroker::new();
        let err = broker.request("$memphis_unknown", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, MemphisError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let broker = MemoryBroker::new();
        let mut a = broker.queue_subscribe("jobs", "workers").await.unwrap();
        let mut b = broker.queue_subscribe("jobs", "workers").await.unwrap();

        for i in 0..4u8 {
            broker.publish("jobs", None, Bytes::from(vec![i])).await.unwrap();
        }

        let first = a.next().await.unwrap();
        let second = b.next().await.unwrap();
        assert_eq!(&first.payload[..], &[0]);
        assert_eq!(&second.payload[..], &[1]);
    }

    #[tokio::test]
    async fn test_stream_publish_requires_station() {
        let broker = MemoryBroker::new();
        let err = broker
            .stream_publish("ghost.final", &Headers::new(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemphisError::NoResponders(_)));

        broker.request(STATION_CREATIONS, station_request("orders")).await.unwrap();
        let seq = broker
            .stream_publish("orders.final", &Headers::new(), Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(broker.stream_messages("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_pull_delivers_after_cursor() {
        let broker = MemoryBroker::new();
        broker.request(STATION_CREATIONS, station_request("orders")).await.unwrap();
        for i in 0..3u8 {
            broker
                .stream_publish("orders.final", &Headers::new(), Bytes::from(vec![i]), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let consumer = encode(&CreateConsumerRequest {
            name: "c1".to_string(),
            station_name: "orders".to_string(),
            connection_id: "conn".to_string(),
            consumer_type: "application".to_string(),
            consumers_group: "g1".to_string(),
            max_ack_time_ms: 30_000,
            max_msg_deliveries: 10,
            start_consume_from_sequence: 2,
            last_messages: -1,
            req_version: 1,
            username: "root".to_string(),
        });
        broker.request(CONSUMER_CREATIONS, consumer).await.unwrap();

        let mut binding = broker.pull_subscribe("orders", "g1").await.unwrap();
        binding.puller.pull(10, Duration::from_secs(1)).await.unwrap();

        let delivery = binding.messages.next().await.unwrap();
        assert_eq!(delivery.sequence, 2);
        delivery.acker.unwrap().ack().await.unwrap();
        assert_eq!(broker.acked("orders", "g1"), vec![2]);
    }

    #[tokio::test]
    async fn test_pull_waits_for_future_start_sequence() {
        let broker = MemoryBroker::new();
        broker.request(STATION_CREATIONS, station_request("orders")).await.unwrap();
        let publish = |i: u8| {
            let broker = broker.clone();
            async move {
                broker
                    .stream_publish("orders.final", &Headers::new(), Bytes::from(vec![i]), Duration::from_secs(1))
                    .await
                    .unwrap()
            }
        };
        publish(1).await;
        publish(2).await;

        let consumer = encode(&CreateConsumerRequest {
            name: "c1".to_string(),
            station_name: "orders".to_string(),
            connection_id: "conn".to_string(),
            consumer_type: "application".to_string(),
            consumers_group: "g1".to_string(),
            max_ack_time_ms: 30_000,
            max_msg_deliveries: 10,
            start_consume_from_sequence: 5,
            last_messages: -1,
            req_version: 1,
            username: "root".to_string(),
        });
        broker.request(CONSUMER_CREATIONS, consumer).await.unwrap();

        let mut binding = broker.pull_subscribe("orders", "g1").await.unwrap();
        binding.puller.pull(10, Duration::from_secs(1)).await.unwrap();

        for i in 3..=6 {
            publish(i).await;
        }
        binding.puller.pull(10, Duration::from_secs(1)).await.unwrap();

        let first = binding.messages.next().await.unwrap();
        let second = binding.messages.next().await.unwrap();
        assert_eq!(first.sequence, 5);
        assert_eq!(second.sequence, 6);
    }
}
