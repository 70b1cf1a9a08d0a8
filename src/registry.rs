//! Schema registry
//!
//! One entry per station holding the raw [`SchemaMetadata`], its compiled
//! [`StationSchema`] and the number of live producers. The map is owned by a
//! single actor task; producers, schema-update listeners and the cluster
//! configuration listener talk to it over a command channel, so every update
//! (recompilation included) is applied whole and in arrival order.
//!
//! Readers take a [`StationView`] snapshot. The compiled schema sits behind an
//! `Arc`, so a validation in flight keeps the version it started with while
//! the actor swaps in the next one.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, DeliveryStream};
use crate::checksum::Checksum;
use crate::compiler::StationSchema;
use crate::error::{MemphisError, Result};
use crate::payload::Payload;
use crate::protocol::SchemaUpdateNotification;
use crate::schema::SchemaMetadata;
use crate::station::StationName;

/// What a producer needs to know about its station at produce time
#[derive(Debug, Clone)]
pub struct StationView {
    pub schema: Arc<StationSchema>,
    /// Route schema-validation failures to the dead-letter subject
    pub dls_schema_failures: bool,
    /// Publish an operator notification on schema-validation failures
    pub send_notification: bool,
}

impl StationView {
    fn empty() -> Self {
        Self {
            schema: Arc::new(StationSchema::NoSchema),
            dls_schema_failures: false,
            send_notification: false,
        }
    }
}

enum Command {
    RegisterProducer {
        station: StationName,
        initial: Option<SchemaMetadata>,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterProducer {
        station: String,
        reply: oneshot::Sender<()>,
    },
    Apply {
        station: String,
        metadata: SchemaMetadata,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        station: String,
        reply: oneshot::Sender<StationView>,
    },
    SetSchemaDls {
        station: String,
        enabled: bool,
    },
    SetNotifications {
        enabled: bool,
    },
    RemoveStation {
        station: String,
        reply: oneshot::Sender<()>,
    },
    ProducerCount {
        station: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Entry {
    metadata: SchemaMetadata,
    checksum: Checksum,
    schema: Arc<StationSchema>,
    producers: usize,
    listener: CancellationToken,
}

/// Handle to the registry actor
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchemaRegistry {
    /// Start the actor. Must be called inside a tokio runtime.
    pub fn spawn(broker: Arc<dyn Broker>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = RegistryActor {
            broker,
            entries: HashMap::new(),
            schema_dls: HashMap::new(),
            send_notification: false,
            commands: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { commands: tx }
    }

    /// Count a new producer on `station`. The first producer creates the entry,
    /// compiles `initial` and starts listening for schema updates.
    ///
    /// A schema that fails to compile here fails the registration.
    pub async fn register_producer(
        &self,
        station: &StationName,
        initial: Option<SchemaMetadata>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterProducer {
            station: station.clone(),
            initial,
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)?
    }

    /// Release a producer; the last one tears the entry down
    pub async fn unregister_producer(&self, station: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UnregisterProducer {
            station: station.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    /// Replace the station's schema. The drop-signal clears it.
    pub async fn apply_update(&self, station: &str, metadata: SchemaMetadata) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Apply {
            station: station.to_string(),
            metadata,
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    pub async fn snapshot(&self, station: &str) -> Result<StationView> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            station: station.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    /// Validate `payload` against the station's current schema
    pub async fn validate(&self, station: &str, payload: &Payload) -> Result<Bytes> {
        self.snapshot(station).await?.schema.validate(station, payload)
    }

    pub fn set_schema_dls(&self, station: &str, enabled: bool) -> Result<()> {
        self.send(Command::SetSchemaDls {
            station: station.to_string(),
            enabled,
        })
    }

    pub fn set_notifications(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetNotifications { enabled })
    }

    /// Forget a destroyed station, stopping its listener
    pub async fn remove_station(&self, station: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveStation {
            station: station.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    /// Live producers counted for `station`
    pub async fn producer_count(&self, station: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ProducerCount {
            station: station.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    /// Stop every listener and clear the map
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| MemphisError::ConnectionDead)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MemphisError::ConnectionDead)
    }
}

struct RegistryActor {
    broker: Arc<dyn Broker>,
    entries: HashMap<String, Entry>,
    schema_dls: HashMap<String, bool>,
    send_notification: bool,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl RegistryActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::RegisterProducer { station, initial, reply } => {
                    let _ = reply.send(self.register(&station, initial).await);
                }
                Command::UnregisterProducer { station, reply } => {
                    self.unregister(&station);
                    let _ = reply.send(());
                }
                Command::Apply { station, metadata, reply } => {
                    self.apply(&station, metadata);
                    let _ = reply.send(());
                }
                Command::Snapshot { station, reply } => {
                    let _ = reply.send(self.view(&station));
                }
                Command::SetSchemaDls { station, enabled } => {
                    debug!(station = %station, enabled, "schema dead-letter routing updated");
                    self.schema_dls.insert(station, enabled);
                }
                Command::SetNotifications { enabled } => {
                    debug!(enabled, "schema failure notifications updated");
                    self.send_notification = enabled;
                }
                Command::RemoveStation { station, reply } => {
                    if let Some(entry) = self.entries.remove(&station) {
                        entry.listener.cancel();
                    }
                    self.schema_dls.remove(&station);
                    let _ = reply.send(());
                }
                Command::ProducerCount { station, reply } => {
                    let count = self.entries.get(&station).map_or(0, |e| e.producers);
                    let _ = reply.send(count);
                }
                Command::Shutdown { reply } => {
                    for (_, entry) in self.entries.drain() {
                        entry.listener.cancel();
                    }
                    self.schema_dls.clear();
                    let _ = reply.send(());
                }
            }
        }
        for entry in self.entries.values() {
            entry.listener.cancel();
        }
        debug!("schema registry stopped");
    }

    async fn register(&mut self, station: &StationName, initial: Option<SchemaMetadata>) -> Result<()> {
        let key = station.internal();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.producers += 1;
            debug!(station = %station, producers = entry.producers, "producer registered");
            return Ok(());
        }

        let metadata = initial.unwrap_or_else(SchemaMetadata::drop_signal);
        let schema = StationSchema::compile(key, &metadata)?;
        let updates = self
            .broker
            .subscribe(&station.schema_updates_subject())
            .await?;

        let listener = CancellationToken::new();
        tokio::spawn(listen_for_updates(
            key.to_string(),
            updates,
            self.commands.clone(),
            listener.clone(),
        ));

        info!(
            station = %station,
            kind = schema.kind().as_str(),
            version = metadata.version(),
            "station schema registered"
        );
        self.entries.insert(
            key.to_string(),
            Entry {
                checksum: metadata.checksum(),
                metadata,
                schema: Arc::new(schema),
                producers: 1,
                listener,
            },
        );
        Ok(())
    }

    fn unregister(&mut self, station: &str) {
        let Some(entry) = self.entries.get_mut(station) else {
            return;
        };
        entry.producers = entry.producers.saturating_sub(1);
        if entry.producers == 0 {
            if let Some(entry) = self.entries.remove(station) {
                entry.listener.cancel();
            }
            debug!(station = %station, "last producer gone, schema entry removed");
        }
    }

    fn apply(&mut self, station: &str, metadata: SchemaMetadata) {
        let Some(entry) = self.entries.get_mut(station) else {
            debug!(station = %station, "schema update for unregistered station ignored");
            return;
        };

        if metadata.is_drop() {
            entry.metadata = metadata;
            entry.checksum = entry.metadata.checksum();
            entry.schema = Arc::new(StationSchema::NoSchema);
            info!(station = %station, "station schema detached");
            return;
        }

        let checksum = metadata.checksum();
        if entry.metadata.kind == metadata.kind
            && entry.metadata.version() == metadata.version()
            && entry.checksum == checksum
            && !matches!(*entry.schema, StationSchema::Unusable { .. })
        {
            debug!(station = %station, checksum = checksum.short(), "schema unchanged, skipping");
            return;
        }

        let schema = match StationSchema::compile(station, &metadata) {
            Ok(schema) => {
                info!(
                    station = %station,
                    kind = metadata.kind.as_str(),
                    version = metadata.version(),
                    checksum = checksum.short(),
                    "station schema updated"
                );
                schema
            }
            Err(e) => {
                error!(station = %station, error = %e, "schema update failed to compile");
                StationSchema::Unusable { reason: e.to_string() }
            }
        };
        entry.metadata = metadata;
        entry.checksum = checksum;
        entry.schema = Arc::new(schema);
    }

    fn view(&self, station: &str) -> StationView {
        match self.entries.get(station) {
            Some(entry) => StationView {
                schema: entry.schema.clone(),
                dls_schema_failures: self.schema_dls.get(station).copied().unwrap_or(false),
                send_notification: self.send_notification,
            },
            None => StationView {
                dls_schema_failures: self.schema_dls.get(station).copied().unwrap_or(false),
                send_notification: self.send_notification,
                ..StationView::empty()
            },
        }
    }
}

/// Forward schema updates for one station into the actor, one at a time
async fn listen_for_updates(
    station: String,
    mut updates: DeliveryStream,
    commands: mpsc::WeakUnboundedSender<Command>,
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

        let notification: SchemaUpdateNotification = match serde_json::from_slice(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(station = %station, error = %e, "malformed schema update ignored");
                continue;
            }
        };

        let Some(commands) = commands.upgrade() else {
            break;
        };
        let (reply, applied) = oneshot::channel();
        let sent = commands.send(Command::Apply {
            station: station.clone(),
            metadata: notification.init,
            reply,
        });
        drop(commands);
        if sent.is_err() || applied.await.is_err() {
            break;
        }
    }
    debug!(station = %station, "schema update listener stopped");
}
