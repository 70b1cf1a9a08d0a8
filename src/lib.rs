//! Memphis Schemaverse Client
//!
//! A producer/consumer client for Memphis stations that enforces the schema
//! attached to each station on the producing side, and routes messages that
//! fail validation to the station's dead-letter subject.
//!
//! ## Features
//!
//! - **Schema Enforcement**: Protobuf, JSON Schema and GraphQL schemas, compiled
//!   once per station and swapped in place when the broker pushes an update
//! - **Dead-Letter Routing**: Rejected messages are recorded with producer
//!   identity, a unique id and the hex-encoded payload
//! - **Merged Consumption**: Pulled stream messages and dead-letter redeliveries
//!   arrive on one typed channel, each with the right kind of acknowledgement
//! - **Pluggable Transport**: NATS/JetStream in production, an in-process
//!   broker for tests
//!
//! ## Architecture
//!
//! ```text
//! Client ──┬── Broker (NatsBroker | MemoryBroker)
//!          ├── SchemaRegistry actor ◄── $memphis_schema_updates_<station>
//!          │        ▲                ◄── $memphis_sdk_configurations_updates
//!          │        │ snapshot
//!          ├── Producer ── validate ──► <station>.final
//!          │                  └─fail──► $memphis-<station>-dls.schema.<id>
//!          └── Consumer ◄── pull <station> durable <group>
//!                       ◄── $memphis_dls_<station>_<group>
//! ```

pub mod broker;
pub mod checksum;
pub mod client;
pub mod compiler;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod headers;
pub mod message;
pub mod payload;
pub mod producer;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod station;

pub use broker::{Broker, MemoryBroker, NatsBroker};
pub use checksum::Checksum;
pub use client::Client;
pub use compiler::StationSchema;
pub use config::{ClientConfig, ConnectionConfig};
pub use consumer::{Consumer, ConsumerEvent, ConsumerOptions, ConsumerState};
pub use dead_letter::DeadLetterRecord;
pub use error::{MemphisError, Result};
pub use headers::Headers;
pub use message::Message;
pub use payload::Payload;
pub use producer::{ProduceOptions, Producer};
pub use registry::{SchemaRegistry, StationView};
pub use schema::{SchemaKind, SchemaMetadata, SchemaVersion};
pub use station::{Station, StationName, StationOptions};
