//! Broker seam
//!
//! Everything the client needs from the broker, expressed as one async trait:
//! core publish/request/subscribe, stream publish with acknowledgement, durable
//! pull consumers and consumer liveness. [`NatsBroker`] talks to a real server;
//! [`MemoryBroker`] is an in-process stand-in used by tests.

mod memory;
mod nats;

pub use memory::{MemoryBroker, StoredMessage};
pub use nats::NatsBroker;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::headers::Headers;

/// Stream of deliveries from one subscription
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Adapt a channel receiver into a delivery stream
pub(crate) fn receiver_stream(rx: mpsc::UnboundedReceiver<Delivery>) -> DeliveryStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|delivery| (delivery, rx))
    })
    .boxed()
}

/// One item delivered by a subscription
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Stream sequence; 0 for core (non-stream) deliveries
    pub sequence: u64,
    /// Number of times the broker has delivered this message
    pub delivered: u64,
    /// Native acknowledgement, present only for stream deliveries
    pub acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// A core delivery: no stream position, no native ack
    pub fn core(subject: impl Into<String>, payload: Bytes, headers: Headers) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            sequence: 0,
            delivered: 1,
            acker: None,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("len", &self.payload.len())
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .field("ackable", &self.acker.is_some())
            .finish()
    }
}

/// Native acknowledgement of a stream delivery
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Issues pull requests against a durable consumer
#[async_trait]
pub trait Puller: Send + Sync {
    /// Request up to `batch` messages, expiring after `expires`.
    ///
    /// Returns once the request is issued; messages arrive on the binding's
    /// delivery stream.
    async fn pull(&self, batch: usize, expires: Duration) -> Result<()>;
}

/// A bound durable pull consumer
pub struct PullBinding {
    pub puller: Box<dyn Puller>,
    pub messages: DeliveryStream,
}

#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Core publish; no acknowledgement
    async fn publish(&self, subject: &str, headers: Option<&Headers>, payload: Bytes) -> Result<()>;

    /// Request/reply; returns the reply body
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes>;

    async fn subscribe(&self, subject: &str) -> Result<DeliveryStream>;

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<DeliveryStream>;

    /// Publish into a stream and wait up to `ack_wait` for the acknowledgement.
    /// Returns the stream sequence.
    async fn stream_publish(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        ack_wait: Duration,
    ) -> Result<u64>;

    /// Publish into a stream without waiting for the acknowledgement.
    /// Late acknowledgement failures are logged, never returned.
    async fn stream_publish_detached(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        ack_wait: Duration,
    ) -> Result<()>;

    /// Bind to an existing durable pull consumer on `stream`
    async fn pull_subscribe(&self, stream: &str, durable: &str) -> Result<PullBinding>;

    /// Fails when the stream or the durable consumer no longer exists
    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<()>;

    /// Whether control-plane calls can currently be made
    fn is_connected(&self) -> bool;

    /// Whether the connection was closed for good
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
