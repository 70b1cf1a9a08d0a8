//! Consumed messages

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::broker::{Acker, Broker, Delivery};
use crate::error::Result;
use crate::headers::{Headers, PM_ID, PM_SEQUENCE};
use crate::protocol::{PmAck, PM_ACKS};

enum Origin {
    /// Pulled from the station stream; acked natively
    Primary(Option<Box<dyn Acker>>),
    /// Redelivered from the dead-letter station; acked with a pseudo-ack
    DeadLetter,
}

/// A message delivered to a consumer
pub struct Message {
    data: Bytes,
    headers: Headers,
    sequence: u64,
    delivered: u64,
    origin: Origin,
    acked: AtomicBool,
    broker: Arc<dyn Broker>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.data.len())
            .field("sequence", &self.sequence_number())
            .field("delivered", &self.delivered)
            .field("dead_letter", &self.is_dead_letter())
            .finish()
    }
}

impl Message {
    pub(crate) fn primary(delivery: Delivery, broker: Arc<dyn Broker>) -> Self {
        Self {
            data: delivery.payload,
            headers: delivery.headers,
            sequence: delivery.sequence,
            delivered: delivery.delivered,
            origin: Origin::Primary(delivery.acker),
            acked: AtomicBool::new(false),
            broker,
        }
    }

    pub(crate) fn dead_letter(delivery: Delivery, broker: Arc<dyn Broker>) -> Self {
        Self {
            data: delivery.payload,
            headers: delivery.headers,
            sequence: delivery.sequence,
            delivered: delivery.delivered,
            origin: Origin::DeadLetter,
            acked: AtomicBool::new(false),
            broker,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Application headers; internal `$memphis` keys are filtered out
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.headers.application_view()
    }

    /// Stream sequence. Dead-letter redeliveries report the original sequence.
    pub fn sequence_number(&self) -> u64 {
        match self.origin {
            Origin::Primary(_) => self.sequence,
            Origin::DeadLetter => self
                .headers
                .get(PM_SEQUENCE)
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.sequence),
        }
    }

    /// How many times the broker has delivered this message
    pub fn delivery_count(&self) -> u64 {
        self.delivered
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self.origin, Origin::DeadLetter)
    }

    /// Acknowledge the message. Acking twice is a no-op; a failed ack may be retried.
    pub async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = match &self.origin {
            Origin::Primary(Some(acker)) => acker.ack().await,
            Origin::Primary(None) => Ok(()),
            Origin::DeadLetter => self.pseudo_ack().await,
        };
        if result.is_err() {
            self.acked.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn pseudo_ack(&self) -> Result<()> {
        let Some(id) = self.headers.get(PM_ID) else {
            debug!("dead-letter message without pm id, nothing to ack");
            return Ok(());
        };
        let ack = PmAck {
            id: id.to_string(),
            sequence: self.headers.get(PM_SEQUENCE).unwrap_or_default().to_string(),
        };
        let body = serde_json::to_vec(&ack)?;
        self.broker.publish(PM_ACKS, None, Bytes::from(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn dead_letter_delivery() -> Delivery {
        let mut headers = Headers::new();
        headers.push(PM_ID, "pm-7");
        headers.push(PM_SEQUENCE, "42");
        headers.push("trace", "t1");
        Delivery::core("$memphis_dls_orders_g1", Bytes::from_static(b"{}"), headers)
    }

    #[tokio::test]
    async fn test_dead_letter_pseudo_ack_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new());
        let message = Message::dead_letter(dead_letter_delivery(), broker.clone());

        assert!(message.is_dead_letter());
        assert_eq!(message.sequence_number(), 42);

        message.ack().await.unwrap();
        message.ack().await.unwrap();

        let acks = broker.pm_acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].id, "pm-7");
        assert_eq!(acks[0].sequence, "42");
    }

    #[tokio::test]
    async fn test_failed_ack_can_be_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let message = Message::dead_letter(dead_letter_delivery(), broker.clone());

        broker.disconnect();
        assert!(message.ack().await.is_err());
        broker.reconnect();
        message.ack().await.unwrap();
        assert_eq!(broker.pm_acks().len(), 1);
    }

    #[test]
    fn test_headers_hide_internal_keys() {
        let broker = Arc::new(MemoryBroker::new());
        let message = Message::dead_letter(dead_letter_delivery(), broker);
        let headers = message.headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("trace").map(String::as_str), Some("t1"));
    }
}
