//! Producers: validate, publish, dead-letter on failure

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::dead_letter::DeadLetterRecord;
use crate::error::{MemphisError, Result};
use crate::headers::{Headers, CONNECTION_ID, MSG_ID, PRODUCED_BY};
use crate::payload::Payload;
use crate::protocol::{
    DestroyProducerRequest, Notification, NOTIFICATIONS, PRODUCER_DESTRUCTIONS,
    SCHEMA_VALIDATION_FAIL_ALERT,
};
use crate::registry::StationView;
use crate::station::StationName;

/// Per-call produce options
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Upper bound on waiting for the broker's acknowledgement
    pub ack_wait: Duration,
    /// Fire-and-forget: return once the message is handed to the connection
    pub async_produce: bool,
    /// Deduplication id, sent as the `msg-id` header
    pub msg_id: Option<String>,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(15),
            async_produce: false,
            msg_id: None,
        }
    }
}

impl ProduceOptions {
    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn async_produce(mut self, enabled: bool) -> Self {
        self.async_produce = enabled;
        self
    }

    pub fn msg_id(mut self, id: impl Into<String>) -> Self {
        self.msg_id = Some(id.into());
        self
    }
}

/// A named producer bound to one station
#[derive(Debug, Clone)]
pub struct Producer {
    client: Client,
    station: StationName,
    name: String,
    destroyed: Arc<AtomicBool>,
}

impl Producer {
    pub(crate) fn new(client: Client, station: StationName, name: String) -> Self {
        Self {
            client,
            station,
            name,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn station(&self) -> &StationName {
        &self.station
    }

    /// Validate `payload` against the station's current schema and publish it.
    ///
    /// Schema failures are routed to the station's dead-letter subject when the
    /// station asks for it; the validation error is returned either way.
    pub async fn produce(
        &self,
        payload: impl Into<Payload>,
        headers: Option<Headers>,
        options: ProduceOptions,
    ) -> Result<()> {
        let payload = payload.into();
        let view = self.client.registry().snapshot(self.station.internal()).await?;

        let result = match view.schema.validate(self.station.internal(), &payload) {
            Ok(bytes) => self.publish(bytes, headers.as_ref(), &options).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(MemphisError::NoResponders(subject)) => {
                debug!(subject = %subject, "no stream behind subject");
                Err(MemphisError::TargetMissing)
            }
            Err(e) => {
                if e.is_schema_validation() {
                    self.dead_letter(&view, &payload, headers.as_ref(), &e, options.ack_wait)
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn publish(&self, bytes: Bytes, headers: Option<&Headers>, options: &ProduceOptions) -> Result<()> {
        let mut headers = headers.cloned().unwrap_or_default();
        headers.set(CONNECTION_ID, self.client.connection_id());
        headers.set(PRODUCED_BY, self.name.as_str());
        if let Some(id) = &options.msg_id {
            headers.set(MSG_ID, id.as_str());
        }

        let subject = self.station.final_subject();
        let broker = self.client.broker();
        if options.async_produce {
            broker
                .stream_publish_detached(&subject, &headers, bytes, options.ack_wait)
                .await
        } else {
            broker
                .stream_publish(&subject, &headers, bytes, options.ack_wait)
                .await
                .map(|_| ())
        }
    }

    /// Best effort: failures here are logged and never replace the original error
    async fn dead_letter(
        &self,
        view: &StationView,
        payload: &Payload,
        headers: Option<&Headers>,
        error: &MemphisError,
        ack_wait: Duration,
    ) {
        if !view.dls_schema_failures {
            return;
        }

        let raw = payload.to_dead_letter_bytes();
        let record = DeadLetterRecord::new(
            self.station.internal(),
            &self.name,
            self.client.connection_id(),
            &raw,
            headers,
        );
        let subject = self.station.dls_schema_subject(&record.id);

        let sent = match record.to_bytes() {
            Ok(body) => self
                .client
                .broker()
                .stream_publish(&subject, &Headers::new(), Bytes::from(body), ack_wait)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => info!(
                station = %self.station,
                producer = %self.name,
                id = %record.id,
                payload = payload.kind_name(),
                "message sent to dead-letter station"
            ),
            Err(e) => {
                warn!(station = %self.station, error = %e, "failed to write dead letter");
                return;
            }
        }

        if view.send_notification {
            let notification = Notification {
                title: "Schema validation has failed".to_string(),
                msg: format!(
                    "Station: {}\nProducer: {}\nError: {}",
                    self.station, self.name, error
                ),
                kind: SCHEMA_VALIDATION_FAIL_ALERT.to_string(),
                code: String::from_utf8_lossy(&raw).into_owned(),
            };
            let published = match serde_json::to_vec(&notification) {
                Ok(body) => self
                    .client
                    .broker()
                    .publish(NOTIFICATIONS, None, Bytes::from(body))
                    .await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                warn!(station = %self.station, error = %e, "failed to publish schema failure notification");
            }
        }
    }

    /// Remove the producer. A producer the broker no longer knows is already gone.
    pub async fn destroy(&self) -> Result<()> {
        let request = DestroyProducerRequest {
            name: self.name.clone(),
            station_name: self.station.as_str().to_string(),
            username: self.client.username().to_string(),
        };
        match self.client.control_request(PRODUCER_DESTRUCTIONS, &request).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(producer = %self.name, "producer already removed");
            }
            Err(e) => return Err(e),
        }

        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.client
                .registry()
                .unregister_producer(self.station.internal())
                .await?;
            info!(station = %self.station, producer = %self.name, "producer destroyed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_option_defaults() {
        let options = ProduceOptions::default();
        assert_eq!(options.ack_wait, Duration::from_secs(15));
        assert!(!options.async_produce);
        assert!(options.msg_id.is_none());

        let options = ProduceOptions::default().msg_id("dedupe-1").async_produce(true);
        assert_eq!(options.msg_id.as_deref(), Some("dedupe-1"));
        assert!(options.async_produce);
    }
}
