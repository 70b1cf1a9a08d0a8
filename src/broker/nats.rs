//! NATS / JetStream transport

use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::Consumer};
use async_nats::{ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{receiver_stream, Acker, Broker, Delivery, DeliveryStream, PullBinding, Puller};
use crate::config::ConnectionConfig;
use crate::error::{MemphisError, Result};
use crate::headers::Headers;

/// Broker backed by a live NATS connection
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("state", &self.client.connection_state())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl NatsBroker {
    /// Open a connection named `connection_name`
    pub async fn connect(config: &ConnectionConfig, connection_name: &str) -> Result<Self> {
        let reconnect_interval = Duration::from_millis(config.reconnect_interval_ms);
        let max_reconnects = if config.reconnect {
            config.effective_max_reconnect()
        } else {
            0
        };

        let mut options = ConnectOptions::new()
            .name(connection_name)
            .connection_timeout(Duration::from_millis(config.timeout_ms))
            .request_timeout(Some(Duration::from_millis(config.timeout_ms)))
            .max_reconnects(Some(max_reconnects))
            .reconnect_delay_callback(move |_attempts| reconnect_interval)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("broker connection established"),
                    Event::Disconnected => warn!("broker connection lost"),
                    other => debug!(event = %other, "broker event"),
                }
            });

        if !config.connection_token.is_empty() {
            options = options.token(config.connection_token.clone());
        }
        if let Some(tls) = config.tls()? {
            options = options
                .add_client_certificate(tls.cert_file, tls.key_file)
                .add_root_certificates(tls.ca_file)
                .require_tls(true);
        }

        let address = format!("{}:{}", config.normalized_host(), config.port);
        let client = options
            .connect(address.as_str())
            .await
            .map_err(MemphisError::broker)?;
        info!(address = %address, name = connection_name, "connected to broker");

        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn pull_consumer(&self, stream: &str, durable: &str) -> Result<Consumer<pull::Config>> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(MemphisError::broker)?;
        stream
            .get_consumer::<pull::Config>(durable)
            .await
            .map_err(MemphisError::broker)
    }

    async fn send_to_stream(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
    ) -> Result<jetstream::context::PublishAckFuture> {
        self.jetstream
            .publish_with_headers(subject.to_string(), to_header_map(headers), payload)
            .await
            .map_err(|e| publish_error(subject, e))
    }
}

fn publish_error(subject: &str, err: jetstream::context::PublishError) -> MemphisError {
    match err.kind() {
        jetstream::context::PublishErrorKind::StreamNotFound => {
            MemphisError::NoResponders(subject.to_string())
        }
        jetstream::context::PublishErrorKind::TimedOut => MemphisError::Timeout(subject.to_string()),
        _ => MemphisError::broker(err),
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers.iter() {
        map.append(key, value);
    }
    map
}

fn from_header_map(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (key, values) in map.iter() {
            for value in values {
                headers.push(key.to_string(), value.to_string());
            }
        }
    }
    headers
}

fn core_delivery(message: async_nats::Message) -> Delivery {
    let headers = from_header_map(message.headers.as_ref());
    Delivery::core(message.subject.to_string(), message.payload, headers)
}

fn stream_delivery(message: jetstream::Message) -> Delivery {
    let (sequence, delivered) = match message.info() {
        Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
        Err(_) => (0, 1),
    };
    Delivery {
        subject: message.message.subject.to_string(),
        payload: message.message.payload.clone(),
        headers: from_header_map(message.message.headers.as_ref()),
        sequence,
        delivered,
        acker: Some(Box::new(JetStreamAcker { message })),
    }
}

fn subscriber_stream(subscriber: async_nats::Subscriber) -> DeliveryStream {
    subscriber.map(core_delivery).boxed()
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(MemphisError::broker)
    }
}

struct JetStreamPuller {
    consumer: Consumer<pull::Config>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl Puller for JetStreamPuller {
    async fn pull(&self, batch: usize, expires: Duration) -> Result<()> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(MemphisError::broker)?;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => {
                        if tx.send(stream_delivery(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "pull batch ended");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, subject: &str, headers: Option<&Headers>, payload: Bytes) -> Result<()> {
        match headers {
            Some(headers) => self
                .client
                .publish_with_headers(subject.to_string(), to_header_map(headers), payload)
                .await
                .map_err(MemphisError::broker),
            None => self
                .client
                .publish(subject.to_string(), payload)
                .await
                .map_err(MemphisError::broker),
        }
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes> {
        match self.client.request(subject.to_string(), payload).await {
            Ok(reply) => Ok(reply.payload),
            Err(e) => Err(match e.kind() {
                async_nats::RequestErrorKind::NoResponders => MemphisError::NoResponders(subject.to_string()),
                async_nats::RequestErrorKind::TimedOut => MemphisError::Timeout(subject.to_string()),
                _ => MemphisError::broker(e),
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<DeliveryStream> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(MemphisError::broker)?;
        Ok(subscriber_stream(subscriber))
    }

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<DeliveryStream> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue.to_string())
            .await
            .map_err(MemphisError::broker)?;
        Ok(subscriber_stream(subscriber))
    }

    async fn stream_publish(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        ack_wait: Duration,
    ) -> Result<u64> {
        let pending = self.send_to_stream(subject, headers, payload).await?;
        let ack = tokio::time::timeout(ack_wait, pending.into_future())
            .await
            .map_err(|_| MemphisError::Timeout(subject.to_string()))?
            .map_err(|e| publish_error(subject, e))?;
        Ok(ack.sequence)
    }

    async fn stream_publish_detached(
        &self,
        subject: &str,
        headers: &Headers,
        payload: Bytes,
        ack_wait: Duration,
    ) -> Result<()> {
        let pending = self.send_to_stream(subject, headers, payload).await?;
        let subject = subject.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ack_wait, pending.into_future()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(subject = %subject, error = %publish_error(&subject, e), "async produce failed"),
                Err(_) => warn!(subject = %subject, "async produce ack timed out"),
            }
        });
        Ok(())
    }

    async fn pull_subscribe(&self, stream: &str, durable: &str) -> Result<PullBinding> {
        let consumer = self.pull_consumer(stream, durable).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(PullBinding {
            puller: Box::new(JetStreamPuller { consumer, tx }),
            messages: receiver_stream(rx),
        })
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<()> {
        self.pull_consumer(stream, durable).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.connection_state() == State::Connected
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "flush on close failed");
        }
        info!("broker connection closed");
        Ok(())
    }
}
