//! Consumers
//!
//! A consumer merges two sources into one event channel: the durable pull
//! consumer on the station stream and the queue subscription on its group's
//! dead-letter subject. Two timers run beside the receive loops, one issuing
//! pull requests and one checking that the durable consumer still exists.
//! All four tasks stop when the consumer is destroyed or dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, DeliveryStream, Puller};
use crate::client::Client;
use crate::config::ConsumerDefaults;
use crate::error::{MemphisError, Result};
use crate::message::Message;
use crate::protocol::{DestroyConsumerRequest, CONSUMER_DESTRUCTIONS};
use crate::station::{internal_name, StationName};

/// Consumer creation options
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub station_name: String,
    pub consumer_name: String,
    /// Defaults to the consumer name
    pub consumer_group: String,
    pub pull_interval: Duration,
    pub batch_size: usize,
    pub batch_max_time_to_wait: Duration,
    pub max_ack_time: Duration,
    pub max_msg_deliveries: u32,
    pub gen_unique_suffix: bool,
    /// 1-based stream sequence to start from
    pub start_consume_from_sequence: i64,
    /// Start with the last N messages; -1 disables
    pub last_messages: i64,
    pub ping_interval: Duration,
}

impl ConsumerOptions {
    pub fn new(station: impl Into<String>, name: impl Into<String>) -> Self {
        Self::from_defaults(station, name, &ConsumerDefaults::default())
    }

    /// Options seeded from configured defaults
    pub fn from_defaults(station: impl Into<String>, name: impl Into<String>, defaults: &ConsumerDefaults) -> Self {
        Self {
            station_name: station.into(),
            consumer_name: name.into(),
            consumer_group: String::new(),
            pull_interval: Duration::from_millis(defaults.pull_interval_ms),
            batch_size: defaults.batch_size,
            batch_max_time_to_wait: Duration::from_millis(defaults.batch_max_time_to_wait_ms),
            max_ack_time: Duration::from_millis(defaults.max_ack_time_ms),
            max_msg_deliveries: defaults.max_msg_deliveries,
            gen_unique_suffix: false,
            start_consume_from_sequence: 1,
            last_messages: -1,
            ping_interval: Duration::from_secs(30),
        }
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_max_time_to_wait(mut self, wait: Duration) -> Self {
        self.batch_max_time_to_wait = wait;
        self
    }

    pub fn max_ack_time(mut self, time: Duration) -> Self {
        self.max_ack_time = time;
        self
    }

    pub fn max_msg_deliveries(mut self, deliveries: u32) -> Self {
        self.max_msg_deliveries = deliveries;
        self
    }

    pub fn gen_unique_suffix(mut self, enabled: bool) -> Self {
        self.gen_unique_suffix = enabled;
        self
    }

    pub fn start_consume_from_sequence(mut self, sequence: i64) -> Self {
        self.start_consume_from_sequence = sequence;
        self
    }

    pub fn last_messages(mut self, count: i64) -> Self {
        self.last_messages = count;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Checked before any broker call
    pub fn validate(&self) -> Result<()> {
        if self.station_name.is_empty() {
            return Err(MemphisError::Config("station name is required".to_string()));
        }
        if self.consumer_name.is_empty() {
            return Err(MemphisError::Config("consumer name is required".to_string()));
        }
        if self.start_consume_from_sequence <= 0 {
            return Err(MemphisError::Config(
                "startConsumeFromSequence has to be a positive number".to_string(),
            ));
        }
        if self.last_messages < -1 {
            return Err(MemphisError::Config("min value for LastMessages is -1".to_string()));
        }
        if self.start_consume_from_sequence > 1 && self.last_messages > -1 {
            return Err(MemphisError::Config(
                "Consumer creation options can't contain both startConsumeFromSequence and lastMessages"
                    .to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MemphisError::Config("batch size has to be positive".to_string()));
        }
        Ok(())
    }
}

/// What a consumer's channel carries
#[derive(Debug)]
pub enum ConsumerEvent {
    Message { message: Message, context: Value },
    /// Non-fatal; the consumer keeps running
    Error(MemphisError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribing,
    Active,
    Destroyed,
}

/// A consumer bound to one station and group
#[derive(Debug)]
pub struct Consumer {
    client: Client,
    station: StationName,
    options: ConsumerOptions,
    state: Arc<Mutex<ConsumerState>>,
    context: Arc<RwLock<Value>>,
    cancel: CancellationToken,
}

impl Consumer {
    pub(crate) fn new(client: Client, station: StationName, options: ConsumerOptions) -> Self {
        Self {
            client,
            station,
            options,
            state: Arc::new(Mutex::new(ConsumerState::Idle)),
            context: Arc::new(RwLock::new(Value::Object(Default::default()))),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.consumer_name
    }

    pub fn group(&self) -> &str {
        &self.options.consumer_group
    }

    pub fn station(&self) -> &StationName {
        &self.station
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Context attached to every message event from now on
    pub fn set_context(&self, context: Value) {
        *self.context.write() = context;
    }

    /// Start consuming. Messages and non-fatal errors arrive on the returned channel.
    pub fn consume(&self) -> Result<mpsc::Receiver<ConsumerEvent>> {
        {
            let mut state = self.state.lock();
            match *state {
                ConsumerState::Idle => *state = ConsumerState::Subscribing,
                ConsumerState::Destroyed => {
                    return Err(MemphisError::Config("consumer was destroyed".to_string()))
                }
                _ => return Err(MemphisError::Config("consumer is already consuming".to_string())),
            }
        }

        let (tx, rx) = mpsc::channel(self.options.batch_size.max(1) * 2);
        let task = ConsumeTask {
            broker: self.client.broker().clone(),
            station: self.station.clone(),
            group: self.options.consumer_group.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            context: self.context.clone(),
            cancel: self.cancel.clone(),
            events: tx,
        };
        tokio::spawn(task.run());
        Ok(rx)
    }

    /// Stop every task and remove the consumer. Removing a consumer that is
    /// already gone succeeds.
    pub async fn destroy(&self) -> Result<()> {
        *self.state.lock() = ConsumerState::Destroyed;
        self.cancel.cancel();

        let request = DestroyConsumerRequest {
            name: self.options.consumer_name.clone(),
            station_name: self.station.as_str().to_string(),
            username: self.client.username().to_string(),
        };
        match self.client.control_request(CONSUMER_DESTRUCTIONS, &request).await {
            Ok(()) => {
                info!(station = %self.station, consumer = %self.options.consumer_name, "consumer destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(consumer = %self.options.consumer_name, "consumer already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ConsumeTask {
    broker: Arc<dyn Broker>,
    station: StationName,
    group: String,
    options: ConsumerOptions,
    state: Arc<Mutex<ConsumerState>>,
    context: Arc<RwLock<Value>>,
    cancel: CancellationToken,
    events: mpsc::Sender<ConsumerEvent>,
}

impl ConsumeTask {
    async fn run(self) {
        let durable = internal_name(&self.group);

        let binding = match self.broker.pull_subscribe(self.station.internal(), &durable).await {
            Ok(binding) => binding,
            Err(e) => return self.fail(e).await,
        };
        let dead_letters = match self
            .broker
            .queue_subscribe(&self.station.dls_subject(&self.group), &self.station.dls_queue(&self.group))
            .await
        {
            Ok(stream) => stream,
            Err(e) => return self.fail(e).await,
        };

        {
            let mut state = self.state.lock();
            if *state != ConsumerState::Subscribing {
                return;
            }
            *state = ConsumerState::Active;
        }
        info!(station = %self.station, group = %self.group, "consumer subscribed");

        if let Err(e) = binding
            .puller
            .pull(self.options.batch_size, self.options.batch_max_time_to_wait)
            .await
        {
            warn!(station = %self.station, error = %e, "initial pull failed");
        }

        tokio::spawn(pull_timer(
            binding.puller,
            self.broker.clone(),
            self.options.pull_interval,
            self.options.batch_size,
            self.options.batch_max_time_to_wait,
            self.cancel.clone(),
        ));
        tokio::spawn(ping_timer(
            self.broker.clone(),
            self.station.internal().to_string(),
            durable,
            self.options.ping_interval,
            self.events.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(forward(
            binding.messages,
            Source::Primary,
            self.broker.clone(),
            self.context.clone(),
            self.events.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(forward(
            dead_letters,
            Source::DeadLetter,
            self.broker,
            self.context,
            self.events,
            self.cancel,
        ));
    }

    async fn fail(self, error: MemphisError) {
        warn!(station = %self.station, group = %self.group, error = %error, "consumer subscription failed");
        {
            let mut state = self.state.lock();
            if *state == ConsumerState::Subscribing {
                *state = ConsumerState::Idle;
            }
        }
        let _ = self.events.send(ConsumerEvent::Error(error)).await;
    }
}

async fn pull_timer(
    puller: Box<dyn Puller>,
    broker: Arc<dyn Broker>,
    period: Duration,
    batch_size: usize,
    expires: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if broker.is_closed() {
                    debug!("connection closed, pull timer stopping");
                    break;
                }
                if let Err(e) = puller.pull(batch_size, expires).await {
                    warn!(error = %e, "pull request failed");
                }
            }
        }
    }
}

async fn ping_timer(
    broker: Arc<dyn Broker>,
    stream: String,
    durable: String,
    period: Duration,
    events: mpsc::Sender<ConsumerEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if broker.is_closed() {
                    debug!("connection closed, liveness check stopping");
                    break;
                }
                if let Err(e) = broker.consumer_info(&stream, &durable).await {
                    warn!(station = %stream, group = %durable, error = %e, "consumer liveness check failed");
                    if events.send(ConsumerEvent::Error(MemphisError::ConsumerNotFound)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Primary,
    DeadLetter,
}

async fn forward(
    mut deliveries: DeliveryStream,
    source: Source,
    broker: Arc<dyn Broker>,
    context: Arc<RwLock<Value>>,
    events: mpsc::Sender<ConsumerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = deliveries.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let message = match source {
            Source::Primary => Message::primary(delivery, broker.clone()),
            Source::DeadLetter => Message::dead_letter(delivery, broker.clone()),
        };
        let event = ConsumerEvent::Message {
            message,
            context: context.read().clone(),
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(?source, "receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_defaults() {
        let options = ConsumerOptions::new("orders", "c1");
        assert_eq!(options.pull_interval, Duration::from_secs(1));
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.batch_max_time_to_wait, Duration::from_secs(5));
        assert_eq!(options.max_ack_time, Duration::from_secs(30));
        assert_eq!(options.max_msg_deliveries, 10);
        assert_eq!(options.start_consume_from_sequence, 1);
        assert_eq!(options.last_messages, -1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_start_sequence_must_be_positive() {
        let err = ConsumerOptions::new("orders", "c1")
            .start_consume_from_sequence(0)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: startConsumeFromSequence has to be a positive number"
        );
    }

    #[test]
    fn test_last_messages_lower_bound() {
        let err = ConsumerOptions::new("orders", "c1")
            .last_messages(-2)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("min value for LastMessages is -1"));
    }

    #[test]
    fn test_start_and_last_are_exclusive() {
        let err = ConsumerOptions::new("orders", "c1")
            .start_consume_from_sequence(5)
            .last_messages(3)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("can't contain both"));

        assert!(ConsumerOptions::new("orders", "c1").last_messages(0).validate().is_ok());
    }
}
