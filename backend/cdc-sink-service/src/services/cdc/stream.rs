use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use tracing::{error, info};

use super::models::{ChangeEvent, StreamPosition};
use crate::config::KafkaConfig;
use crate::error::{Result, SinkError};

/// Source of change events, in delivery order.
#[async_trait]
pub trait ChangeStream: Send {
    /// Wait for the next event. `Ok(None)` means the subscription has ended and
    /// no further events will arrive.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>>;

    /// Mark `event` as done so the transport may commit past it. Called once the
    /// event has been fully processed, whether or not it applied cleanly.
    async fn acknowledge(&mut self, _event: &ChangeEvent) -> Result<()> {
        Ok(())
    }

    /// Release the subscription.
    async fn close(&mut self) {}
}

/// Kafka subscription delivering Debezium change events.
pub struct KafkaChangeStream {
    consumer: StreamConsumer,
}

/// Offsets are stored only by [`ChangeStream::acknowledge`]; the background
/// auto-commit then commits what has been stored. An event that was received
/// but not yet processed is therefore redelivered after a crash.
fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("group.id", &config.group_id)
        .set("bootstrap.servers", &config.brokers)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.commit.interval.ms", "5000")
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", "3000")
        .set("max.poll.interval.ms", "300000")
        .set("enable.partition.eof", "false");
    client
}

impl KafkaChangeStream {
    pub fn subscribe(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                SinkError::Kafka(e.to_string())
            })?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            error!("Failed to subscribe to topics: {}", e);
            SinkError::Kafka(e.to_string())
        })?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            "CDC consumer subscribed to topics"
        );

        Ok(Self { consumer })
    }
}

/// librdkafka reconnects on its own; only a fatal client state is terminal.
fn is_fatal(err: &KafkaError) -> bool {
    err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

#[async_trait]
impl ChangeStream for KafkaChangeStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        match self.consumer.recv().await {
            Ok(msg) => {
                let timestamp = msg
                    .timestamp()
                    .to_millis()
                    .unwrap_or_else(|| Utc::now().timestamp_millis());
                let event = ChangeEvent::new(timestamp, msg.payload().map(<[u8]>::to_vec))
                    .with_position(StreamPosition {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                    });
                Ok(Some(event))
            }
            Err(e) if is_fatal(&e) => Err(SinkError::TransportClosed(e.to_string())),
            Err(e) => Err(SinkError::Kafka(e.to_string())),
        }
    }

    async fn acknowledge(&mut self, event: &ChangeEvent) -> Result<()> {
        let Some(pos) = &event.position else {
            return Ok(());
        };

        // The stored offset is the next one to read
        self.consumer
            .store_offset(&pos.topic, pos.partition, pos.offset + 1)
            .map_err(|e| SinkError::Kafka(format!("failed to store offset: {}", e)))
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!("CDC consumer unsubscribed");
    }
}

/// Adapts any stream of events, e.g. an in-process channel or a fixed list.
pub struct EventStream<S> {
    inner: S,
}

impl<S> EventStream<S>
where
    S: Stream<Item = Result<ChangeEvent>> + Send + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl EventStream<futures::stream::Iter<std::vec::IntoIter<Result<ChangeEvent>>>> {
    /// Stream that yields `events` and then ends.
    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        Self::new(futures::stream::iter(
            events.into_iter().map(Ok).collect::<Vec<_>>(),
        ))
    }
}

#[async_trait]
impl<S> ChangeStream for EventStream<S>
where
    S: Stream<Item = Result<ChangeEvent>> + Send + Unpin,
{
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        self.inner.next().await.transpose()
    }
}
