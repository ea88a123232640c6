//! Kafka plumbing for the raw-comment topic: keyed at-least-once publishing
//! and batched consumption with manual offset commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::{info, warn};
use vidsent_core::Comment;

pub const CRATE_NAME: &str = "vidsent-stream";

pub const DEFAULT_TOPIC: &str = "raw_comments";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message without payload")]
    EmptyPayload,
}

/// Serialize a comment for the log; field names are preserved so consumers
/// on other stacks can read the payload.
pub fn encode_comment(comment: &Comment) -> Result<Vec<u8>, StreamError> {
    Ok(serde_json::to_vec(comment)?)
}

pub fn decode_payload(bytes: &[u8]) -> Result<Comment, StreamError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_message(message: &BorrowedMessage<'_>) -> Result<Comment, StreamError> {
    let payload = message.payload().ok_or(StreamError::EmptyPayload)?;
    decode_payload(payload)
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "vidsent".to_string())
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub brokers: String,
    pub topic: String,
    pub client_id: Option<String>,
    /// Broker-side send retries per message.
    pub message_retries: u32,
    pub flush_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            client_id: None,
            message_retries: 3,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// At-least-once publisher for newly discovered comments, keyed by
/// `comment_id`.
///
/// Publishing is fire-and-continue: delivery futures are detached onto the
/// runtime and acknowledgement failures are logged, never surfaced into the
/// fetch path. If the producer cannot be constructed the publisher runs
/// disabled and every publish is a no-op — ingestion degrades to
/// snapshot-only.
pub struct CommentPublisher {
    producer: Option<FutureProducer>,
    topic: String,
    flush_timeout: Duration,
    enqueued: AtomicU64,
    delivered: Arc<AtomicU64>,
}

impl CommentPublisher {
    pub fn connect(config: PublisherConfig) -> Self {
        let client_id = config.client_id.unwrap_or_else(default_client_id);
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &client_id)
            .set("acks", "all")
            .set("message.send.max.retries", config.message_retries.to_string())
            .create::<FutureProducer>();

        let producer = match producer {
            Ok(producer) => {
                info!(brokers = config.brokers.as_str(), topic = config.topic.as_str(), "kafka producer initialized");
                Some(producer)
            }
            Err(err) => {
                warn!(error = %err, "kafka producer unavailable, publishing disabled for this run");
                None
            }
        };

        Self {
            producer,
            topic: config.topic,
            flush_timeout: config.flush_timeout,
            enqueued: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A publisher that never talks to a broker.
    pub fn disabled() -> Self {
        Self {
            producer: None,
            topic: DEFAULT_TOPIC.to_string(),
            flush_timeout: Duration::from_secs(10),
            enqueued: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.producer.is_some()
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Attempt exactly one publish call for the comment.
    pub fn publish(&self, comment: &Comment) {
        let Some(producer) = &self.producer else {
            return;
        };

        let payload = match encode_comment(comment) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(comment_id = comment.comment_id.as_str(), error = %err, "comment not serializable, skipping publish");
                return;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(comment.comment_id.as_bytes())
            .payload(&payload);

        match producer.send_result(record) {
            Ok(delivery) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                let delivered = Arc::clone(&self.delivered);
                let comment_id = comment.comment_id.clone();
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Ok(_)) => {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err((err, _message))) => {
                            warn!(comment_id = comment_id.as_str(), error = %err, "publish not acknowledged");
                        }
                        Err(_cancelled) => {
                            warn!(comment_id = comment_id.as_str(), "producer dropped before acknowledgement");
                        }
                    }
                });
            }
            Err((err, _record)) => {
                warn!(comment_id = comment.comment_id.as_str(), error = %err, "publish enqueue failed");
            }
        }
    }

    /// Block until buffered messages are acknowledged or the bounded timeout
    /// elapses; anything still unflushed is dropped with a warning.
    pub fn flush(&self) {
        let Some(producer) = &self.producer else {
            return;
        };
        match producer.flush(Timeout::After(self.flush_timeout)) {
            Ok(()) => info!(
                enqueued = self.enqueued(),
                delivered = self.delivered(),
                "kafka producer flushed"
            ),
            Err(err) => warn!(
                error = %err,
                enqueued = self.enqueued(),
                delivered = self.delivered(),
                "flush did not finish in time, undelivered messages dropped"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub batch_size: usize,
    /// Max wait for one message before the in-progress batch is handed back.
    pub poll_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            group_id: "analytics-loader".to_string(),
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// One batch drained from the raw-comment topic. Malformed messages are
/// counted, logged, and skipped — their offsets advance with the batch.
#[derive(Debug, Default)]
pub struct CommentBatch {
    pub comments: Vec<Comment>,
    pub malformed: usize,
}

impl CommentBatch {
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty() && self.malformed == 0
    }
}

/// Consumer-group member draining the raw-comment topic in bounded batches.
///
/// Offsets are committed manually via [`CommentBatchConsumer::commit`], which
/// callers invoke only after the batch's storage writes are durable.
pub struct CommentBatchConsumer {
    consumer: StreamConsumer,
    batch_size: usize,
    poll_timeout: Duration,
}

impl CommentBatchConsumer {
    pub fn connect(config: ConsumerConfig) -> Result<Self, StreamError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("max.poll.interval.ms", "300000")
            .create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        info!(
            brokers = config.brokers.as_str(),
            topic = config.topic.as_str(),
            group = config.group_id.as_str(),
            "kafka consumer subscribed"
        );
        Ok(Self {
            consumer,
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout,
        })
    }

    /// Accumulate up to `batch_size` comments, or fewer when the poll timeout
    /// elapses with no new message.
    pub async fn next_batch(&self) -> Result<CommentBatch, StreamError> {
        let mut batch = CommentBatch::default();
        while batch.comments.len() < self.batch_size {
            match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
                Err(_idle) => break,
                Ok(Err(err)) => return Err(StreamError::Kafka(err)),
                Ok(Ok(message)) => match decode_message(&message) {
                    Ok(comment) => batch.comments.push(comment),
                    Err(err) => {
                        warn!(
                            offset = message.offset(),
                            partition = message.partition(),
                            error = %err,
                            "skipping undecodable message"
                        );
                        batch.malformed += 1;
                    }
                },
            }
        }
        Ok(batch)
    }

    /// Commit the consumer position. Call only after the corresponding
    /// storage batch has committed.
    pub fn commit(&self) -> Result<(), StreamError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(StreamError::Kafka)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn mk_comment(id: &str) -> Comment {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        Comment {
            comment_id: id.to_string(),
            video_id: "vid1".to_string(),
            category: Some("robotics".into()),
            author: "a".into(),
            text: "t".into(),
            like_count: 1,
            reply_count: 2,
            published_at: now,
            updated_at: now,
            sentiment_label: None,
            sentiment_score: None,
            phrases: None,
        }
    }

    #[test]
    fn payload_round_trips() {
        let comment = mk_comment("c1");
        let bytes = encode_comment(&comment).expect("encode");
        let back = decode_payload(&bytes).expect("decode");
        assert_eq!(back, comment);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let err = decode_payload(b"{truncated").expect_err("should fail");
        assert!(matches!(err, StreamError::Decode(_)));
    }

    #[tokio::test]
    async fn disabled_publisher_ignores_publishes_and_flushes() {
        let publisher = CommentPublisher::disabled();
        assert!(!publisher.is_enabled());
        publisher.publish(&mk_comment("c1"));
        publisher.flush();
        assert_eq!(publisher.enqueued(), 0);
        assert_eq!(publisher.delivered(), 0);
    }

    #[test]
    fn consumer_config_defaults_match_topic_contract() {
        let config = ConsumerConfig::default();
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn empty_batch_reports_empty() {
        let batch = CommentBatch::default();
        assert!(batch.is_empty());
    }
}
