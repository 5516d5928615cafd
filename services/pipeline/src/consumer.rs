//! Stream client abstraction and the Kafka implementation.
//!
//! The ingestion stage assigns partitions explicitly (no consumer-group
//! rebalancing) and tells the client where each partition resumes. Offsets
//! are never committed to the broker; they live in the checkpoint store.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to assign partitions: {0}")]
    AssignmentError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Where a partition resumes after assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePosition {
    /// No checkpoint: earliest available record
    Beginning,
    /// Next delivered record is the first one after this offset
    After(i64),
}

impl ResumePosition {
    /// Position for a stored checkpoint, where 0 means none
    pub fn from_checkpoint(offset: i64) -> Self {
        if offset > 0 {
            ResumePosition::After(offset)
        } else {
            ResumePosition::Beginning
        }
    }

    fn kafka_offset(self) -> Offset {
        match self {
            ResumePosition::Beginning => Offset::Beginning,
            ResumePosition::After(offset) => Offset::Offset(offset + 1),
        }
    }

    /// Whether a record at `offset` is delivered from this position
    pub fn admits(self, offset: i64) -> bool {
        match self {
            ResumePosition::Beginning => true,
            ResumePosition::After(last) => offset > last,
        }
    }
}

/// An owned stream record
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// A partition-ordered record source
#[async_trait]
pub trait StreamSource: Send {
    /// Replace the assignment with `positions` on `topic`
    fn assign(&mut self, topic: &str, positions: &[(i32, ResumePosition)]) -> Result<(), StreamError>;

    /// Next record of any assigned partition; `None` once the stream has ended
    async fn next_record(&mut self) -> Option<Result<StreamRecord, StreamError>>;
}

/// Kafka-backed source over a manually assigned `StreamConsumer`
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    /// Create a new consumer with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, StreamError> {
        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.topic,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| StreamError::CreationError(e.to_string()))?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    fn assign(&mut self, topic: &str, positions: &[(i32, ResumePosition)]) -> Result<(), StreamError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, position) in positions {
            tpl.add_partition_offset(topic, *partition, position.kafka_offset())
                .map_err(|e| StreamError::AssignmentError(e.to_string()))?;
        }

        self.consumer
            .assign(&tpl)
            .map_err(|e| StreamError::AssignmentError(e.to_string()))?;

        info!(topic, partitions = ?positions, "Assigned partitions");
        Ok(())
    }

    async fn next_record(&mut self) -> Option<Result<StreamRecord, StreamError>> {
        let record = match self.consumer.recv().await {
            Ok(message) => Ok(StreamRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().unwrap_or(&[]).to_vec(),
            }),
            Err(e) => Err(StreamError::PollError(e.to_string())),
        };
        Some(record)
    }
}

/// Channel-fed source for replays and tests.
///
/// Honors assignment: records of unassigned partitions or at/before a
/// partition's resume position are skipped. Ends when every sender is dropped.
pub struct MemorySource {
    rx: flume::Receiver<StreamRecord>,
    topic: Option<String>,
    positions: HashMap<i32, ResumePosition>,
}

impl MemorySource {
    pub fn channel() -> (flume::Sender<StreamRecord>, Self) {
        let (tx, rx) = flume::unbounded();
        (
            tx,
            Self {
                rx,
                topic: None,
                positions: HashMap::new(),
            },
        )
    }

    fn admits(&self, record: &StreamRecord) -> bool {
        self.topic.as_deref() == Some(record.topic.as_str())
            && self
                .positions
                .get(&record.partition)
                .is_some_and(|position| position.admits(record.offset))
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    fn assign(&mut self, topic: &str, positions: &[(i32, ResumePosition)]) -> Result<(), StreamError> {
        self.topic = Some(topic.to_string());
        self.positions = positions.iter().copied().collect();
        Ok(())
    }

    async fn next_record(&mut self) -> Option<Result<StreamRecord, StreamError>> {
        loop {
            let record = self.rx.recv_async().await.ok()?;
            if self.admits(&record) {
                return Some(Ok(record));
            }
            debug!(
                partition = record.partition,
                offset = record.offset,
                "Skipping record outside assignment"
            );
        }
    }
}
