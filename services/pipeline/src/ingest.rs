//! Ingestion stage: stream records in, archived images out to the handoff
//! queue.
//!
//! ```text
//! STARTING ──▶ RUNNING ──▶ DRAINING ──▶ STOPPED
//!  read checkpoints   pull, archive,   stop pulling
//!  assign partitions  hand off
//! ```

use crate::archive::ArchiveWriter;
use crate::checkpoint::{CheckpointError, CheckpointOpener};
use crate::consumer::{ResumePosition, StreamError, StreamRecord, StreamSource};
use crate::handoff::{HandoffError, HandoffSender};
use crate::message::ImageMessage;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Startup failures; per-record problems never surface as errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Checkpoint store unavailable: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Stream setup failed: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// An archived image waiting for classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRecord {
    /// Archive day, `YYYY-MM-DD`
    pub date: String,
    /// Ordered metadata fields, as written to the device list
    pub metadata: Vec<String>,
    pub image_path: PathBuf,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub struct IngestionStage<S> {
    topic: String,
    partitions: Vec<i32>,
    source: S,
    archive: ArchiveWriter,
    metadata_fields: Vec<String>,
    checkpoints: Arc<dyn CheckpointOpener>,
    state: watch::Sender<StageState>,
}

impl<S: StreamSource> IngestionStage<S> {
    pub fn new(
        topic: impl Into<String>,
        partitions: Vec<i32>,
        source: S,
        archive: ArchiveWriter,
        metadata_fields: Vec<String>,
        checkpoints: Arc<dyn CheckpointOpener>,
    ) -> Self {
        let (state, _) = watch::channel(StageState::Starting);
        Self {
            topic: topic.into(),
            partitions,
            source,
            archive,
            metadata_fields,
            checkpoints,
            state,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StageState> {
        self.state.subscribe()
    }

    fn transition(&self, next: StageState) {
        info!(state = ?next, "Ingestion stage state");
        self.state.send_replace(next);
    }

    /// Resume position of every assigned partition, read from a short-lived
    /// checkpoint store handle
    pub async fn resume_positions(&self) -> Result<Vec<(i32, ResumePosition)>, IngestError> {
        let store = self.checkpoints.open().await?;

        let mut positions = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            let offset = store.read(&self.topic, partition).await;
            info!(topic = %self.topic, partition, offset, "Read checkpoint");
            positions.push((partition, ResumePosition::from_checkpoint(offset)));
        }

        store.close().await;
        Ok(positions)
    }

    /// Run until cancelled or the stream ends
    #[instrument(skip_all, fields(topic = %self.topic))]
    pub async fn run(
        mut self,
        handoff: HandoffSender<IngestionRecord>,
        token: CancellationToken,
    ) -> Result<(), IngestError> {
        let result = self.run_inner(&handoff, &token).await;
        self.transition(StageState::Stopped);
        result
    }

    async fn run_inner(
        &mut self,
        handoff: &HandoffSender<IngestionRecord>,
        token: &CancellationToken,
    ) -> Result<(), IngestError> {
        let positions = self.resume_positions().await?;
        self.source.assign(&self.topic, &positions)?;

        self.transition(StageState::Running);
        let mut forwarded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.source.next_record() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!(error = %e, "Stream poll failed");
                    continue;
                }
                None => {
                    info!("Stream ended");
                    break;
                }
            };

            let Some(item) = self.process(&record).await else {
                continue;
            };

            match handoff.put(item, token).await {
                Ok(()) => forwarded += 1,
                Err(HandoffError::Cancelled) => break,
                Err(HandoffError::Closed) => {
                    warn!("Classification stage gone, stopping ingestion");
                    break;
                }
            }
        }

        self.transition(StageState::Draining);
        info!(forwarded, "Ingestion loop finished");
        Ok(())
    }

    /// Decode and archive one record. Failures are logged and the record is
    /// skipped; the stream position moves on regardless.
    async fn process(&self, record: &StreamRecord) -> Option<IngestionRecord> {
        let message = match ImageMessage::parse(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    error = %e,
                    partition = record.partition,
                    offset = record.offset,
                    "Dropping malformed message"
                );
                return None;
            }
        };

        info!(
            partition = record.partition,
            offset = record.offset,
            device_time = %message.create_time,
            gzid = %message.gzid,
            device_id = %message.device_id,
            img_name = %message.img_name,
            "Received image"
        );

        let metadata = message.metadata(&self.metadata_fields);
        match self.archive.store(&message, &metadata).await {
            Ok(archived) => {
                debug!(path = %archived.image_path.display(), "Forwarding to classification");
                Some(IngestionRecord {
                    date: archived.date,
                    metadata,
                    image_path: archived.image_path,
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                })
            }
            Err(e) => {
                error!(
                    error = %e,
                    partition = record.partition,
                    offset = record.offset,
                    "Failed to archive image"
                );
                None
            }
        }
    }
}
