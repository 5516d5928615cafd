//! Classification worker pool.
//!
//! One relay task moves records from the handoff queue into the internal
//! work queue, `workers` tasks classify and log them, and the heartbeat
//! loop periodically flushes processed offsets to the checkpoint store.
//! All of it runs on the stage's own single-threaded runtime.

use crate::checkpoint::{CheckpointError, CheckpointOpener, CheckpointStore};
use crate::classifier::Classifier;
use crate::config::{Config, OffsetPolicy};
use crate::daily_log::{splice_fields, DailyLogWriter};
use crate::handoff::{self, HandoffError, HandoffReceiver, HandoffSender};
use crate::ingest::IngestionRecord;
use crate::offsets::OffsetTable;
use crate::reference::{ProviderInfo, ReferenceTable};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tunables of a pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub work_queue_capacity: usize,
    pub log_dir: PathBuf,
    pub flush_every_lines: usize,
    pub heartbeat_interval: Duration,
    /// Heartbeats between two checkpoint flushes
    pub flush_every_ticks: u32,
    pub offset_policy: OffsetPolicy,
    /// Distinguishes the log files of concurrently running shard processes
    pub process_id: u32,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.classifier.workers,
            work_queue_capacity: config.classifier.work_queue_capacity,
            log_dir: config.classifier.log_dir.clone(),
            flush_every_lines: config.classifier.flush_every_lines,
            heartbeat_interval: config.checkpoint.heartbeat_interval(),
            flush_every_ticks: config.checkpoint.flush_every_ticks,
            offset_policy: config.checkpoint.offset_policy,
            process_id: std::process::id(),
        }
    }
}

pub struct ClassificationPool {
    settings: PoolSettings,
    classifier: Classifier,
    reference: Arc<ReferenceTable>,
    checkpoints: Arc<dyn CheckpointOpener>,
    offsets: Arc<OffsetTable>,
}

impl ClassificationPool {
    pub fn new(
        settings: PoolSettings,
        classifier: Classifier,
        reference: Arc<ReferenceTable>,
        checkpoints: Arc<dyn CheckpointOpener>,
    ) -> Self {
        let offsets = Arc::new(OffsetTable::new(settings.offset_policy));
        Self {
            settings,
            classifier,
            reference,
            checkpoints,
            offsets,
        }
    }

    /// Processed offsets not yet superseded, shared with the workers
    pub fn offsets(&self) -> Arc<OffsetTable> {
        Arc::clone(&self.offsets)
    }

    /// Run until cancelled or until ingestion has finished and every queued
    /// record is processed. On cancellation in-flight records finish and
    /// queued ones are left for replay. The final offsets are flushed
    /// before returning either way.
    #[instrument(skip_all, fields(workers = self.settings.workers))]
    pub async fn run(
        self,
        handoff: HandoffReceiver<IngestionRecord>,
        token: CancellationToken,
    ) -> Result<(), CheckpointError> {
        let store = self.checkpoints.open().await?;

        let (work_tx, work_rx) = handoff::bounded(self.settings.work_queue_capacity);
        let mut tasks = JoinSet::new();
        tasks.spawn(relay(handoff, work_tx, token.clone()));

        for index in 0..self.settings.workers {
            let worker = Worker {
                index,
                classifier: self.classifier.clone(),
                reference: Arc::clone(&self.reference),
                offsets: Arc::clone(&self.offsets),
                log: DailyLogWriter::new(
                    &self.settings.log_dir,
                    self.settings.process_id,
                    index,
                    self.settings.flush_every_lines,
                ),
            };
            tasks.spawn(worker.run(work_rx.clone(), token.clone()));
        }
        drop(work_rx);
        info!("Classification pool started");

        self.heartbeat(store.as_ref(), &mut tasks, &token).await;

        while let Some(joined) = tasks.join_next().await {
            report_task(joined);
        }

        let written = self.offsets.flush(store.as_ref()).await;
        info!(written, "Final checkpoint flush");
        store.close().await;

        info!("Classification pool stopped");
        Ok(())
    }

    /// Tick until cancelled or until every pool task has exited, flushing
    /// offsets every `flush_every_ticks` ticks
    async fn heartbeat(
        &self,
        store: &dyn CheckpointStore,
        tasks: &mut JoinSet<()>,
        token: &CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        let flush_every = self.settings.flush_every_ticks.max(1);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => {
                        report_task(joined);
                        continue;
                    }
                    None => {
                        info!("Input exhausted and work queue drained");
                        break;
                    }
                },
                _ = interval.tick() => {}
            }

            ticks += 1;
            debug!(partitions = self.offsets.len(), "Classification pool alive");

            if ticks >= flush_every {
                ticks = 0;
                let written = self.offsets.flush(store).await;
                debug!(written, "Periodic checkpoint flush");
            }
        }
    }
}

fn report_task(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Pool task failed");
    }
}

async fn relay(
    handoff: HandoffReceiver<IngestionRecord>,
    work: HandoffSender<IngestionRecord>,
    token: CancellationToken,
) {
    loop {
        let record = match handoff.get(&token).await {
            Ok(record) => record,
            Err(HandoffError::Cancelled) => break,
            Err(HandoffError::Closed) => {
                info!("Ingestion finished, relay stopping");
                break;
            }
        };
        if work.put(record, &token).await.is_err() {
            break;
        }
    }
}

struct Worker {
    index: usize,
    classifier: Classifier,
    reference: Arc<ReferenceTable>,
    offsets: Arc<OffsetTable>,
    log: DailyLogWriter,
}

impl Worker {
    async fn run(mut self, queue: HandoffReceiver<IngestionRecord>, token: CancellationToken) {
        debug!(worker = self.index, "Classification worker started");

        while let Ok(record) = queue.get(&token).await {
            self.process(record).await;
        }

        if let Err(e) = self.log.close().await {
            error!(worker = self.index, error = %e, "Failed to close classification log");
        }
        debug!(worker = self.index, "Classification worker stopped");
    }

    async fn process(&mut self, record: IngestionRecord) {
        let classification = self.classifier.classify(&record.image_path).await;
        let provider = if classification.is_unknown_channel() {
            ProviderInfo::unknown()
        } else {
            self.reference.lookup(&classification.std_channel_id)
        };

        let fields = splice_fields(
            record.metadata,
            classification
                .into_fields()
                .into_iter()
                .chain(provider.into_fields()),
        );

        // Only a logged record counts as processed
        match self.log.write_line(&record.date, &fields).await {
            Ok(()) => self
                .offsets
                .record(&record.topic, record.partition, record.offset),
            Err(e) => warn!(
                worker = self.index,
                error = %e,
                partition = record.partition,
                offset = record.offset,
                "Failed to log classification"
            ),
        }
    }
}
