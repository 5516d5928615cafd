//! One shard process: an ingestion stage and a classification pool over
//! the shard's partitions, each on its own thread with its own
//! single-threaded runtime, joined by the bounded handoff queue.

use crate::archive::ArchiveWriter;
use crate::checkpoint::CheckpointOpener;
use crate::classifier::Classifier;
use crate::config::Config;
use crate::consumer::{KafkaSource, StreamSource};
use crate::handoff;
use crate::ingest::IngestionStage;
use crate::pool::{ClassificationPool, PoolSettings};
use crate::reference::ReferenceTable;
use crate::sharding::PartitionAssignment;
use crate::signals::{cancel_on_stdin_eof, shutdown_signal};
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

/// Entry point of a shard process
#[instrument(skip(config), fields(shard = index))]
pub async fn run_shard_process(config: Config, index: u32, stop_on_stdin_eof: bool) -> Result<()> {
    let assignment = PartitionAssignment::compute(
        config.kafka.partition_start,
        config.kafka.partition_end,
        config.orchestrator.process_num,
    );
    let partitions = assignment.partitions(index).to_vec();
    if partitions.is_empty() {
        warn!("No partitions assigned to this shard");
        return Ok(());
    }
    info!(?partitions, "Starting shard");

    let reference = ReferenceTable::load(&config.reference)
        .await
        .context("Failed to load channel reference table")?;
    let source = KafkaSource::new(&config.kafka).context("Failed to create stream consumer")?;
    let checkpoints: Arc<dyn CheckpointOpener> = Arc::new(config.checkpoint.clone());

    let token = CancellationToken::new();
    if stop_on_stdin_eof {
        cancel_on_stdin_eof(token.clone()).context("Failed to watch stdin")?;
    }

    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => signal_token.cancel(),
            _ = signal_token.cancelled() => {}
        }
    });

    run_shard(
        &config,
        partitions,
        source,
        checkpoints,
        Arc::new(reference),
        token,
    )
    .await
}

/// Run both stages of a shard until `token` is cancelled, a stage fails,
/// or the stream ends and the pool has drained. A stage that fails or
/// panics cancels the token so its sibling stops too.
pub async fn run_shard<S>(
    config: &Config,
    partitions: Vec<i32>,
    source: S,
    checkpoints: Arc<dyn CheckpointOpener>,
    reference: Arc<ReferenceTable>,
    token: CancellationToken,
) -> Result<()>
where
    S: StreamSource + 'static,
{
    let classifier = Classifier::new(&config.classifier).context("Failed to build classifier client")?;
    let ingestion = IngestionStage::new(
        config.kafka.topic.clone(),
        partitions,
        source,
        ArchiveWriter::new(&config.archive),
        config.archive.metadata_fields.clone(),
        Arc::clone(&checkpoints),
    );
    let pool = ClassificationPool::new(
        PoolSettings::from_config(config),
        classifier,
        reference,
        checkpoints,
    );

    let (handoff_tx, handoff_rx) = handoff::bounded(config.classifier.queue_capacity);
    let span = tracing::Span::current();

    let ingest_thread = spawn_stage("ingest", token.clone(), {
        let span = span.clone();
        move |token| ingestion.run(handoff_tx, token).instrument(span)
    })?;
    let classify_thread = spawn_stage("classify", token.clone(), move |token| {
        pool.run(handoff_rx, token).instrument(span)
    })?;

    let (ingest, classify) = tokio::task::spawn_blocking(move || {
        (join_stage("ingest", ingest_thread), join_stage("classify", classify_thread))
    })
    .await
    .context("Failed to join shard stages")?;

    info!("Shard stopped");
    ingest.and(classify)
}

fn spawn_stage<F, Fut, E>(
    name: &str,
    token: CancellationToken,
    stage: F,
) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>>,
    E: Into<anyhow::Error>,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            // Fires on error and on panic; disarmed on a clean return
            let stop_sibling = token.clone().drop_guard();

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .with_context(|| format!("Failed to build {thread_name} runtime"))?;

            let result = runtime.block_on(stage(token)).map_err(Into::into);
            match &result {
                Ok(()) => {
                    let _ = stop_sibling.disarm();
                }
                Err(e) => error!(stage = %thread_name, error = %e, "Stage failed"),
            }
            result
        })
        .with_context(|| format!("Failed to spawn {name} thread"))
}

fn join_stage(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("{name} stage panicked"))?
        .with_context(|| format!("{name} stage failed"))
}
