//! Chanscan pipeline - partitioned image stream ingestion and channel
//! classification
//!
//! Set-top boxes publish screenshots to a partitioned Kafka topic. This
//! library consumes them, archives every image on disk, classifies it
//! against an external recognition service and writes per-day
//! classification logs, checkpointing consumed offsets so that a restart
//! resumes where the previous run stopped.
//!
//! - [`orchestrator`] splits the partition range over shard processes
//! - [`shard`] runs the two stages of one process:
//!   [`ingest::IngestionStage`] and [`pool::ClassificationPool`], joined
//!   by a bounded [`handoff`] queue
//! - [`checkpoint`] stores offsets in Redis or on disk
//!
//! # Example
//!
//! ```rust,no_run
//! use chanscan_pipeline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     Orchestrator::new(&config, None)?.run().await
//! }
//! ```

pub mod archive;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod daily_log;
pub mod handoff;
pub mod ingest;
pub mod message;
pub mod offsets;
pub mod orchestrator;
pub mod pool;
pub mod reference;
pub mod shard;
pub mod sharding;
pub mod signals;
pub mod telemetry;

// Re-export main types
pub use checkpoint::{
    CheckpointError, CheckpointOpener, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, RedisCheckpointStore,
};
pub use classifier::{ClassificationResult, Classifier, ClassifyError};
pub use config::{Config, ConfigError, OffsetPolicy};
pub use consumer::{KafkaSource, MemorySource, ResumePosition, StreamError, StreamRecord, StreamSource};
pub use ingest::{IngestError, IngestionRecord, IngestionStage, StageState};
pub use orchestrator::Orchestrator;
pub use pool::{ClassificationPool, PoolSettings};
pub use reference::{ProviderInfo, ReferenceEntry, ReferenceTable};
pub use sharding::PartitionAssignment;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointOpener, CheckpointStore, MemoryCheckpointStore};
    pub use crate::config::Config;
    pub use crate::consumer::{MemorySource, StreamRecord, StreamSource};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::reference::ReferenceTable;
    pub use crate::shard::{run_shard, run_shard_process};
    pub use crate::sharding::PartitionAssignment;
}
