//! Per-partition offset checkpoints.
//!
//! A checkpoint is the offset of the last fully processed record of a
//! `(topic, partition)`. Stores are best-effort: `update` reports failure
//! instead of raising and `read` falls back to `0`, which replays the
//! partition from the earliest available record.

use crate::config::{CheckpointBackend, CheckpointConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Errors raised while opening a store. Operations on an open store never fail.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to connect to checkpoint store: {0}")]
    Connect(#[from] redis::RedisError),

    #[error("Checkpoint directory {path} unusable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing checkpoint configuration: {0}")]
    Config(String),
}

/// Field name under which an offset is stored
pub fn checkpoint_field(topic: &str, partition: i32) -> String {
    format!("{topic}_{partition}")
}

/// An open checkpoint store handle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Record `offset` for the partition. Returns false on failure.
    async fn update(&self, topic: &str, partition: i32, offset: i64) -> bool;

    /// Last recorded offset, or 0 when none exists or the read fails
    async fn read(&self, topic: &str, partition: i32) -> i64;

    async fn close(&self);
}

/// Opens store handles; each stage opens its own.
#[async_trait]
pub trait CheckpointOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn CheckpointStore>, CheckpointError>;
}

#[async_trait]
impl CheckpointOpener for CheckpointConfig {
    async fn open(&self) -> Result<Box<dyn CheckpointStore>, CheckpointError> {
        match self.backend {
            CheckpointBackend::Redis => Ok(Box::new(RedisCheckpointStore::open(self).await?)),
            CheckpointBackend::File => {
                let root = self.path.as_ref().ok_or_else(|| {
                    CheckpointError::Config("checkpoint.path".to_string())
                })?;
                Ok(Box::new(
                    FileCheckpointStore::open(root.join(&self.prefix)).await?,
                ))
            }
        }
    }
}

/// Offsets kept in one Redis hash keyed by the configured prefix
pub struct RedisCheckpointStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisCheckpointStore {
    pub async fn open(config: &CheckpointConfig) -> Result<Self, CheckpointError> {
        let client = redis::Client::open(config.redis_url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(
            host = %config.host,
            db = config.db,
            prefix = %config.prefix,
            "Checkpoint store connected"
        );

        Ok(Self {
            conn,
            prefix: config.prefix.clone(),
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn update(&self, topic: &str, partition: i32, offset: i64) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .hset(&self.prefix, checkpoint_field(topic, partition), offset)
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, topic, partition, offset, "Checkpoint update failed");
                false
            }
        }
    }

    async fn read(&self, topic: &str, partition: i32) -> i64 {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<i64>> = conn
            .hget(&self.prefix, checkpoint_field(topic, partition))
            .await;

        match result {
            Ok(offset) => offset.unwrap_or(0),
            Err(e) => {
                warn!(error = %e, topic, partition, "Checkpoint read failed, replaying from start");
                0
            }
        }
    }

    async fn close(&self) {
        debug!(prefix = %self.prefix, "Closing checkpoint store connection");
    }
}

/// One small file per partition inside a directory.
///
/// Shards own disjoint partitions, so processes sharing the directory never
/// write the same file.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| CheckpointError::Directory {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    fn file(&self, topic: &str, partition: i32) -> PathBuf {
        self.dir.join(checkpoint_field(topic, partition))
    }

    async fn write_atomic(path: &Path, offset: i64) -> std::io::Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, offset.to_string()).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn update(&self, topic: &str, partition: i32, offset: i64) -> bool {
        let path = self.file(topic, partition);
        match Self::write_atomic(&path, offset).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, path = %path.display(), offset, "Checkpoint update failed");
                false
            }
        }
    }

    async fn read(&self, topic: &str, partition: i32) -> i64 {
        let path = self.file(topic, partition);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().parse().unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "Corrupt checkpoint, replaying from start");
                0
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Checkpoint read failed, replaying from start");
                0
            }
        }
    }

    async fn close(&self) {}
}

/// In-process store. Clones share state, so a store "reopened" through
/// [`CheckpointOpener`] sees earlier updates.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    offsets: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&checkpoint_field(topic, partition))
            .copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn update(&self, topic: &str, partition: i32, offset: i64) -> bool {
        self.offsets
            .lock()
            .insert(checkpoint_field(topic, partition), offset);
        true
    }

    async fn read(&self, topic: &str, partition: i32) -> i64 {
        self.get(topic, partition).unwrap_or(0)
    }

    async fn close(&self) {}
}

#[async_trait]
impl CheckpointOpener for MemoryCheckpointStore {
    async fn open(&self) -> Result<Box<dyn CheckpointStore>, CheckpointError> {
        Ok(Box::new(self.clone()))
    }
}
