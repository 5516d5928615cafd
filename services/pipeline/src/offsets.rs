//! In-memory table of processed offsets, shared by the classification workers
//! and the checkpoint flush.

use crate::checkpoint::CheckpointStore;
use crate::config::OffsetPolicy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Offsets keyed by `(topic, partition)`.
///
/// The lock is held for one map operation at a time; flushing works on a
/// snapshot so no store I/O happens under it.
#[derive(Debug)]
pub struct OffsetTable {
    policy: OffsetPolicy,
    offsets: Mutex<BTreeMap<(String, i32), i64>>,
}

impl OffsetTable {
    pub fn new(policy: OffsetPolicy) -> Self {
        Self {
            policy,
            offsets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record that `offset` of the partition has been fully processed.
    ///
    /// Workers finish out of order. Under [`OffsetPolicy::Max`] an older
    /// offset never replaces a newer one; under [`OffsetPolicy::LastWrite`]
    /// it does, and the checkpoint may move backwards until the next write.
    pub fn record(&self, topic: &str, partition: i32, offset: i64) {
        let mut offsets = self.offsets.lock();
        match offsets.get_mut(&(topic.to_string(), partition)) {
            Some(current) => match self.policy {
                OffsetPolicy::Max => *current = (*current).max(offset),
                OffsetPolicy::LastWrite => *current = offset,
            },
            None => {
                offsets.insert((topic.to_string(), partition), offset);
            }
        }
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, i32, i64)> {
        self.offsets
            .lock()
            .iter()
            .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
            .collect()
    }

    /// Write every entry to the store. Failed entries stay in the table and
    /// are written again by the next flush. Returns the number written.
    pub async fn flush(&self, store: &dyn CheckpointStore) -> usize {
        let snapshot = self.snapshot();
        let mut written = 0;

        for (topic, partition, offset) in &snapshot {
            if store.update(topic, *partition, *offset).await {
                written += 1;
            } else {
                warn!(topic = %topic, partition, offset, "Checkpoint not saved, will retry on next flush");
            }
        }

        debug!(written, total = snapshot.len(), "Checkpoint table flushed");
        written
    }
}
