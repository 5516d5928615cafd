//! Static assignment of stream partitions to shard processes.

use std::collections::BTreeMap;

/// Shard index → ordered partition ids. Computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    shards: BTreeMap<u32, Vec<i32>>,
    shard_count: u32,
}

impl PartitionAssignment {
    /// Assign every partition in `[start, end]` to shard `partition mod shard_count`.
    ///
    /// Shards that receive nothing are present with an empty list. A shard
    /// count of zero (rejected by config validation) yields no shards.
    pub fn compute(start: i32, end: i32, shard_count: u32) -> Self {
        if shard_count == 0 {
            return Self {
                shards: BTreeMap::new(),
                shard_count,
            };
        }

        let mut shards: BTreeMap<u32, Vec<i32>> =
            (0..shard_count).map(|index| (index, Vec::new())).collect();

        for partition in start..=end {
            let index = partition.rem_euclid(shard_count as i32) as u32;
            if let Some(partitions) = shards.get_mut(&index) {
                partitions.push(partition);
            }
        }

        Self {
            shards,
            shard_count,
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Partitions owned by one shard; empty for unknown indices
    pub fn partitions(&self, shard: u32) -> &[i32] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[i32])> {
        self.shards
            .iter()
            .map(|(index, partitions)| (*index, partitions.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_modulo_assignment() {
        let assignment = PartitionAssignment::compute(0, 7, 3);
        assert_eq!(assignment.partitions(0), &[0, 3, 6]);
        assert_eq!(assignment.partitions(1), &[1, 4, 7]);
        assert_eq!(assignment.partitions(2), &[2, 5]);
    }

    #[test]
    fn test_every_partition_assigned_exactly_once() {
        for (start, end) in [(0, 0), (0, 11), (3, 17), (10, 10), (5, 64)] {
            for shard_count in 1..9 {
                let assignment = PartitionAssignment::compute(start, end, shard_count);
                let mut seen = HashSet::new();
                for (_, partitions) in assignment.iter() {
                    for partition in partitions {
                        assert!(seen.insert(*partition), "partition {partition} assigned twice");
                    }
                }
                let expected: HashSet<i32> = (start..=end).collect();
                assert_eq!(seen, expected);
            }
        }
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let first = PartitionAssignment::compute(2, 40, 6);
        let second = PartitionAssignment::compute(2, 40, 6);
        assert_eq!(first, second);
    }

    #[test]
    fn test_more_shards_than_partitions() {
        let assignment = PartitionAssignment::compute(0, 1, 4);
        assert_eq!(assignment.shard_count(), 4);
        assert_eq!(assignment.partitions(0), &[0]);
        assert_eq!(assignment.partitions(1), &[1]);
        assert!(assignment.partitions(2).is_empty());
        assert!(assignment.partitions(3).is_empty());
        assert!(assignment.partitions(9).is_empty());
    }

    #[test]
    fn test_zero_shards_yields_empty_assignment() {
        let assignment = PartitionAssignment::compute(0, 7, 0);
        assert_eq!(assignment.shard_count(), 0);
        assert_eq!(assignment.iter().count(), 0);
        assert!(assignment.partitions(0).is_empty());
    }
}
