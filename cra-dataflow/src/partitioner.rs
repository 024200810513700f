//! # Partitioner
//!
//! Routing of records to the shards of a following shuffle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use cra_core::vertex::sharded::stable_hash;

use crate::dataset::{Dataset, Record};

/// Picks the position (0..num_partitions) a record is routed to.
pub trait Partitioner: Send + Sync {
    fn partition(&self, record: &Record, num_partitions: usize) -> usize;
}

/// Hash of a selected key. The hash is seeded identically in every process,
/// so all shards of a split route equal keys to the same place.
pub struct HashPartitioner<F> {
    key_selector: F,
}

impl<F> HashPartitioner<F>
where
    F: Fn(&Record) -> u64 + Send + Sync,
{
    pub fn new(key_selector: F) -> Self {
        Self { key_selector }
    }
}

impl HashPartitioner<fn(&Record) -> u64> {
    /// Partition on the record key.
    pub fn by_key() -> Self {
        Self::new(record_key)
    }
}

fn record_key(record: &Record) -> u64 {
    record.key
}

impl<F> Partitioner for HashPartitioner<F>
where
    F: Fn(&Record) -> u64 + Send + Sync,
{
    fn partition(&self, record: &Record, num_partitions: usize) -> usize {
        (stable_hash((self.key_selector)(record)) % num_partitions as u64) as usize
    }
}

#[derive(Default)]
pub struct RoundRobinPartitioner {
    counter: AtomicUsize,
}

impl RoundRobinPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, _record: &Record, num_partitions: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % num_partitions
    }
}

/// Split `dataset` into one fragment per shard in `shards`. Every shard gets
/// an entry, possibly empty; record order is kept within a fragment.
pub fn split_dataset(
    dataset: Dataset,
    shards: &[u32],
    partitioner: &dyn Partitioner,
) -> BTreeMap<u32, Dataset> {
    let mut fragments: BTreeMap<u32, Dataset> =
        shards.iter().map(|&shard| (shard, Dataset::default())).collect();
    if shards.is_empty() {
        return fragments;
    }
    for record in dataset.records {
        let shard = shards[partitioner.partition(&record, shards.len())];
        if let Some(fragment) = fragments.get_mut(&shard) {
            fragment.records.push(record);
        }
    }
    fragments
}

#[cfg(test)]
#[path = "tests/partitioner_tests.rs"]
mod tests;
