use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

/// Round-robin placement of shards over instances. The cursor carries over
/// between calls, so consecutive tasks start on different instances.
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    cursor: usize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign every shard to an instance.
    ///
    /// Returns `(instance, shards)` for each instance that got at least one
    /// shard, in `instances` order.
    pub fn place(
        &mut self,
        shards: &[u32],
        instances: &[String],
    ) -> Result<Vec<(String, Vec<u32>)>> {
        if shards.is_empty() {
            return Ok(Vec::new());
        }
        if instances.is_empty() {
            return Err(anyhow!("no instances to place {} shards on", shards.len()));
        }

        let mut assigned: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for &shard in shards {
            let idx = self.cursor % instances.len();
            assigned.entry(idx).or_default().push(shard);
            self.cursor = (idx + 1) % instances.len();
        }

        Ok(assigned
            .into_iter()
            .map(|(idx, shards)| (instances[idx].clone(), shards))
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
