use std::collections::HashMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::metadata::ShardedVertexInfo;

/// Separator between a sharded vertex name and its shard id.
pub const SHARD_SEPARATOR: char = '$';

pub const MODULO_LOCATOR: &str = "builtin::modulo";
pub const HASH_LOCATOR: &str = "builtin::hash";

pub fn shard_vertex_name(vertex: &str, shard: u32) -> String {
    format!("{vertex}{SHARD_SEPARATOR}{shard}")
}

/// Inverse of [`shard_vertex_name`].
pub fn split_shard_vertex_name(name: &str) -> Option<(&str, u32)> {
    let (vertex, shard) = name.rsplit_once(SHARD_SEPARATOR)?;
    Some((vertex, shard.parse().ok()?))
}

/// Output endpoint of an all-to-all link feeding `to_shard`.
pub fn all_to_all_output(endpoint: &str, to_shard: u32) -> String {
    format!("{endpoint}{SHARD_SEPARATOR}{to_shard}")
}

/// Input endpoint of an all-to-all link fed by `from_shard`.
pub fn all_to_all_input(endpoint: &str, from_shard: u32) -> String {
    format!("{endpoint}{SHARD_SEPARATOR}{from_shard}")
}

/// Placement view handed to every shard of a sharded vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingInfo {
    pub all_shards: Vec<u32>,
    pub added_shards: Vec<u32>,
    pub removed_shards: Vec<u32>,
    pub shard_locator: String,
}

impl ShardingInfo {
    pub fn new(all_shards: Vec<u32>) -> Self {
        Self {
            added_shards: all_shards.clone(),
            all_shards,
            removed_shards: Vec::new(),
            shard_locator: MODULO_LOCATOR.to_string(),
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.shard_locator = locator.into();
        self
    }

    pub fn shard_count(&self) -> usize {
        self.all_shards.len()
    }

    pub fn from_epoch(epoch: &ShardedVertexInfo) -> Self {
        Self {
            all_shards: epoch.shard_ids(),
            added_shards: epoch.added_shards.clone(),
            removed_shards: epoch.removed_shards.clone(),
            shard_locator: epoch.shard_locator.clone(),
        }
    }
}

/// Vertex parameter of one shard: its id, the placement, and the opaque
/// parameter of the sharded vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedVertexParameter {
    pub shard_id: u32,
    pub sharding: ShardingInfo,
    pub parameter: Vec<u8>,
}

impl ShardedVertexParameter {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Maps a key to a position in `0..shard_count`.
pub type ShardLocatorFn = fn(u64, usize) -> usize;

/// Named shard locators. Every process registers the same names, so the
/// name stored in a [`ShardedVertexInfo`] resolves identically everywhere.
#[derive(Clone)]
pub struct ShardLocatorRegistry {
    locators: HashMap<String, ShardLocatorFn>,
}

impl Default for ShardLocatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            locators: HashMap::new(),
        };
        registry.register(MODULO_LOCATOR, modulo_locator);
        registry.register(HASH_LOCATOR, hash_locator);
        registry
    }
}

impl ShardLocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, locator: ShardLocatorFn) {
        self.locators.insert(name.into(), locator);
    }

    /// Shard id owning `key` under `sharding`.
    pub fn locate(&self, sharding: &ShardingInfo, key: u64) -> Result<u32> {
        let locator = self
            .locators
            .get(&sharding.shard_locator)
            .ok_or_else(|| anyhow!("unknown shard locator {}", sharding.shard_locator))?;
        if sharding.all_shards.is_empty() {
            return Err(anyhow!("sharding has no shards"));
        }
        let index = locator(key, sharding.all_shards.len());
        sharding
            .all_shards
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("locator {} out of range", sharding.shard_locator))
    }
}

fn modulo_locator(key: u64, shard_count: usize) -> usize {
    (key % shard_count as u64) as usize
}

/// Stable across processes: fixed seeds, not the per-process random state.
///
/// ahash output is only reproducible for one crate version and one target
/// feature set (AES or fallback), so every process of a cluster must run the
/// same build. The workspace pins the ahash version for this.
pub fn stable_hash(key: u64) -> u64 {
    ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
    .hash_one(key)
}

fn hash_locator(key: u64, shard_count: usize) -> usize {
    (stable_hash(key) % shard_count as u64) as usize
}
