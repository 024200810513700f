//! # Function registry
//!
//! Every function a dataflow references is registered here by name, in
//! every process that compiles or hosts operators. Compiled tasks carry only
//! names and type descriptors; workers resolve them against their own
//! registry.

use std::any::type_name;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use cra_core::vertex::ShardingInfo;

use crate::dataset::{Dataset, Record};
use crate::descriptors::{BinaryOperatorTypes, UnaryOperatorTypes};
use crate::partitioner::{HashPartitioner, RoundRobinPartitioner, split_dataset};
use crate::tasks::{TransformEntry, TransformKind};

pub const BUILTIN_PREFIX: &str = "builtin::";
pub const IDENTITY: &str = "builtin::identity";
pub const MERGE_CONCAT: &str = "builtin::merge-concat";
pub const SPLIT_BY_KEY: &str = "builtin::split-by-key";
pub const SPLIT_ROUND_ROBIN: &str = "builtin::split-round-robin";

pub type ProducerFn = Arc<dyn Fn(u32, &ShardingInfo) -> Result<Dataset> + Send + Sync>;
pub type UnaryFn = Arc<dyn Fn(Dataset) -> Result<Dataset> + Send + Sync>;
pub type BinaryFn = Arc<dyn Fn(Dataset, Dataset) -> Result<Dataset> + Send + Sync>;
pub type SplitterFn = Arc<dyn Fn(Dataset, &[u32]) -> Result<BTreeMap<u32, Dataset>> + Send + Sync>;
pub type MergerFn = Arc<dyn Fn(Vec<Dataset>) -> Result<Dataset> + Send + Sync>;
pub type RekeyFn = Arc<dyn Fn(&Record) -> u64 + Send + Sync>;

#[derive(Clone)]
pub enum RegisteredFunction {
    /// Creates the initial dataset of one shard.
    Producer(ProducerFn),
    Unary(UnaryFn),
    /// Primary dataset first, secondary second.
    Binary(BinaryFn),
    /// Routes a dataset to the shards of the next shuffle.
    Splitter(SplitterFn),
    /// Combines the fragments a shuffle shard received.
    Merger(MergerFn),
    /// New key per record.
    Rekey(RekeyFn),
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisteredFunction::{}", self.kind_name())
    }
}

impl RegisteredFunction {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RegisteredFunction::Producer(_) => "producer",
            RegisteredFunction::Unary(_) => "unary",
            RegisteredFunction::Binary(_) => "binary",
            RegisteredFunction::Splitter(_) => "splitter",
            RegisteredFunction::Merger(_) => "merger",
            RegisteredFunction::Rekey(_) => "rekey",
        }
    }

    /// Whether an entry of `kind` may run this function.
    pub fn serves(&self, kind: TransformKind) -> bool {
        matches!(
            (kind, self),
            (TransformKind::UnaryTransform, RegisteredFunction::Unary(_))
                | (TransformKind::UnaryTransform, RegisteredFunction::Rekey(_))
                | (TransformKind::BinaryTransform, RegisteredFunction::Binary(_))
                | (TransformKind::MoveSplit, RegisteredFunction::Splitter(_))
                | (TransformKind::MoveMerge, RegisteredFunction::Merger(_))
        )
    }
}

#[derive(Clone)]
struct Registration {
    function: RegisteredFunction,
    types: String,
}

/// Type signature of functions over [`Dataset`] records.
pub fn record_types() -> UnaryOperatorTypes {
    UnaryOperatorTypes::uniform(
        type_name::<u64>(),
        type_name::<Vec<u8>>(),
        type_name::<Dataset>(),
    )
}

pub fn record_binary_types() -> BinaryOperatorTypes {
    BinaryOperatorTypes::uniform(
        type_name::<u64>(),
        type_name::<Vec<u8>>(),
        type_name::<Dataset>(),
    )
}

/// Named functions with their declared type descriptors. `new` includes the
/// `builtin::` functions.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Registration>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_unary(IDENTITY, |dataset| Ok(dataset));
        registry.register_merger(MERGE_CONCAT, |parts| Ok(Dataset::concat(parts)));
        registry.register_splitter(SPLIT_BY_KEY, |dataset, shards| {
            Ok(split_dataset(dataset, shards, &HashPartitioner::by_key()))
        });
        registry.register_splitter(SPLIT_ROUND_ROBIN, |dataset, shards| {
            Ok(split_dataset(dataset, shards, &RoundRobinPartitioner::new()))
        });
        registry
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without the builtins.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register `function` under `name` with an explicit type descriptor.
    /// Replaces an earlier registration of the same name.
    pub fn register(&mut self, name: impl Into<String>, function: RegisteredFunction, types: String) {
        self.functions
            .insert(name.into(), Registration { function, types });
    }

    pub fn register_producer<F>(&mut self, name: impl Into<String>, producer: F)
    where
        F: Fn(u32, &ShardingInfo) -> Result<Dataset> + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Producer(Arc::new(producer)),
            record_types().to_string(),
        );
    }

    pub fn register_unary<F>(&mut self, name: impl Into<String>, transform: F)
    where
        F: Fn(Dataset) -> Result<Dataset> + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Unary(Arc::new(transform)),
            record_types().to_string(),
        );
    }

    pub fn register_binary<F>(&mut self, name: impl Into<String>, transform: F)
    where
        F: Fn(Dataset, Dataset) -> Result<Dataset> + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Binary(Arc::new(transform)),
            record_binary_types().to_string(),
        );
    }

    pub fn register_splitter<F>(&mut self, name: impl Into<String>, splitter: F)
    where
        F: Fn(Dataset, &[u32]) -> Result<BTreeMap<u32, Dataset>> + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Splitter(Arc::new(splitter)),
            record_types().to_string(),
        );
    }

    pub fn register_merger<F>(&mut self, name: impl Into<String>, merger: F)
    where
        F: Fn(Vec<Dataset>) -> Result<Dataset> + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Merger(Arc::new(merger)),
            record_types().to_string(),
        );
    }

    pub fn register_rekey<F>(&mut self, name: impl Into<String>, rekey: F)
    where
        F: Fn(&Record) -> u64 + Send + Sync + 'static,
    {
        self.register(
            name,
            RegisteredFunction::Rekey(Arc::new(rekey)),
            record_types().to_string(),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name).map(|r| &r.function)
    }

    /// Declared type descriptor of `name`.
    pub fn types(&self, name: &str) -> Option<&str> {
        self.functions.get(name).map(|r| r.types.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Type descriptor for a new entry of `kind` running `name`.
    pub fn signature(&self, kind: TransformKind, name: &str) -> Result<String> {
        let registration = self.registration(name)?;
        if !registration.function.serves(kind) {
            return Err(anyhow!(
                "{} transform references {} function {}",
                kind,
                registration.function.kind_name(),
                name
            ));
        }
        Ok(registration.types.clone())
    }

    /// Type descriptor of a registered producer.
    pub fn producer_signature(&self, name: &str) -> Result<String> {
        let registration = self.registration(name)?;
        match registration.function {
            RegisteredFunction::Producer(_) => Ok(registration.types.clone()),
            ref other => Err(anyhow!(
                "produce references {} function {}",
                other.kind_name(),
                name
            )),
        }
    }

    /// Function an entry runs, checked against the entry's kind and declared
    /// types.
    pub fn resolve(&self, entry: &TransformEntry) -> Result<RegisteredFunction> {
        let types = self.signature(entry.kind, &entry.function)?;
        if types != entry.types {
            return Err(anyhow!(
                "function {} declares types {:?}, entry {} expects {:?}",
                entry.function,
                types,
                entry.output_id,
                entry.types
            ));
        }
        self.get(&entry.function)
            .cloned()
            .ok_or_else(|| anyhow!("unknown function: {}", entry.function))
    }

    pub fn resolve_producer(&self, name: &str, types: &str) -> Result<ProducerFn> {
        let declared = self.producer_signature(name)?;
        if declared != types {
            return Err(anyhow!(
                "producer {} declares types {:?}, task expects {:?}",
                name,
                declared,
                types
            ));
        }
        match self.get(name) {
            Some(RegisteredFunction::Producer(producer)) => Ok(producer.clone()),
            _ => Err(anyhow!("unknown producer: {}", name)),
        }
    }

    fn registration(&self, name: &str) -> Result<&Registration> {
        self.functions.get(name).ok_or_else(|| {
            if name.starts_with(BUILTIN_PREFIX) {
                anyhow!("unknown builtin function: {}", name)
            } else {
                anyhow!("unknown function: {}", name)
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
