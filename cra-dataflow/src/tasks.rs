//! # Tasks
//!
//! The compiled form of a dataflow: one [`TaskBase`] per operator vertex,
//! serialized with bincode into the parameter of every shard.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::descriptors::OperatorInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    UnaryTransform,
    BinaryTransform,
    MoveSplit,
    MoveMerge,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformKind::UnaryTransform => "unary",
            TransformKind::BinaryTransform => "binary",
            TransformKind::MoveSplit => "move-split",
            TransformKind::MoveMerge => "move-merge",
        };
        f.write_str(name)
    }
}

/// One step applied to a dataset: the function, its declared types, the ids
/// it reads and the id it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformEntry {
    pub kind: TransformKind,
    pub function: String,
    /// Display form of a `UnaryOperatorTypes` or `BinaryOperatorTypes`.
    pub types: String,
    pub inputs: OperatorInputs,
    pub output_id: String,
}

impl TransformEntry {
    pub fn new(
        kind: TransformKind,
        function: impl Into<String>,
        types: impl Into<String>,
        inputs: OperatorInputs,
        output_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            function: function.into(),
            types: types.into(),
            inputs,
            output_id: output_id.into(),
        }
    }
}

/// Ordered list of transforms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorTransforms {
    entries: Vec<TransformEntry>,
}

impl OperatorTransforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TransformEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: &OperatorTransforms) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn entries(&self) -> &[TransformEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransformEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TransformEntry> {
        self.entries.last()
    }

    pub fn contains_output(&self, output_id: &str) -> bool {
        self.entries.iter().any(|e| e.output_id == output_id)
    }

    pub fn ends_with_split(&self) -> bool {
        self.last()
            .is_some_and(|e| e.kind == TransformKind::MoveSplit)
    }
}

impl<'a> IntoIterator for &'a OperatorTransforms {
    type Item = &'a TransformEntry;
    type IntoIter = std::slice::Iter<'a, TransformEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// A repartitioning step. The split runs on the mapper vertex, the merge on
/// the reducer vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleTask {
    /// `[split, merge]`.
    pub shuffle_transforms: [TransformEntry; 2],
    pub mapper_vertex_name: String,
    pub reducer_vertex_name: String,
}

impl ShuffleTask {
    pub fn split(&self) -> &TransformEntry {
        &self.shuffle_transforms[0]
    }

    pub fn merge(&self) -> &TransformEntry {
        &self.shuffle_transforms[1]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Produce { producer: String, types: String },
    Shuffle(ShuffleTask),
    Subscribe,
    /// The observer vertex hosted by the deploying client.
    ClientTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPattern {
    /// Shard `s` to shard `s`.
    Aligned,
    /// Every shard to every shard, one endpoint pair per peer.
    AllToAll,
    /// Every shard to the single client terminal vertex.
    Gather,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionLocality {
    #[default]
    Network,
    /// Same-instance shared-memory shortcut.
    SharedMemory,
}

/// A vertex-level edge. Shard-level endpoint names are derived from it by
/// the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConnection {
    pub from_vertex: String,
    pub from_endpoint: String,
    pub to_vertex: String,
    pub to_endpoint: String,
    pub pattern: ConnectionPattern,
    /// Feeds the secondary input of a binary transform.
    pub secondary: bool,
    pub locality: ConnectionLocality,
}

/// Vertex name to the edges touching it.
pub type VerticesConnectionsMap = BTreeMap<String, Vec<OperatorConnection>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBase {
    pub task_id: String,
    pub vertex_name: String,
    pub input_ids: OperatorInputs,
    pub output_id: String,
    pub kind: TaskKind,
    /// Transforms collected while building, before attribution.
    pub pending: OperatorTransforms,
    /// Transforms this task runs, in order.
    pub transforms: OperatorTransforms,
    /// Shuffle whose split this task runs as its last transform.
    pub secondary_shuffle_descriptor: Option<String>,
    /// Dataset read by a binary transform to the vertex streaming it in.
    pub secondary_sources: BTreeMap<String, String>,
    pub connections: VerticesConnectionsMap,
}

impl TaskBase {
    fn new(task_id: impl Into<String>, input_ids: OperatorInputs, kind: TaskKind) -> Self {
        let task_id = task_id.into();
        Self {
            vertex_name: task_id.clone(),
            output_id: task_id.clone(),
            task_id,
            input_ids,
            kind,
            pending: OperatorTransforms::new(),
            transforms: OperatorTransforms::new(),
            secondary_shuffle_descriptor: None,
            secondary_sources: BTreeMap::new(),
            connections: VerticesConnectionsMap::new(),
        }
    }

    pub fn produce(
        task_id: impl Into<String>,
        producer: impl Into<String>,
        types: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            OperatorInputs::default(),
            TaskKind::Produce {
                producer: producer.into(),
                types: types.into(),
            },
        )
    }

    /// A shuffle consuming `input`. The mapper starts out as the shuffle
    /// itself and moves to the producer once the split is attributed there.
    pub fn shuffle(
        task_id: impl Into<String>,
        input: impl Into<String>,
        split: TransformEntry,
        merge: TransformEntry,
    ) -> Self {
        let task_id = task_id.into();
        let kind = TaskKind::Shuffle(ShuffleTask {
            shuffle_transforms: [split, merge],
            mapper_vertex_name: task_id.clone(),
            reducer_vertex_name: task_id.clone(),
        });
        Self::new(task_id, OperatorInputs::unary(input), kind)
    }

    pub fn subscribe(task_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self::new(task_id, OperatorInputs::unary(input), TaskKind::Subscribe)
    }

    pub fn client_terminal(task_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self::new(task_id, OperatorInputs::unary(input), TaskKind::ClientTerminal)
    }

    pub fn shuffle_task(&self) -> Option<&ShuffleTask> {
        match &self.kind {
            TaskKind::Shuffle(shuffle) => Some(shuffle),
            _ => None,
        }
    }

    pub fn is_client_terminal(&self) -> bool {
        matches!(self.kind, TaskKind::ClientTerminal)
    }

    /// Edges touching this task's vertex.
    pub fn vertex_connections(&self) -> &[OperatorConnection] {
        self.connections
            .get(&self.vertex_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &OperatorConnection> {
        self.vertex_connections()
            .iter()
            .filter(|c| c.from_vertex == self.vertex_name)
    }

    pub fn incoming(&self) -> impl Iterator<Item = &OperatorConnection> {
        self.vertex_connections()
            .iter()
            .filter(|c| c.to_vertex == self.vertex_name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Output endpoint of `from` feeding `to`.
pub fn output_endpoint(to_task: &str) -> String {
    format!("to:{to_task}")
}

/// Output endpoint of `from` feeding the secondary input of `to`.
pub fn secondary_output_endpoint(to_task: &str) -> String {
    format!("secondary-to:{to_task}")
}

pub fn input_endpoint(from_task: &str) -> String {
    format!("from:{from_task}")
}

pub fn secondary_input_endpoint(from_task: &str) -> String {
    format!("secondary:{from_task}")
}

/// Distinguishes repeated edges between the same two tasks. The first edge
/// keeps the bare name.
pub fn nth_endpoint(endpoint: String, index: usize) -> String {
    if index == 0 {
        endpoint
    } else {
        format!("{endpoint}#{index}")
    }
}

#[cfg(test)]
#[path = "tests/tasks_tests.rs"]
mod tests;
