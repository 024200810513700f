//! # OperatorsTopology
//!
//! The operator graph a [`ShardedDataset`](crate::sharded_dataset::ShardedDataset)
//! compiles into.
//!
//! While building, the transforms between two task boundaries are parked in
//! the `pending` list of the consuming task.
//! [`prepare_final_operators_tasks`](OperatorsTopology::prepare_final_operators_tasks)
//! then moves each of them to the task producing its root input, so that
//! every transform runs where its data already is. The vertex-level edges
//! are derived afterwards.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::tasks::{
    ConnectionLocality, ConnectionPattern, OperatorConnection, OperatorTransforms, TaskBase,
    TaskKind, TransformKind, input_endpoint, nth_endpoint, output_endpoint,
    secondary_input_endpoint, secondary_output_endpoint,
};

/// Fan-in and fan-out of one task. Counts are multiplicities: the same peer
/// may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorEndpointsDescriptor {
    pub from_inputs: BTreeMap<String, usize>,
    pub secondary_from_inputs: BTreeMap<String, usize>,
    pub to_outputs: BTreeMap<String, usize>,
}

impl OperatorEndpointsDescriptor {
    pub fn input_count(&self) -> usize {
        self.from_inputs.values().sum()
    }

    pub fn secondary_input_count(&self) -> usize {
        self.secondary_from_inputs.values().sum()
    }

    pub fn output_count(&self) -> usize {
        self.to_outputs.values().sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorsTopology {
    operators: BTreeMap<String, OperatorEndpointsDescriptor>,
    /// Creation order. Producers always precede their consumers.
    tasks: Vec<TaskBase>,
    /// Dataset id to the task whose output it derives from.
    origins: BTreeMap<String, String>,
    next_id: usize,
    prepared: bool,
}

impl OperatorsTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id of the form `{prefix}-{n}`. Ids are unique within one
    /// topology regardless of prefix.
    pub fn next_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a task. Its output id becomes a dataset originating at it.
    pub fn add_operator_base(&mut self, task: TaskBase) -> Result<()> {
        if self.operators.contains_key(&task.task_id) {
            return Err(anyhow!("task {} already exists", task.task_id));
        }
        self.operators
            .insert(task.task_id.clone(), OperatorEndpointsDescriptor::default());
        self.origins
            .insert(task.output_id.clone(), task.task_id.clone());
        self.tasks.push(task);
        Ok(())
    }

    pub fn add_operator_input(&mut self, task_id: &str, from_id: &str) -> Result<()> {
        self.require(from_id)?;
        *self
            .descriptor_mut(task_id)?
            .from_inputs
            .entry(from_id.to_string())
            .or_default() += 1;
        Ok(())
    }

    pub fn add_operator_secondary_input(&mut self, task_id: &str, from_id: &str) -> Result<()> {
        self.require(from_id)?;
        *self
            .descriptor_mut(task_id)?
            .secondary_from_inputs
            .entry(from_id.to_string())
            .or_default() += 1;
        Ok(())
    }

    pub fn add_operator_output(&mut self, task_id: &str, to_id: &str) -> Result<()> {
        self.require(to_id)?;
        *self
            .descriptor_mut(task_id)?
            .to_outputs
            .entry(to_id.to_string())
            .or_default() += 1;
        Ok(())
    }

    /// Register a shuffle fed by `producer_id`, wiring both directions.
    pub fn add_shuffle_operator(&mut self, task: TaskBase, producer_id: &str) -> Result<()> {
        if task.shuffle_task().is_none() {
            return Err(anyhow!("task {} is not a shuffle", task.task_id));
        }
        self.require(producer_id)?;
        let task_id = task.task_id.clone();
        self.add_operator_base(task)?;
        self.add_operator_input(&task_id, producer_id)?;
        self.add_operator_output(producer_id, &task_id)
    }

    /// Record that `dataset_id` derives from the output of `task_id`.
    pub fn add_dataset_origin(&mut self, dataset_id: &str, task_id: &str) -> Result<()> {
        self.require(task_id)?;
        self.origins
            .insert(dataset_id.to_string(), task_id.to_string());
        Ok(())
    }

    pub fn origin_of(&self, dataset_id: &str) -> Option<&str> {
        self.origins.get(dataset_id).map(String::as_str)
    }

    /// Move one secondary fan-in of `secondary_id` from `old_consumer` to
    /// `new_consumer`, on both the consumer and the producer side.
    pub fn update_operators_secondary_input(
        &mut self,
        secondary_id: &str,
        old_consumer: &str,
        new_consumer: &str,
    ) -> Result<()> {
        self.require(new_consumer)?;
        take_one(
            &mut self.descriptor_mut(old_consumer)?.secondary_from_inputs,
            secondary_id,
        )
        .ok_or_else(|| anyhow!("{} has no secondary input from {}", old_consumer, secondary_id))?;
        *self
            .descriptor_mut(new_consumer)?
            .secondary_from_inputs
            .entry(secondary_id.to_string())
            .or_default() += 1;

        let outputs = &mut self.descriptor_mut(secondary_id)?.to_outputs;
        take_one(outputs, old_consumer)
            .ok_or_else(|| anyhow!("{} has no output to {}", secondary_id, old_consumer))?;
        *outputs.entry(new_consumer.to_string()).or_default() += 1;
        Ok(())
    }

    /// Attribute every pending transform and derive the vertex edges.
    ///
    /// Tasks are visited once, last to first. An entry moves to the task
    /// producing its root input, unless that task's last transform is already
    /// a split: a transform never crosses a shuffle boundary. Calling this a
    /// second time is an error.
    pub fn prepare_final_operators_tasks(&mut self) -> Result<()> {
        if self.prepared {
            return Err(anyhow!("topology already prepared"));
        }
        let index: BTreeMap<String, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_id.clone(), i))
            .collect();

        for consumer in (0..self.tasks.len()).rev() {
            let consumer_id = self.tasks[consumer].task_id.clone();
            let pending = self.tasks[consumer].pending.clone();
            for entry in pending.iter() {
                let root = self.root_of(entry.inputs.input_id1.as_deref())?;
                let producer = *index
                    .get(&root)
                    .ok_or_else(|| anyhow!("unknown task {}", root))?;
                let target = if producer == consumer
                    || self.tasks[producer].transforms.ends_with_split()
                {
                    consumer
                } else {
                    producer
                };
                let moved = target != consumer;
                self.tasks[target].transforms.push(entry.clone());

                match entry.kind {
                    TransformKind::MoveSplit if moved => {
                        let own_split = matches!(
                            &self.tasks[consumer].kind,
                            TaskKind::Shuffle(shuffle) if shuffle.split().output_id == entry.output_id
                        );
                        if own_split {
                            let producer_vertex = self.tasks[producer].vertex_name.clone();
                            self.tasks[producer].secondary_shuffle_descriptor =
                                Some(consumer_id.clone());
                            if let TaskKind::Shuffle(shuffle) = &mut self.tasks[consumer].kind {
                                shuffle.mapper_vertex_name = producer_vertex;
                            }
                        }
                    }
                    TransformKind::BinaryTransform => {
                        let dataset = entry
                            .inputs
                            .input_id2
                            .clone()
                            .ok_or_else(|| anyhow!("binary {} without a secondary input", entry.output_id))?;
                        let secondary = self.root_of(Some(&dataset))?;
                        let source_vertex = index
                            .get(&secondary)
                            .map(|&i| self.tasks[i].vertex_name.clone())
                            .ok_or_else(|| anyhow!("unknown task {}", secondary))?;
                        if moved {
                            self.update_operators_secondary_input(&secondary, &consumer_id, &root)?;
                        }
                        self.tasks[target]
                            .secondary_sources
                            .insert(dataset, source_vertex);
                    }
                    _ => {}
                }
            }
        }

        self.build_connections();
        self.prepared = true;
        Ok(())
    }

    fn build_connections(&mut self) {
        let mut edges = Vec::new();
        for consumer in &self.tasks {
            let Some(descriptor) = self.operators.get(&consumer.task_id) else {
                continue;
            };
            for (from, &count) in &descriptor.from_inputs {
                let Some(producer) = self.task(from) else {
                    continue;
                };
                let pattern = if consumer.is_client_terminal() {
                    ConnectionPattern::Gather
                } else if producer.secondary_shuffle_descriptor.as_deref()
                    == Some(consumer.task_id.as_str())
                {
                    ConnectionPattern::AllToAll
                } else {
                    ConnectionPattern::Aligned
                };
                for k in 0..count {
                    edges.push(OperatorConnection {
                        from_vertex: producer.vertex_name.clone(),
                        from_endpoint: nth_endpoint(output_endpoint(&consumer.task_id), k),
                        to_vertex: consumer.vertex_name.clone(),
                        to_endpoint: nth_endpoint(input_endpoint(&producer.task_id), k),
                        pattern,
                        secondary: false,
                        locality: ConnectionLocality::Network,
                    });
                }
            }
            for (from, &count) in &descriptor.secondary_from_inputs {
                let Some(producer) = self.task(from) else {
                    continue;
                };
                for k in 0..count {
                    edges.push(OperatorConnection {
                        from_vertex: producer.vertex_name.clone(),
                        from_endpoint: nth_endpoint(
                            secondary_output_endpoint(&consumer.task_id),
                            k,
                        ),
                        to_vertex: consumer.vertex_name.clone(),
                        to_endpoint: nth_endpoint(secondary_input_endpoint(&producer.task_id), k),
                        pattern: ConnectionPattern::Aligned,
                        secondary: true,
                        locality: ConnectionLocality::Network,
                    });
                }
            }
        }

        for task in &mut self.tasks {
            let touching: Vec<OperatorConnection> = edges
                .iter()
                .filter(|e| e.from_vertex == task.vertex_name || e.to_vertex == task.vertex_name)
                .cloned()
                .collect();
            task.connections.clear();
            task.connections.insert(task.vertex_name.clone(), touching);
        }
    }

    fn root_of(&self, dataset_id: Option<&str>) -> Result<String> {
        let dataset_id = dataset_id.ok_or_else(|| anyhow!("transform without a primary input"))?;
        self.origin_of(dataset_id)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("dataset {} has no producing task", dataset_id))
    }

    /// Rename every vertex to `{prefix}-{vertex}` and rebuild the edges, so
    /// that several deployments share one metadata namespace. Task ids and
    /// endpoint names keep their compiled form.
    pub fn namespace_vertices(&mut self, prefix: &str) -> Result<()> {
        if !self.prepared {
            return Err(anyhow!("topology is not prepared"));
        }
        let renamed: BTreeMap<String, String> = self
            .tasks
            .iter()
            .map(|t| (t.vertex_name.clone(), format!("{prefix}-{}", t.vertex_name)))
            .collect();
        let rename = |name: &mut String| {
            if let Some(new) = renamed.get(name.as_str()) {
                *name = new.clone();
            }
        };
        for task in &mut self.tasks {
            rename(&mut task.vertex_name);
            if let TaskKind::Shuffle(shuffle) = &mut task.kind {
                rename(&mut shuffle.mapper_vertex_name);
                rename(&mut shuffle.reducer_vertex_name);
            }
            for source in task.secondary_sources.values_mut() {
                rename(source);
            }
        }
        self.build_connections();
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn tasks(&self) -> &[TaskBase] {
        &self.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskBase> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskBase> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn descriptor(&self, task_id: &str) -> Option<&OperatorEndpointsDescriptor> {
        self.operators.get(task_id)
    }

    /// Every vertex-level edge, each listed once.
    pub fn connections(&self) -> Vec<&OperatorConnection> {
        self.tasks
            .iter()
            .flat_map(|t| t.outgoing())
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn require(&self, task_id: &str) -> Result<()> {
        if self.operators.contains_key(task_id) {
            Ok(())
        } else {
            Err(anyhow!("unknown task {}", task_id))
        }
    }

    fn descriptor_mut(&mut self, task_id: &str) -> Result<&mut OperatorEndpointsDescriptor> {
        self.operators
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown task {}", task_id))
    }
}

/// Union of two transform lists: every entry of `left`, then the entries of
/// `right` with an output id not already present.
pub fn merge_two_sets_of_transforms(
    left: &OperatorTransforms,
    right: &OperatorTransforms,
) -> OperatorTransforms {
    let mut merged = left.clone();
    for entry in right {
        if !merged.contains_output(&entry.output_id) {
            merged.push(entry.clone());
        }
    }
    merged
}

fn take_one(counts: &mut BTreeMap<String, usize>, key: &str) -> Option<()> {
    let count = counts.get_mut(key)?;
    *count -= 1;
    if *count == 0 {
        counts.remove(key);
    }
    Some(())
}

#[cfg(test)]
#[path = "tests/topology_tests.rs"]
mod tests;
