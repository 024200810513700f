//! # ShardedDataset
//!
//! A dataset partitioned across the shards of a deployment, described as an
//! expression tree. Nothing runs until the tree is compiled into an
//! [`OperatorsTopology`] and deployed.
//!
//! ```text
//! ShardedDataset::produce("numbers")
//!     .transform("shift-up")
//!     .move_to(SPLIT_BY_KEY, MERGE_CONCAT)
//!     .transform("shift-up")
//! ```

use std::sync::Arc;

use anyhow::anyhow;
use cra_core::Result;
use cra_core::client::ClientLibrary;

use crate::deploy::{DeploymentDescriptor, Subscription, deploy};
use crate::descriptors::OperatorInputs;
use crate::registry::{FunctionRegistry, MERGE_CONCAT, RegisteredFunction, SPLIT_BY_KEY};
use crate::tasks::{OperatorTransforms, TaskBase, TransformEntry, TransformKind};
use crate::topology::{OperatorsTopology, merge_two_sets_of_transforms};

enum DatasetNode {
    Produce {
        producer: String,
    },
    Transform {
        input: ShardedDataset,
        function: String,
    },
    TransformBinary {
        left: ShardedDataset,
        right: ShardedDataset,
        function: String,
    },
    ReKey {
        input: ShardedDataset,
        function: String,
    },
    Move {
        input: ShardedDataset,
        splitter: String,
        merger: String,
    },
}

/// Immutable handle to a dataset expression. Cloning shares the tree.
#[derive(Clone)]
pub struct ShardedDataset {
    node: Arc<DatasetNode>,
}

/// Where a compiled subexpression left its data: the task holding it, the
/// id of the dataset value, and the transforms not yet attributed.
#[derive(Debug, Clone)]
pub struct DeployedOperand {
    pub task_id: String,
    pub output_id: String,
    pub transforms: OperatorTransforms,
    /// Tasks feeding binary transforms inside `transforms`.
    pub secondary_inputs: Vec<String>,
}

impl DeployedOperand {
    fn at(task_id: String) -> Self {
        Self {
            output_id: task_id.clone(),
            task_id,
            transforms: OperatorTransforms::new(),
            secondary_inputs: Vec::new(),
        }
    }
}

impl ShardedDataset {
    fn from_node(node: DatasetNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Dataset created on every shard by the registered producer.
    pub fn produce(producer: impl Into<String>) -> Self {
        Self::from_node(DatasetNode::Produce {
            producer: producer.into(),
        })
    }

    pub fn transform(&self, function: impl Into<String>) -> Self {
        Self::from_node(DatasetNode::Transform {
            input: self.clone(),
            function: function.into(),
        })
    }

    /// Combine shard `s` of `self` with shard `s` of `right`.
    pub fn transform_binary(&self, right: &ShardedDataset, function: impl Into<String>) -> Self {
        Self::from_node(DatasetNode::TransformBinary {
            left: self.clone(),
            right: right.clone(),
            function: function.into(),
        })
    }

    /// Replace every record key using a registered rekey function.
    pub fn re_key(&self, function: impl Into<String>) -> Self {
        Self::from_node(DatasetNode::ReKey {
            input: self.clone(),
            function: function.into(),
        })
    }

    /// Repartition: every shard splits its data with `splitter`, every shard
    /// merges what it received with `merger`.
    pub fn move_to(&self, splitter: impl Into<String>, merger: impl Into<String>) -> Self {
        Self::from_node(DatasetNode::Move {
            input: self.clone(),
            splitter: splitter.into(),
            merger: merger.into(),
        })
    }

    /// Repartition by record key.
    pub fn shuffle_by_key(&self) -> Self {
        self.move_to(SPLIT_BY_KEY, MERGE_CONCAT)
    }

    /// Compile into a prepared topology ending in a subscribe task and the
    /// client terminal.
    pub fn compile(&self, functions: &FunctionRegistry) -> Result<OperatorsTopology> {
        let mut topology = OperatorsTopology::new();
        let operand = self.deploy_operand(&mut topology, functions)?;

        let subscribe_id = topology.next_id("subscribe");
        let mut subscribe = TaskBase::subscribe(&subscribe_id, &operand.output_id);
        subscribe.pending = operand.transforms.clone();
        topology.add_operator_base(subscribe)?;
        attach(&mut topology, &subscribe_id, &operand)?;

        let client_id = topology.next_id("client");
        topology.add_operator_base(TaskBase::client_terminal(&client_id, &subscribe_id))?;
        topology.add_operator_input(&client_id, &subscribe_id)?;
        topology.add_operator_output(&subscribe_id, &client_id)?;

        topology.prepare_final_operators_tasks()?;
        tracing::debug!("compiled topology with {} tasks", topology.tasks().len());
        Ok(topology)
    }

    /// Compile and deploy.
    pub async fn deploy(
        &self,
        client: &ClientLibrary,
        functions: Arc<FunctionRegistry>,
        descriptor: DeploymentDescriptor,
    ) -> Result<Subscription> {
        let topology = self.compile(&functions)?;
        deploy(topology, client, descriptor).await
    }

    /// Operand-first: inputs are compiled before the node itself, left
    /// before right.
    fn deploy_operand(
        &self,
        topology: &mut OperatorsTopology,
        functions: &FunctionRegistry,
    ) -> anyhow::Result<DeployedOperand> {
        match self.node.as_ref() {
            DatasetNode::Produce { producer } => {
                let types = functions.producer_signature(producer)?;
                let id = topology.next_id("produce");
                topology.add_operator_base(TaskBase::produce(&id, producer, types))?;
                Ok(DeployedOperand::at(id))
            }
            DatasetNode::Transform { input, function } => {
                let operand = input.deploy_operand(topology, functions)?;
                let id = topology.next_id("transform");
                unary(topology, functions, operand, function, id)
            }
            DatasetNode::ReKey { input, function } => {
                if !matches!(functions.get(function), Some(RegisteredFunction::Rekey(_))) {
                    return Err(anyhow!("re_key references non-rekey function {}", function));
                }
                let operand = input.deploy_operand(topology, functions)?;
                let id = topology.next_id("rekey");
                unary(topology, functions, operand, function, id)
            }
            DatasetNode::TransformBinary {
                left,
                right,
                function,
            } => {
                let left = left.deploy_operand(topology, functions)?;
                let right = right.deploy_operand(topology, functions)?;
                let types = functions.signature(TransformKind::BinaryTransform, function)?;
                let id = topology.next_id("transform");
                topology.add_dataset_origin(&id, &left.task_id)?;

                let mut transforms = merge_two_sets_of_transforms(&left.transforms, &right.transforms);
                transforms.push(TransformEntry::new(
                    TransformKind::BinaryTransform,
                    function,
                    types,
                    OperatorInputs::binary(&left.output_id, &right.output_id),
                    &id,
                ));
                let mut secondary_inputs = left.secondary_inputs;
                secondary_inputs.extend(right.secondary_inputs);
                secondary_inputs.push(right.task_id);
                Ok(DeployedOperand {
                    task_id: left.task_id,
                    output_id: id,
                    transforms,
                    secondary_inputs,
                })
            }
            DatasetNode::Move {
                input,
                splitter,
                merger,
            } => {
                let operand = input.deploy_operand(topology, functions)?;
                let split_types = functions.signature(TransformKind::MoveSplit, splitter)?;
                let merge_types = functions.signature(TransformKind::MoveMerge, merger)?;
                let id = topology.next_id("move");
                let split = TransformEntry::new(
                    TransformKind::MoveSplit,
                    splitter,
                    split_types,
                    OperatorInputs::unary(&operand.output_id),
                    format!("{id}/split"),
                );
                let merge = TransformEntry::new(
                    TransformKind::MoveMerge,
                    merger,
                    merge_types,
                    OperatorInputs::unary(&split.output_id),
                    &id,
                );

                let mut shuffle = TaskBase::shuffle(&id, &operand.output_id, split.clone(), merge);
                shuffle.pending = operand.transforms.clone();
                shuffle.pending.push(split.clone());
                topology.add_shuffle_operator(shuffle, &operand.task_id)?;
                topology.add_dataset_origin(&split.output_id, &operand.task_id)?;
                for secondary in &operand.secondary_inputs {
                    topology.add_operator_secondary_input(&id, secondary)?;
                    topology.add_operator_output(secondary, &id)?;
                }
                Ok(DeployedOperand::at(id))
            }
        }
    }
}

fn unary(
    topology: &mut OperatorsTopology,
    functions: &FunctionRegistry,
    mut operand: DeployedOperand,
    function: &str,
    id: String,
) -> anyhow::Result<DeployedOperand> {
    let types = functions.signature(TransformKind::UnaryTransform, function)?;
    topology.add_dataset_origin(&id, &operand.task_id)?;
    operand.transforms.push(TransformEntry::new(
        TransformKind::UnaryTransform,
        function,
        types,
        OperatorInputs::unary(&operand.output_id),
        &id,
    ));
    operand.output_id = id;
    Ok(operand)
}

/// Wire a terminal task to the operand it consumes.
fn attach(
    topology: &mut OperatorsTopology,
    task_id: &str,
    operand: &DeployedOperand,
) -> anyhow::Result<()> {
    topology.add_operator_input(task_id, &operand.task_id)?;
    topology.add_operator_output(&operand.task_id, task_id)?;
    for secondary in &operand.secondary_inputs {
        topology.add_operator_secondary_input(task_id, secondary)?;
        topology.add_operator_output(secondary, task_id)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/sharded_dataset_tests.rs"]
mod tests;
