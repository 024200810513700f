use anyhow::{Result, anyhow};

use crate::dataset::Dataset;
use crate::registry::FunctionRegistry;

use super::base::{ShardOperator, ShardedOperatorBase};

/// Hands each shard's final dataset to the client terminal.
pub struct SubscribeOperator;

impl ShardOperator for SubscribeOperator {
    /// One primary input and one output, both over the network.
    fn validate(&self, base: &ShardedOperatorBase) -> Result<()> {
        base.reject_shared_memory(|_| true)?;
        let task = &base.task;
        let inputs = task.incoming().count();
        let outputs = task.outgoing().count();
        if inputs != 1 || outputs != 1 || base.secondary_input_count != 0 {
            return Err(anyhow!(
                "subscribe {} needs one input and one output, has {} inputs and {} outputs",
                task.task_id,
                inputs,
                outputs
            ));
        }
        Ok(())
    }

    fn source(
        &self,
        _base: &ShardedOperatorBase,
        _functions: &FunctionRegistry,
        inputs: Vec<Dataset>,
    ) -> Result<Dataset> {
        Ok(Dataset::concat(inputs))
    }
}
