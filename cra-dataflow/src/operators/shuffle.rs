use anyhow::{Result, anyhow};

use crate::dataset::Dataset;
use crate::registry::{FunctionRegistry, RegisteredFunction};

use super::base::{ShardOperator, ShardedOperatorBase};

/// Reducer side of a shuffle: merges the fragments every upstream shard
/// routed here.
pub struct ShuffleOperator;

impl ShardOperator for ShuffleOperator {
    fn validate(&self, base: &ShardedOperatorBase) -> Result<()> {
        if base.task.shuffle_task().is_none() {
            return Err(anyhow!("{} is not a shuffle task", base.task.task_id));
        }
        if base.input_count == 0 {
            return Err(anyhow!("shuffle {} has no inputs", base.task.task_id));
        }
        base.reject_shared_memory(|c| c.secondary && c.to_vertex == base.task.vertex_name)?;
        Ok(())
    }

    fn source(
        &self,
        base: &ShardedOperatorBase,
        functions: &FunctionRegistry,
        inputs: Vec<Dataset>,
    ) -> Result<Dataset> {
        let shuffle = base
            .task
            .shuffle_task()
            .ok_or_else(|| anyhow!("{} is not a shuffle task", base.task.task_id))?;
        match functions.resolve(shuffle.merge())? {
            RegisteredFunction::Merger(merge) => merge(inputs),
            other => Err(anyhow!(
                "shuffle {} merges with {} function {}",
                base.task.task_id,
                other.kind_name(),
                shuffle.merge().function
            )),
        }
    }
}
