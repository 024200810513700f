use anyhow::{Result, anyhow};
use cra_core::CraError;

use crate::dataset::Dataset;
use crate::registry::FunctionRegistry;
use crate::tasks::{TaskKind, TransformKind};

use super::base::{ShardOperator, ShardedOperatorBase};

/// Creates each shard's dataset with the task's producer function.
pub struct ProducerOperator;

impl ShardOperator for ProducerOperator {
    fn validate(&self, base: &ShardedOperatorBase) -> Result<()> {
        if let Some(entry) = base
            .task
            .transforms
            .iter()
            .find(|e| e.kind == TransformKind::BinaryTransform)
        {
            return Err(CraError::Unsupported(format!(
                "binary transform {} on producer {}",
                entry.output_id, base.task.task_id
            ))
            .into());
        }
        Ok(())
    }

    fn source(
        &self,
        base: &ShardedOperatorBase,
        functions: &FunctionRegistry,
        _inputs: Vec<Dataset>,
    ) -> Result<Dataset> {
        let TaskKind::Produce { producer, types } = &base.task.kind else {
            return Err(anyhow!("{} is not a produce task", base.task.task_id));
        };
        let produce = functions.resolve_producer(producer, types)?;
        produce(base.shard_id, &base.sharding)
    }
}
