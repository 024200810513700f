//! Vertices running compiled tasks.
//!
//! Every shard of a Produce, Shuffle or Subscribe task is a
//! [`ShardedOperatorVertex`]; the vertex picks its behavior from the task it
//! is parameterized with. The client terminal runs as a
//! [`SubscribeClientVertex`] inside the deploying process.

pub mod base;
pub mod latch;
pub mod producer;
pub mod shuffle;
pub mod subscribe;
pub mod subscribe_client;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cra_core::CraError;
use cra_core::vertex::{
    ShardedVertexParameter, ShardingInfo, Vertex, VertexContext, VertexRegistry,
};

pub use base::{ShardOperator, ShardRun, ShardedOperatorBase};
pub use latch::CountdownLatch;
pub use producer::ProducerOperator;
pub use shuffle::ShuffleOperator;
pub use subscribe::SubscribeOperator;
pub use subscribe_client::{ClientTerminalParameter, SubscribeClientVertex};

use crate::registry::FunctionRegistry;
use crate::tasks::{TaskBase, TaskKind};

/// Create action of sharded operator vertices.
pub const SHARDED_OPERATOR: &str = "cra::sharded-operator";
/// Create action of the client terminal.
pub const SUBSCRIBE_CLIENT: &str = "cra::subscribe-client";

pub struct ShardedOperatorVertex {
    functions: Arc<FunctionRegistry>,
    run: Option<ShardRun>,
}

impl ShardedOperatorVertex {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self {
            functions,
            run: None,
        }
    }
}

#[async_trait]
impl Vertex for ShardedOperatorVertex {
    async fn initialize(&mut self, ctx: &mut VertexContext, parameter: &[u8]) -> Result<()> {
        let parameter = ShardedVertexParameter::from_bytes(parameter)?;
        let task = TaskBase::from_bytes(&parameter.parameter)?;
        let operator = operator_for(&task)?;
        let base = ShardedOperatorBase::new(parameter.shard_id, parameter.sharding, task);
        tracing::debug!(
            "{} initializing with {} inputs, {} secondary inputs",
            base.vertex_name(),
            base.input_count,
            base.secondary_input_count
        );
        self.run = Some(base.start(ctx, operator, self.functions.clone())?);
        Ok(())
    }

    async fn dispose(&self) {
        if let Some(run) = &self.run {
            run.stop();
        }
    }
}

/// The operator running shards of `task`.
pub fn operator_for(task: &TaskBase) -> Result<Box<dyn ShardOperator>> {
    match &task.kind {
        TaskKind::Produce { .. } => Ok(Box::new(ProducerOperator)),
        TaskKind::Shuffle(_) => Ok(Box::new(ShuffleOperator)),
        TaskKind::Subscribe => Ok(Box::new(SubscribeOperator)),
        TaskKind::ClientTerminal => Err(CraError::Unsupported(format!(
            "client terminal {} cannot run as a sharded operator",
            task.task_id
        ))
        .into()),
    }
}

/// Run the load-time checks of every sharded task over `sharding`.
pub fn validate_tasks<'a>(
    tasks: impl IntoIterator<Item = &'a TaskBase>,
    sharding: &ShardingInfo,
) -> Result<()> {
    for task in tasks {
        if task.is_client_terminal() {
            continue;
        }
        let operator = operator_for(task)?;
        let shard = sharding.all_shards.first().copied().unwrap_or_default();
        operator.validate(&ShardedOperatorBase::new(shard, sharding.clone(), task.clone()))?;
    }
    Ok(())
}

/// Vertex registry for workers hosting dataflow operators.
pub fn operator_vertex_registry(functions: Arc<FunctionRegistry>) -> VertexRegistry {
    VertexRegistry::only(SHARDED_OPERATOR, move || {
        Box::new(ShardedOperatorVertex::new(functions.clone()))
    })
}

#[cfg(test)]
#[path = "tests/operators_tests.rs"]
mod tests;
