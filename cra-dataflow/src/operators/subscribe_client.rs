use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cra_core::network::frame::read_bytes;
use cra_core::network::stream::BoxedStream;
use cra_core::vertex::{AsyncInputEndpoint, Vertex, VertexContext, all_to_all_input};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dataset::Dataset;
use crate::tasks::{ConnectionPattern, TaskBase};

/// Parameter of the client terminal vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTerminalParameter {
    pub task: TaskBase,
    /// Shards of the subscribe task feeding the terminal.
    pub upstream_shards: Vec<u32>,
}

impl ClientTerminalParameter {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Terminal of a deployed dataflow, hosted by the deploying client. Every
/// subscribe shard delivers its dataset here; each arrives on the observer
/// channel tagged with its shard id.
pub struct SubscribeClientVertex {
    observer: mpsc::Sender<(u32, Dataset)>,
}

impl SubscribeClientVertex {
    pub fn new(observer: mpsc::Sender<(u32, Dataset)>) -> Self {
        Self { observer }
    }

    pub fn factory(
        observer: mpsc::Sender<(u32, Dataset)>,
    ) -> impl Fn() -> Box<dyn Vertex> + Send + Sync + 'static {
        move || Box::new(SubscribeClientVertex::new(observer.clone()))
    }
}

#[async_trait]
impl Vertex for SubscribeClientVertex {
    async fn initialize(&mut self, ctx: &mut VertexContext, parameter: &[u8]) -> Result<()> {
        let parameter = ClientTerminalParameter::from_bytes(parameter)?;
        if !parameter.task.is_client_terminal() {
            return Err(anyhow!("{} is not a client terminal", parameter.task.task_id));
        }
        for connection in parameter.task.incoming() {
            if connection.pattern != ConnectionPattern::Gather {
                return Err(anyhow!(
                    "client terminal input {} is not a gather edge",
                    connection.to_endpoint
                ));
            }
            for &shard in &parameter.upstream_shards {
                ctx.add_input(
                    all_to_all_input(&connection.to_endpoint, shard),
                    Arc::new(ClientInput {
                        shard,
                        observer: self.observer.clone(),
                    }),
                )?;
            }
        }
        Ok(())
    }
}

struct ClientInput {
    shard: u32,
    observer: mpsc::Sender<(u32, Dataset)>,
}

#[async_trait]
impl AsyncInputEndpoint for ClientInput {
    async fn from_stream(
        &self,
        stream: &mut BoxedStream,
        other_vertex: &str,
        _other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut parts = Vec::new();
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                record = read_bytes(stream) => record?,
            };
            match record {
                Some(bytes) => parts.push(Dataset::from_bytes(&bytes)?),
                None => break,
            }
        }
        if self
            .observer
            .send((self.shard, Dataset::concat(parts)))
            .await
            .is_err()
        {
            tracing::debug!("result of {} dropped: subscription closed", other_vertex);
        }
        Ok(())
    }
}
