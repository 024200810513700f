//! Shared machinery of every sharded operator shard: endpoint registration
//! from the task's connections, input collection behind latches, transform
//! replay and output serving.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cra_core::CraError;
use cra_core::network::frame::{read_bytes, write_bytes, write_end};
use cra_core::network::stream::BoxedStream;
use cra_core::vertex::{
    AsyncInputEndpoint, AsyncOutputEndpoint, ShardingInfo, VertexContext, all_to_all_input,
    all_to_all_output, shard_vertex_name,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dataset::Dataset;
use crate::registry::{FunctionRegistry, RegisteredFunction};
use crate::tasks::{ConnectionLocality, ConnectionPattern, OperatorConnection, TaskBase};

use super::latch::CountdownLatch;

/// What a task kind contributes to a shard: a load-time check and the
/// dataset its transforms start from.
pub trait ShardOperator: Send + Sync + 'static {
    fn validate(&self, base: &ShardedOperatorBase) -> Result<()>;

    /// `inputs` holds the primary inputs in endpoint order.
    fn source(
        &self,
        base: &ShardedOperatorBase,
        functions: &FunctionRegistry,
        inputs: Vec<Dataset>,
    ) -> Result<Dataset>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSelector {
    Whole,
    Fragment(u32),
}

/// One shard of a compiled task, with its connections split by direction.
#[derive(Debug, Clone)]
pub struct ShardedOperatorBase {
    pub shard_id: u32,
    pub sharding: ShardingInfo,
    pub task: TaskBase,
    /// Upstream vertex to the edges it feeds this shard through.
    pub from_to: BTreeMap<String, Vec<OperatorConnection>>,
    /// Downstream vertex to the edges this shard feeds it through.
    pub to_from: BTreeMap<String, Vec<OperatorConnection>>,
    pub input_count: usize,
    pub secondary_input_count: usize,
}

impl ShardedOperatorBase {
    pub fn new(shard_id: u32, sharding: ShardingInfo, task: TaskBase) -> Self {
        let mut from_to: BTreeMap<String, Vec<OperatorConnection>> = BTreeMap::new();
        let mut to_from: BTreeMap<String, Vec<OperatorConnection>> = BTreeMap::new();
        for connection in task.incoming() {
            from_to
                .entry(connection.from_vertex.clone())
                .or_default()
                .push(connection.clone());
        }
        for connection in task.outgoing() {
            to_from
                .entry(connection.to_vertex.clone())
                .or_default()
                .push(connection.clone());
        }

        let peers = sharding.shard_count();
        let fan_in = |secondary: bool| -> usize {
            from_to
                .values()
                .flatten()
                .filter(|c| c.secondary == secondary)
                .map(|c| match c.pattern {
                    ConnectionPattern::AllToAll => peers,
                    ConnectionPattern::Aligned | ConnectionPattern::Gather => 1,
                })
                .sum()
        };
        let input_count = fan_in(false);
        let secondary_input_count = fan_in(true);

        Self {
            shard_id,
            sharding,
            task,
            from_to,
            to_from,
            input_count,
            secondary_input_count,
        }
    }

    pub fn vertex_name(&self) -> String {
        shard_vertex_name(&self.task.vertex_name, self.shard_id)
    }

    /// Fails with `Unsupported` if an edge matching `filter` asks for the
    /// shared-memory shortcut.
    pub fn reject_shared_memory(&self, filter: impl Fn(&OperatorConnection) -> bool) -> Result<()> {
        let Some(connection) = self
            .task
            .vertex_connections()
            .iter()
            .filter(|&c| filter(c))
            .find(|c| c.locality == ConnectionLocality::SharedMemory)
        else {
            return Ok(());
        };
        Err(CraError::Unsupported(format!(
            "shared-memory connection {}.{} -> {}.{}",
            connection.from_vertex,
            connection.from_endpoint,
            connection.to_vertex,
            connection.to_endpoint
        ))
        .into())
    }

    fn input_endpoints(&self) -> Vec<(String, InputRole, String)> {
        let mut endpoints = Vec::new();
        for connection in self.from_to.values().flatten() {
            let role = if connection.secondary {
                InputRole::Secondary
            } else {
                InputRole::Primary
            };
            match connection.pattern {
                ConnectionPattern::AllToAll => {
                    for &peer in &self.sharding.all_shards {
                        endpoints.push((
                            all_to_all_input(&connection.to_endpoint, peer),
                            role,
                            connection.from_vertex.clone(),
                        ));
                    }
                }
                ConnectionPattern::Aligned | ConnectionPattern::Gather => endpoints.push((
                    connection.to_endpoint.clone(),
                    role,
                    connection.from_vertex.clone(),
                )),
            }
        }
        endpoints
    }

    fn output_endpoints(&self) -> Vec<(String, OutputSelector)> {
        let mut endpoints = Vec::new();
        for connection in self.to_from.values().flatten() {
            match connection.pattern {
                ConnectionPattern::AllToAll => {
                    for &peer in &self.sharding.all_shards {
                        endpoints.push((
                            all_to_all_output(&connection.from_endpoint, peer),
                            OutputSelector::Fragment(peer),
                        ));
                    }
                }
                ConnectionPattern::Aligned | ConnectionPattern::Gather => {
                    endpoints.push((connection.from_endpoint.clone(), OutputSelector::Whole))
                }
            }
        }
        endpoints
    }

    /// Validate, register every endpoint on `ctx` and start computing.
    pub fn start(
        self,
        ctx: &mut VertexContext,
        operator: Box<dyn ShardOperator>,
        functions: Arc<FunctionRegistry>,
    ) -> Result<ShardRun> {
        operator.validate(&self)?;

        let (output, _) = watch::channel(None);
        let shared = Arc::new(OperatorShared {
            primary: CountdownLatch::new(self.input_count),
            secondary: CountdownLatch::new(self.secondary_input_count),
            inbox: Mutex::new(BTreeMap::new()),
            output,
        });

        for (endpoint, role, source) in self.input_endpoints() {
            ctx.add_input(
                endpoint.clone(),
                Arc::new(DatasetInput {
                    shared: shared.clone(),
                    endpoint,
                    role,
                    source,
                }),
            )?;
        }
        for (endpoint, selector) in self.output_endpoints() {
            ctx.add_output(
                endpoint,
                Arc::new(DatasetOutput {
                    ready: shared.output.subscribe(),
                    selector,
                    vertex: self.vertex_name(),
                }),
            )?;
        }

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                let vertex = self.vertex_name();
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = compute(&self, &shared, operator.as_ref(), &functions) => result,
                };
                match result {
                    Ok(output) => {
                        tracing::info!(
                            "{} produced {} records",
                            vertex,
                            output.record_count
                        );
                        shared.output.send_replace(Some(Ok(Arc::new(output))));
                    }
                    Err(e) => {
                        tracing::error!("{} failed: {:#}", vertex, e);
                        shared.output.send_replace(Some(Err(e.to_string())));
                    }
                }
            })
        };
        Ok(ShardRun { cancel, handle })
    }
}

/// Running computation of one shard.
pub struct ShardRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ShardRun {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn compute(
    base: &ShardedOperatorBase,
    shared: &OperatorShared,
    operator: &dyn ShardOperator,
    functions: &FunctionRegistry,
) -> Result<ShardOutput> {
    shared.primary.wait().await;
    let source = operator.source(base, functions, shared.primary_inputs())?;
    shared.secondary.wait().await;
    let secondaries = shared.secondary_inputs();
    let (whole, fragments) = replay(functions, base, source, &secondaries)?;
    ShardOutput::new(&whole, fragments)
}

/// Run the task's transforms over `dataset`. A trailing split yields the
/// fragments for the next shuffle alongside the unsplit dataset.
pub fn replay(
    functions: &FunctionRegistry,
    base: &ShardedOperatorBase,
    mut dataset: Dataset,
    secondaries: &BTreeMap<String, Dataset>,
) -> Result<(Dataset, Option<BTreeMap<u32, Dataset>>)> {
    let entries = base.task.transforms.entries();
    for (i, entry) in entries.iter().enumerate() {
        match functions.resolve(entry)? {
            RegisteredFunction::Unary(transform) => dataset = transform(dataset)?,
            RegisteredFunction::Rekey(rekey) => {
                for record in &mut dataset.records {
                    let key = rekey(record);
                    record.key = key;
                }
            }
            RegisteredFunction::Binary(transform) => {
                let source = entry
                    .inputs
                    .input_id2
                    .as_ref()
                    .and_then(|id| base.task.secondary_sources.get(id))
                    .ok_or_else(|| anyhow!("binary {} has no secondary source", entry.output_id))?;
                let secondary = secondaries
                    .get(source)
                    .cloned()
                    .ok_or_else(|| anyhow!("no secondary input from {}", source))?;
                dataset = transform(dataset, secondary)?;
            }
            RegisteredFunction::Splitter(split) => {
                if i + 1 != entries.len() {
                    return Err(anyhow!(
                        "split {} is not the last transform of {}",
                        entry.output_id,
                        base.task.task_id
                    ));
                }
                let fragments = split(dataset.clone(), &base.sharding.all_shards)?;
                return Ok((dataset, Some(fragments)));
            }
            other => {
                return Err(anyhow!(
                    "{} function {} cannot run as a transform",
                    other.kind_name(),
                    entry.function
                ));
            }
        }
    }
    Ok((dataset, None))
}

/// Serialized result of a shard.
pub struct ShardOutput {
    whole: Vec<u8>,
    fragments: BTreeMap<u32, Vec<u8>>,
    empty: Vec<u8>,
    record_count: usize,
}

impl ShardOutput {
    fn new(whole: &Dataset, fragments: Option<BTreeMap<u32, Dataset>>) -> Result<Self> {
        let mut encoded = BTreeMap::new();
        for (shard, fragment) in fragments.unwrap_or_default() {
            encoded.insert(shard, fragment.to_bytes()?);
        }
        Ok(Self {
            whole: whole.to_bytes()?,
            fragments: encoded,
            empty: Dataset::default().to_bytes()?,
            record_count: whole.len(),
        })
    }

    fn bytes(&self, selector: OutputSelector) -> &[u8] {
        match selector {
            OutputSelector::Whole => &self.whole,
            OutputSelector::Fragment(shard) => {
                self.fragments.get(&shard).unwrap_or(&self.empty)
            }
        }
    }
}

type OutputState = Option<std::result::Result<Arc<ShardOutput>, String>>;

struct Received {
    role: InputRole,
    source: String,
    dataset: Dataset,
}

struct OperatorShared {
    primary: CountdownLatch,
    secondary: CountdownLatch,
    /// Endpoint name to what arrived on it.
    inbox: Mutex<BTreeMap<String, Received>>,
    output: watch::Sender<OutputState>,
}

impl OperatorShared {
    /// Only the first delivery on an endpoint counts.
    fn deliver(&self, endpoint: &str, role: InputRole, source: &str, dataset: Dataset) {
        {
            let mut inbox = self.inbox.lock().expect("inbox poisoned");
            if inbox.contains_key(endpoint) {
                tracing::debug!("ignoring repeated delivery on {}", endpoint);
                return;
            }
            inbox.insert(
                endpoint.to_string(),
                Received {
                    role,
                    source: source.to_string(),
                    dataset,
                },
            );
        }
        match role {
            InputRole::Primary => self.primary.count_down(),
            InputRole::Secondary => self.secondary.count_down(),
        }
    }

    fn primary_inputs(&self) -> Vec<Dataset> {
        let inbox = self.inbox.lock().expect("inbox poisoned");
        inbox
            .values()
            .filter(|r| r.role == InputRole::Primary)
            .map(|r| r.dataset.clone())
            .collect()
    }

    /// Source task to the concatenation of what it sent.
    fn secondary_inputs(&self) -> BTreeMap<String, Dataset> {
        let inbox = self.inbox.lock().expect("inbox poisoned");
        let mut by_source: BTreeMap<String, Vec<Dataset>> = BTreeMap::new();
        for received in inbox.values().filter(|r| r.role == InputRole::Secondary) {
            by_source
                .entry(received.source.clone())
                .or_default()
                .push(received.dataset.clone());
        }
        by_source
            .into_iter()
            .map(|(source, parts)| (source, Dataset::concat(parts)))
            .collect()
    }
}

/// Reads one dataset, then the end of the data sequence.
struct DatasetInput {
    shared: Arc<OperatorShared>,
    endpoint: String,
    role: InputRole,
    source: String,
}

#[async_trait]
impl AsyncInputEndpoint for DatasetInput {
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
        let dataset = Dataset::concat(parts);
        tracing::debug!(
            "{} received {} records from {}",
            self.endpoint,
            dataset.len(),
            other_vertex
        );
        self.shared
            .deliver(&self.endpoint, self.role, &self.source, dataset);
        Ok(())
    }
}

/// Writes the shard's result once it is ready.
struct DatasetOutput {
    ready: watch::Receiver<OutputState>,
    selector: OutputSelector,
    vertex: String,
}

#[async_trait]
impl AsyncOutputEndpoint for DatasetOutput {
    async fn to_stream(
        &self,
        stream: &mut BoxedStream,
        _other_vertex: &str,
        _other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ready = self.ready.clone();
        let state = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            state = ready.wait_for(Option::is_some) => state?.clone(),
        };
        match state {
            Some(Ok(output)) => {
                write_bytes(stream, output.bytes(self.selector)).await?;
                write_end(stream).await
            }
            Some(Err(e)) => Err(anyhow!("{} has no output: {}", self.vertex, e)),
            None => Err(anyhow!("{} output closed", self.vertex)),
        }
    }
}

#[cfg(test)]
#[path = "tests/base_tests.rs"]
mod tests;
