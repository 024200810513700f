//! # Deployment
//!
//! Places a prepared [`OperatorsTopology`] on running workers: one sharded
//! vertex per task, the client terminal on a worker hosted by the deploying
//! process, then one connection per edge.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use cra_core::client::{ClientLibrary, ShardedConnectionKind};
use cra_core::config::WorkerConfig;
use cra_core::metadata::DataProvider;
use cra_core::vertex::sharded::{MODULO_LOCATOR, SHARD_SEPARATOR};
use cra_core::vertex::{ShardingInfo, VertexRegistry, all_to_all_input, shard_vertex_name};
use cra_core::worker::{ConnectionInitiator, Worker};
use cra_core::{CraError, Result};
use tokio::sync::mpsc;

use crate::dataset::Dataset;
use crate::operators::{
    ClientTerminalParameter, SHARDED_OPERATOR, SUBSCRIBE_CLIENT, SubscribeClientVertex,
    validate_tasks,
};
use crate::scheduler::RoundRobinScheduler;
use crate::tasks::{ConnectionPattern, OperatorConnection};
use crate::topology::OperatorsTopology;

/// Blob path prefix of stored topologies.
pub const TOPOLOGY_BLOB_PREFIX: &str = "topologies/";

/// Where and how wide a dataflow runs.
#[derive(Debug, Clone)]
pub struct DeploymentDescriptor {
    pub name: String,
    /// Workers hosting the operator shards.
    pub instances: Vec<String>,
    /// Shard ids every task is split into.
    pub shards: Vec<u32>,
    pub shard_locator: String,
    /// Name of the client-hosted worker; `"{name}-client"` when unset.
    pub client_instance: Option<String>,
}

impl DeploymentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: Vec::new(),
            shards: vec![0],
            shard_locator: MODULO_LOCATOR.to_string(),
            client_instance: None,
        }
    }

    pub fn with_instances<I, S>(mut self, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instances = instances.into_iter().map(Into::into).collect();
        self
    }

    /// Shards `0..count`.
    pub fn with_shard_count(mut self, count: u32) -> Self {
        self.shards = (0..count).collect();
        self
    }

    pub fn with_shards(mut self, shards: Vec<u32>) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_shard_locator(mut self, locator: impl Into<String>) -> Self {
        self.shard_locator = locator.into();
        self
    }

    pub fn with_client_instance(mut self, instance: impl Into<String>) -> Self {
        self.client_instance = Some(instance.into());
        self
    }

    pub fn client_instance_name(&self) -> String {
        self.client_instance
            .clone()
            .unwrap_or_else(|| format!("{}-client", self.name))
    }

    pub fn blob_path(&self) -> String {
        format!("{TOPOLOGY_BLOB_PREFIX}{}", self.name)
    }
}

/// Deploy `topology` and return the subscription its client terminal feeds.
///
/// Vertices are named `{deployment}-{task id}`. Workers resolve the
/// topology's functions against the registry they were started with. On
/// failure everything placed so far is removed again.
pub async fn deploy(
    mut topology: OperatorsTopology,
    client: &ClientLibrary,
    descriptor: DeploymentDescriptor,
) -> Result<Subscription> {
    if descriptor.name.is_empty() || descriptor.name.contains(SHARD_SEPARATOR) {
        return Err(anyhow!("invalid deployment name {:?}", descriptor.name).into());
    }
    if !topology.is_prepared() {
        return Err(anyhow!("topology of {} is not prepared", descriptor.name).into());
    }
    let mut shards = descriptor.shards.clone();
    shards.sort_unstable();
    shards.dedup();
    if shards.is_empty() {
        return Err(anyhow!("deployment {} has no shards", descriptor.name).into());
    }
    topology
        .namespace_vertices(&descriptor.name)
        .map_err(CraError::from_anyhow)?;
    let sharding = ShardingInfo::new(shards.clone()).with_locator(&descriptor.shard_locator);
    validate_tasks(topology.tasks(), &sharding).map_err(CraError::from_anyhow)?;
    let placement = RoundRobinScheduler::new().place(&shards, &descriptor.instances)?;
    if client.data().blobs.get(&descriptor.blob_path()).await?.is_some() {
        return Err(anyhow!("deployment {} already exists", descriptor.name).into());
    }

    let (tx, rx) = mpsc::channel(shards.len());
    let mut subscription = Subscription {
        worker: None,
        results: rx,
        expected: shards.len(),
        vertices: Vec::new(),
        blob: None,
        client_instance: descriptor.client_instance_name(),
    };
    let placed = place(
        &topology,
        client,
        &descriptor,
        &placement,
        &shards,
        tx,
        &mut subscription,
    )
    .await;
    if let Err(err) = placed {
        tracing::error!("deployment of {} failed: {}", descriptor.name, err);
        subscription.close(client).await;
        return Err(err);
    }
    tracing::info!(
        "deployed {} with {} tasks over {} shards",
        descriptor.name,
        topology.tasks().len(),
        shards.len()
    );
    Ok(subscription)
}

/// Store the topology, start the client-hosted worker, place every vertex
/// and wire every edge. What succeeded is recorded on `subscription`.
async fn place(
    topology: &OperatorsTopology,
    client: &ClientLibrary,
    descriptor: &DeploymentDescriptor,
    placement: &[(String, Vec<u32>)],
    shards: &[u32],
    tx: mpsc::Sender<(u32, Dataset)>,
    subscription: &mut Subscription,
) -> Result<()> {
    let blob = descriptor.blob_path();
    client.data().blobs.put(&blob, topology.to_bytes()?).await?;
    subscription.blob = Some(blob);

    let registry = VertexRegistry::only(SUBSCRIBE_CLIENT, SubscribeClientVertex::factory(tx));
    let worker = Worker::start(
        WorkerConfig::sideloaded(descriptor.client_instance_name()),
        client.data().clone(),
        Arc::new(registry),
        None,
    )
    .await?;
    subscription.worker = Some(worker);

    client
        .define_sharded_vertex(SHARDED_OPERATOR, SHARDED_OPERATOR)
        .await?;
    let mut terminal = None;
    for task in topology.tasks() {
        if task.is_client_terminal() {
            terminal = Some(task);
            continue;
        }
        subscription.track(task.vertex_name.clone());
        let placed = client
            .instantiate_sharded_vertex(
                &task.vertex_name,
                SHARDED_OPERATOR,
                placement,
                &task.to_bytes()?,
                &descriptor.shard_locator,
            )
            .await;
        subscription.settle(placed)?;
        tracing::info!(
            "placed {} on {} instances",
            task.vertex_name,
            placement.len()
        );
    }
    let terminal =
        terminal.ok_or_else(|| anyhow!("topology of {} has no client terminal", descriptor.name))?;

    client.define_vertex(SUBSCRIBE_CLIENT, SUBSCRIBE_CLIENT).await?;
    let parameter = ClientTerminalParameter {
        task: terminal.clone(),
        upstream_shards: shards.to_vec(),
    };
    let Some(worker) = subscription.worker.as_ref() else {
        return Err(anyhow!("client worker of {} is gone", descriptor.name).into());
    };
    let loaded = client
        .instantiate_local_vertex(
            worker,
            &terminal.vertex_name,
            SUBSCRIBE_CLIENT,
            parameter.to_bytes()?,
        )
        .await;
    subscription.track(terminal.vertex_name.clone());
    subscription.settle(loaded)?;

    for connection in topology.connections() {
        connect(client, connection, shards).await?;
    }
    Ok(())
}

/// Topology stored by the deployment `name`, if any.
pub async fn load_topology(data: &DataProvider, name: &str) -> Result<Option<OperatorsTopology>> {
    let path = format!("{TOPOLOGY_BLOB_PREFIX}{name}");
    match data.blobs.get(&path).await? {
        Some(bytes) => Ok(Some(OperatorsTopology::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Names of every stored deployment.
pub async fn deployment_names(data: &DataProvider) -> Result<Vec<String>> {
    Ok(data
        .blobs
        .list(TOPOLOGY_BLOB_PREFIX)
        .await?
        .into_iter()
        .filter_map(|path| path.strip_prefix(TOPOLOGY_BLOB_PREFIX).map(str::to_string))
        .collect())
}

async fn connect(
    client: &ClientLibrary,
    connection: &OperatorConnection,
    shards: &[u32],
) -> Result<()> {
    match connection.pattern {
        ConnectionPattern::Aligned => {
            client
                .connect_sharded(
                    &connection.from_vertex,
                    &connection.from_endpoint,
                    &connection.to_vertex,
                    &connection.to_endpoint,
                    ShardedConnectionKind::Aligned,
                )
                .await?;
        }
        ConnectionPattern::AllToAll => {
            client
                .connect_sharded(
                    &connection.from_vertex,
                    &connection.from_endpoint,
                    &connection.to_vertex,
                    &connection.to_endpoint,
                    ShardedConnectionKind::AllToAll,
                )
                .await?;
        }
        // The terminal's worker dials out; remote shards cannot reach it.
        ConnectionPattern::Gather => {
            for &shard in shards {
                client
                    .connect_with(
                        &shard_vertex_name(&connection.from_vertex, shard),
                        &connection.from_endpoint,
                        &connection.to_vertex,
                        &all_to_all_input(&connection.to_endpoint, shard),
                        ConnectionInitiator::ToSide,
                    )
                    .await?;
            }
        }
    }
    tracing::debug!(
        "connected {}.{} -> {}.{} ({:?})",
        connection.from_vertex,
        connection.from_endpoint,
        connection.to_vertex,
        connection.to_endpoint,
        connection.pattern
    );
    Ok(())
}

/// Results of a deployed dataflow, one dataset per subscribe shard.
pub struct Subscription {
    worker: Option<Worker>,
    results: mpsc::Receiver<(u32, Dataset)>,
    expected: usize,
    vertices: Vec<String>,
    blob: Option<String>,
    client_instance: String,
}

impl Subscription {
    /// Number of shards that deliver a result.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Vertices placed for this deployment, the client terminal last.
    pub fn vertices(&self) -> &[String] {
        &self.vertices
    }

    /// The worker hosting the client terminal, until closed.
    pub fn client_worker(&self) -> Option<&Worker> {
        self.worker.as_ref()
    }

    /// Next shard result; `None` once the terminal is gone.
    pub async fn next(&mut self) -> Option<(u32, Dataset)> {
        self.results.recv().await
    }

    /// Wait for the result of every shard.
    pub async fn collect(&mut self) -> Result<BTreeMap<u32, Dataset>> {
        let mut results = BTreeMap::new();
        while results.len() < self.expected {
            let Some((shard, dataset)) = self.next().await else {
                return Err(CraError::Other(anyhow!(
                    "subscription closed after {} of {} shards",
                    results.len(),
                    self.expected
                )));
            };
            if results.insert(shard, dataset).is_some() {
                tracing::warn!("shard {} delivered twice", shard);
            }
        }
        Ok(results)
    }

    /// Collect every shard result and concatenate them in shard order.
    pub async fn collect_all(&mut self) -> Result<Dataset> {
        Ok(Dataset::concat(self.collect().await?.into_values()))
    }

    /// Delete every placed vertex and the stored topology, then stop the
    /// client-hosted worker and drop its instance row. Failures are logged.
    pub async fn close(&mut self, client: &ClientLibrary) {
        for vertex in self.vertices.drain(..).rev() {
            if let Err(err) = client.delete_vertex(&vertex).await {
                tracing::warn!("could not delete {}: {}", vertex, err);
            }
        }
        if let Some(blob) = self.blob.take()
            && let Err(err) = client.data().blobs.delete(&blob).await
        {
            tracing::warn!("could not delete {}: {}", blob, err);
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
            if let Err(err) = client.delete_instance(&self.client_instance).await {
                tracing::warn!("could not delete {}: {}", self.client_instance, err);
            }
        }
    }

    fn track(&mut self, vertex: String) {
        self.vertices.push(vertex);
    }

    /// Keep the last tracked vertex unless placing it collided with one
    /// owned by someone else.
    fn settle<T>(&mut self, placed: Result<T>) -> Result<T> {
        if let Err(CraError::VertexAlreadyExists(_)) = &placed {
            self.vertices.pop();
        }
        placed
    }
}

#[cfg(test)]
#[path = "tests/deploy_tests.rs"]
mod tests;
