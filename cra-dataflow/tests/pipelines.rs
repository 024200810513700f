use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cra_core::CraError;
use cra_core::client::ClientLibrary;
use cra_core::config::{ClientConfig, WorkerConfig};
use cra_core::metadata::DataProvider;
use cra_core::vertex::ShardingInfo;
use cra_core::worker::Worker;
use cra_dataflow::deploy::deployment_names;
use cra_dataflow::registry::{MERGE_CONCAT, SPLIT_ROUND_ROBIN};
use cra_dataflow::tasks::{TaskKind, TransformKind};
use cra_dataflow::{
    Dataset, DeploymentDescriptor, FunctionRegistry, Record, ShardedDataset,
    operator_vertex_registry,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(20);
const SHARDS: u32 = 4;
const PER_SHARD: i64 = 10;

fn functions() -> Arc<FunctionRegistry> {
    let mut functions = FunctionRegistry::new();
    functions.register_producer("range", |shard, _: &ShardingInfo| {
        let start = shard as i64 * PER_SHARD;
        Ok((start..start + PER_SHARD)
            .map(|v| Record::int(v as u64, v))
            .collect())
    });
    functions.register_unary("shift-up", |dataset: Dataset| {
        dataset
            .records
            .iter()
            .map(|r| Ok(Record::int(r.key, r.as_int()? + 1)))
            .collect::<Result<Vec<_>>>()
            .map(Dataset::new)
    });
    functions.register_binary("append", |left: Dataset, right: Dataset| {
        Ok(Dataset::concat([left, right]))
    });
    Arc::new(functions)
}

struct Cluster {
    client: ClientLibrary,
    workers: Vec<Worker>,
}

impl Cluster {
    async fn start(functions: &Arc<FunctionRegistry>, instances: &[&str]) -> Self {
        let data = DataProvider::in_memory();
        let mut workers = Vec::new();
        for instance in instances {
            let config = WorkerConfig::new(*instance, 0)
                .with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .without_recovery();
            let registry = Arc::new(operator_vertex_registry(functions.clone()));
            workers.push(
                Worker::start(config, data.clone(), registry, None)
                    .await
                    .unwrap(),
            );
        }
        let client = ClientLibrary::new(
            data,
            ClientConfig {
                retry_delay: Duration::from_millis(10),
                ..ClientConfig::default()
            },
        );
        Self { client, workers }
    }

    fn descriptor(&self, name: &str) -> DeploymentDescriptor {
        DeploymentDescriptor::new(name)
            .with_instances(self.workers.iter().map(|w| w.instance_name().to_string()))
            .with_shard_count(SHARDS)
    }

    async fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown().await;
        }
    }
}

fn sorted_values(dataset: &Dataset) -> Vec<i64> {
    let mut values: Vec<i64> = dataset.records.iter().map(|r| r.as_int().unwrap()).collect();
    values.sort_unstable();
    values
}

fn total() -> i64 {
    SHARDS as i64 * PER_SHARD
}

#[tokio::test]
async fn test_transform_move_transform() {
    let functions = functions();
    let dataset = ShardedDataset::produce("range")
        .transform("shift-up")
        .shuffle_by_key()
        .transform("shift-up");

    let topology = dataset.compile(&functions).unwrap();
    let producer = &topology.tasks()[0];
    assert!(matches!(producer.kind, TaskKind::Produce { .. }));
    assert_eq!(
        producer.transforms.last().map(|e| e.kind),
        Some(TransformKind::MoveSplit)
    );
    let shuffles: Vec<_> = topology
        .tasks()
        .iter()
        .filter(|t| t.shuffle_task().is_some())
        .collect();
    assert_eq!(shuffles.len(), 1);
    assert_eq!(shuffles[0].transforms.len(), 1);
    assert_eq!(shuffles[0].transforms.entries()[0].function, "shift-up");
    assert_eq!(
        shuffles[0].shuffle_task().unwrap().mapper_vertex_name,
        producer.vertex_name
    );

    let cluster = Cluster::start(&functions, &["w1", "w2"]).await;
    let mut subscription = dataset
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("shift"))
        .await
        .unwrap();
    let results = timeout(WAIT, subscription.collect()).await.unwrap().unwrap();
    assert_eq!(results.len(), SHARDS as usize);

    let all = Dataset::concat(results.into_values());
    assert_eq!(sorted_values(&all), (2..total() + 2).collect::<Vec<_>>());

    subscription.close(&cluster.client).await;
    assert!(deployment_names(cluster.client.data()).await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_consecutive_moves() {
    let functions = functions();
    let dataset = ShardedDataset::produce("range")
        .shuffle_by_key()
        .move_to(SPLIT_ROUND_ROBIN, MERGE_CONCAT);

    let topology = dataset.compile(&functions).unwrap();
    let shuffles: Vec<_> = topology
        .tasks()
        .iter()
        .filter(|t| t.shuffle_task().is_some())
        .collect();
    assert_eq!(shuffles.len(), 2);
    let first_split = topology.tasks()[0].transforms.entries();
    assert_eq!(first_split.len(), 1);
    assert_eq!(first_split[0].kind, TransformKind::MoveSplit);
    let second_split = shuffles[0].transforms.entries();
    assert_eq!(second_split.len(), 1);
    assert_eq!(second_split[0].function, SPLIT_ROUND_ROBIN);
    assert!(shuffles[1].transforms.is_empty());

    let cluster = Cluster::start(&functions, &["w1", "w2"]).await;
    let mut subscription = dataset
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("two-moves"))
        .await
        .unwrap();
    let all = timeout(WAIT, subscription.collect_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sorted_values(&all), (0..total()).collect::<Vec<_>>());

    subscription.close(&cluster.client).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_binary_after_moves() {
    let functions = functions();
    let left = ShardedDataset::produce("range").shuffle_by_key();
    let right = ShardedDataset::produce("range")
        .transform("shift-up")
        .shuffle_by_key();
    let dataset = left.transform_binary(&right, "append");

    let cluster = Cluster::start(&functions, &["w1", "w2", "w3"]).await;
    let mut subscription = dataset
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("join"))
        .await
        .unwrap();
    let all = timeout(WAIT, subscription.collect_all())
        .await
        .unwrap()
        .unwrap();

    let mut expected: Vec<i64> = (0..total()).chain(1..total() + 1).collect();
    expected.sort_unstable();
    assert_eq!(sorted_values(&all), expected);

    subscription.close(&cluster.client).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_binary_on_producer_is_unsupported() {
    let functions = functions();
    let dataset = ShardedDataset::produce("range")
        .transform_binary(&ShardedDataset::produce("range"), "append");

    let cluster = Cluster::start(&functions, &["w1"]).await;
    let err = dataset
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("bad"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CraError::Unsupported(_)));
    assert!(deployment_names(cluster.client.data()).await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_shard_single_worker() {
    let functions = functions();
    let cluster = Cluster::start(&functions, &["solo"]).await;
    let mut subscription = ShardedDataset::produce("range")
        .transform("shift-up")
        .deploy(
            &cluster.client,
            functions.clone(),
            DeploymentDescriptor::new("solo")
                .with_instances(["solo"])
                .with_shards(vec![7]),
        )
        .await
        .unwrap();

    let (shard, dataset) = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
    assert_eq!(shard, 7);
    let start = 7 * PER_SHARD;
    assert_eq!(sorted_values(&dataset), (start + 1..start + PER_SHARD + 1).collect::<Vec<_>>());

    // Colocated shards fuse; only the terminal's worker dials out.
    assert_eq!(cluster.workers[0].created_connections(), 0);
    assert!(subscription.client_worker().unwrap().created_connections() >= 1);

    subscription.close(&cluster.client).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_deployments_run_side_by_side() {
    let functions = functions();
    let cluster = Cluster::start(&functions, &["w1", "w2"]).await;

    let mut first = ShardedDataset::produce("range")
        .transform("shift-up")
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("first"))
        .await
        .unwrap();
    let mut second = ShardedDataset::produce("range")
        .shuffle_by_key()
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("second"))
        .await
        .unwrap();
    assert!(first.vertices().iter().all(|v| v.starts_with("first-")));
    assert!(second.vertices().iter().all(|v| v.starts_with("second-")));
    assert_eq!(
        deployment_names(cluster.client.data()).await.unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );

    let shifted = timeout(WAIT, first.collect_all()).await.unwrap().unwrap();
    let moved = timeout(WAIT, second.collect_all()).await.unwrap().unwrap();
    assert_eq!(sorted_values(&shifted), (1..total() + 1).collect::<Vec<_>>());
    assert_eq!(sorted_values(&moved), (0..total()).collect::<Vec<_>>());

    first.close(&cluster.client).await;
    assert_eq!(
        deployment_names(cluster.client.data()).await.unwrap(),
        vec!["second".to_string()]
    );
    second.close(&cluster.client).await;
    assert!(cluster.client.vertex_names().await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_deploy_leaves_nothing_behind() {
    let functions = functions();
    let cluster = Cluster::start(&functions, &["w1"]).await;
    let dataset = ShardedDataset::produce("range").shuffle_by_key();

    let err = dataset
        .deploy(
            &cluster.client,
            functions.clone(),
            DeploymentDescriptor::new("partial")
                .with_instances(["w1", "ghost"])
                .with_shard_count(SHARDS),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CraError::InstanceNotFound(_)));

    assert!(deployment_names(cluster.client.data()).await.unwrap().is_empty());
    assert!(cluster.client.vertex_names().await.unwrap().is_empty());
    assert_eq!(
        cluster.client.instance_names().await.unwrap(),
        vec!["w1".to_string()]
    );
    assert!(cluster.workers[0].hosted_vertices().is_empty());

    let mut subscription = dataset
        .deploy(&cluster.client, functions.clone(), cluster.descriptor("partial"))
        .await
        .unwrap();
    let all = timeout(WAIT, subscription.collect_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sorted_values(&all), (0..total()).collect::<Vec<_>>());

    subscription.close(&cluster.client).await;
    cluster.shutdown().await;
}
