use cra_core::config::ClientConfig;

use super::*;
use crate::registry::{FunctionRegistry, record_types};
use crate::tasks::TaskBase;

#[test]
fn test_descriptor_defaults() {
    let descriptor = DeploymentDescriptor::new("wordcount")
        .with_instances(["w1", "w2"])
        .with_shard_count(3);
    assert_eq!(descriptor.shards, vec![0, 1, 2]);
    assert_eq!(descriptor.instances, vec!["w1".to_string(), "w2".to_string()]);
    assert_eq!(descriptor.client_instance_name(), "wordcount-client");
    assert_eq!(descriptor.blob_path(), "topologies/wordcount");
    assert_eq!(
        descriptor.with_client_instance("me").client_instance_name(),
        "me"
    );
}

#[tokio::test]
async fn test_unprepared_topology_rejected() {
    let mut topology = OperatorsTopology::new();
    topology
        .add_operator_base(TaskBase::produce(
            "produce-0",
            "p",
            record_types().to_string(),
        ))
        .unwrap();
    let client = ClientLibrary::new(DataProvider::in_memory(), ClientConfig::default());

    let result = deploy(topology, &client, DeploymentDescriptor::new("x")).await;
    assert!(result.is_err());
    assert!(deployment_names(client.data()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_instances_rejected_before_storing_topology() {
    let mut functions = FunctionRegistry::new();
    functions.register_producer("empty", |_, _: &cra_core::vertex::ShardingInfo| {
        Ok(Dataset::default())
    });
    let topology = crate::sharded_dataset::ShardedDataset::produce("empty")
        .compile(&functions)
        .unwrap();
    let client = ClientLibrary::new(DataProvider::in_memory(), ClientConfig::default());

    let result = deploy(topology.clone(), &client, DeploymentDescriptor::new("lonely")).await;
    assert!(result.is_err());
    assert!(deployment_names(client.data()).await.unwrap().is_empty());
    assert!(client.instance_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_existing_deployment_name_rejected() {
    let mut functions = FunctionRegistry::new();
    functions.register_producer("empty", |_, _: &cra_core::vertex::ShardingInfo| {
        Ok(Dataset::default())
    });
    let topology = crate::sharded_dataset::ShardedDataset::produce("empty")
        .compile(&functions)
        .unwrap();
    let client = ClientLibrary::new(DataProvider::in_memory(), ClientConfig::default());
    let descriptor = DeploymentDescriptor::new("taken").with_instances(["w1"]);
    client
        .data()
        .blobs
        .put(&descriptor.blob_path(), topology.to_bytes().unwrap())
        .await
        .unwrap();

    let result = deploy(topology.clone(), &client, descriptor).await;
    assert!(result.is_err());
    let stored = load_topology(client.data(), "taken").await.unwrap().unwrap();
    assert_eq!(stored.tasks(), topology.tasks());
    assert_eq!(
        deployment_names(client.data()).await.unwrap(),
        vec!["taken".to_string()]
    );
    assert!(load_topology(client.data(), "other").await.unwrap().is_none());
    assert!(client.instance_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deployment_name_must_not_contain_shard_separator() {
    let mut functions = FunctionRegistry::new();
    functions.register_producer("empty", |_, _: &cra_core::vertex::ShardingInfo| {
        Ok(Dataset::default())
    });
    let topology = crate::sharded_dataset::ShardedDataset::produce("empty")
        .compile(&functions)
        .unwrap();
    let client = ClientLibrary::new(DataProvider::in_memory(), ClientConfig::default());

    for name in ["", "a$b"] {
        let descriptor = DeploymentDescriptor::new(name).with_instances(["w1"]);
        assert!(deploy(topology.clone(), &client, descriptor).await.is_err());
    }
}
