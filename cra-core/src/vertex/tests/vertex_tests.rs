use std::sync::Arc;

use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

use super::*;

#[test]
fn test_context_rejects_duplicate_endpoint_names() {
    let mut ctx = VertexContext::new("w1", "v");
    let (input, _rx) = ChannelInputEndpoint::new();
    let (output, _tx) = ChannelOutputEndpoint::new();
    ctx.add_input("port", Arc::new(input)).unwrap();
    assert!(ctx.add_output("port", Arc::new(output)).is_err());

    let (inputs, outputs) = ctx.into_endpoints();
    assert_eq!(inputs.len(), 1);
    assert!(outputs.is_empty());
}

#[tokio::test]
async fn test_registry_creates_registered_vertex() {
    let taps = ChannelTaps::new();
    let registry = VertexRegistry::only("channel", ChannelVertex::factory(taps.clone()));
    assert!(registry.contains("channel"));
    assert!(registry.create("missing").is_none());
    assert_eq!(registry.keys(), vec!["channel"]);

    let mut vertex = registry.create("channel").unwrap();
    let mut ctx = VertexContext::new("w1", "relay");
    vertex.initialize(&mut ctx, &[]).await.unwrap();
    let (inputs, outputs) = ctx.into_endpoints();
    assert!(inputs.contains_key(ChannelVertex::INPUT));
    assert!(outputs.contains_key(ChannelVertex::OUTPUT));
    assert!(taps.take_writer("relay").is_some());
    assert!(taps.take_reader("relay").is_some());
    assert!(taps.take_reader("relay").is_none());
}

#[tokio::test]
async fn test_default_fusion_preserves_order() {
    let (output, tx) = ChannelOutputEndpoint::new();
    let (input, mut rx) = ChannelInputEndpoint::new();
    let input: Arc<dyn AsyncInputEndpoint> = Arc::new(input);
    assert!(output.can_fuse_with(input.as_ref(), "b", "in"));

    for i in 0u32..100 {
        tx.send(i.to_be_bytes().to_vec()).await.unwrap();
    }
    drop(tx);

    timeout(
        Duration::from_secs(5),
        output.to_input(input, "a", "out", "b", "in", CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    for i in 0u32..100 {
        assert_eq!(rx.recv().await.unwrap(), i.to_be_bytes().to_vec());
    }
}

#[tokio::test]
async fn test_cancel_stops_output_loop() {
    let (output, _tx) = ChannelOutputEndpoint::new();
    let (stream, _peer) = tokio::io::duplex(64);
    let mut stream: crate::network::BoxedStream = Box::new(stream);
    let cancel = CancellationToken::new();
    cancel.cancel();
    timeout(
        Duration::from_secs(1),
        output.to_stream(&mut stream, "b", "in", cancel),
    )
    .await
    .unwrap()
    .unwrap();
}

#[test]
fn test_shard_names_roundtrip() {
    let name = shard_vertex_name("map", 3);
    assert_eq!(name, "map$3");
    assert_eq!(split_shard_vertex_name(&name), Some(("map", 3)));
    assert_eq!(split_shard_vertex_name("plain"), None);
    assert_eq!(all_to_all_output("out", 2), "out$2");
    assert_eq!(all_to_all_input("in", 0), "in$0");
}

#[test]
fn test_shard_locators() {
    let registry = ShardLocatorRegistry::new();
    let sharding = ShardingInfo::new(vec![4, 5, 6]);
    assert_eq!(registry.locate(&sharding, 7).unwrap(), 5);

    let hashed = ShardingInfo::new(vec![4, 5, 6]).with_locator(sharded::HASH_LOCATOR);
    let first = registry.locate(&hashed, 42).unwrap();
    assert_eq!(registry.locate(&hashed, 42).unwrap(), first);
    assert!(hashed.all_shards.contains(&first));

    let unknown = ShardingInfo::new(vec![0]).with_locator("nope");
    assert!(registry.locate(&unknown, 1).is_err());
    assert!(registry.locate(&ShardingInfo::new(Vec::new()), 1).is_err());
}

#[test]
fn test_sharded_parameter_bytes() {
    let parameter = ShardedVertexParameter {
        shard_id: 1,
        sharding: ShardingInfo::new(vec![0, 1]),
        parameter: vec![9, 9],
    };
    let decoded = ShardedVertexParameter::from_bytes(&parameter.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, parameter);
}
