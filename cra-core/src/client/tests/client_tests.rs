use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};

use super::*;
use crate::config::WorkerConfig;
use crate::metadata::EndpointInfo;
use crate::network::frame::{read_frame, write_frame};
use crate::vertex::{ChannelTaps, ChannelVertex, VertexRegistry};

const WAIT: Duration = Duration::from_secs(5);
const DEF: &str = "relay";

fn client_config() -> ClientConfig {
    ClientConfig {
        retry_delay: Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

async fn start_worker(data: &DataProvider, taps: &ChannelTaps, instance: &str) -> Worker {
    let config = WorkerConfig::new(instance, 0)
        .with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .without_recovery();
    let registry = Arc::new(VertexRegistry::only(
        "channel",
        ChannelVertex::factory(taps.clone()),
    ));
    Worker::start(config, data.clone(), registry, None).await.unwrap()
}

async fn cluster(instances: &[&str]) -> (ClientLibrary, ChannelTaps, Vec<Worker>) {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let mut workers = Vec::new();
    for instance in instances {
        workers.push(start_worker(&data, &taps, instance).await);
    }
    let client = ClientLibrary::new(data, client_config());
    client.define_vertex(DEF, "channel").await.unwrap();
    (client, taps, workers)
}

async fn shutdown(workers: Vec<Worker>) {
    for worker in workers {
        worker.shutdown().await;
    }
}

async fn wait_until_unbound(worker: &Worker) {
    timeout(WAIT, async {
        while worker.bound_endpoint_count() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_records_flow_in_order_between_instances() {
    let (client, taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    client
        .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    for i in 0u32..200 {
        tx.send(i.to_be_bytes().to_vec()).await.unwrap();
    }
    for i in 0u32..200 {
        let record = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(record, i.to_be_bytes().to_vec());
    }

    let (outgoing, incoming) = client.vertex_connections("a").await.unwrap();
    assert_eq!(outgoing.len(), 1);
    assert!(incoming.is_empty());
    shutdown(workers).await;
}

#[tokio::test]
async fn test_same_instance_connection_opens_no_socket() {
    let (client, taps, workers) = cluster(&["w1"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w1", "b", DEF, Vec::new()).await.unwrap();
    let before = workers[0].created_connections();

    client
        .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();
    assert_eq!(workers[0].created_connections(), before);

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    tx.send(b"fused".to_vec()).await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"fused");
    assert_eq!(workers[0].created_connections(), before);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_to_side_initiator_connects_in_reverse() {
    let (client, taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    client
        .connect_with(
            "a",
            ChannelVertex::OUTPUT,
            "b",
            ChannelVertex::INPUT,
            ConnectionInitiator::ToSide,
        )
        .await
        .unwrap();
    assert_eq!(workers[0].created_connections(), 0);
    assert_eq!(workers[1].created_connections(), 1);

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    tx.send(vec![42]).await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), vec![42]);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_connect_resolution_errors() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    let out = ChannelVertex::OUTPUT;
    let inp = ChannelVertex::INPUT;

    let err = client.connect("ghost", out, "b", inp).await.unwrap_err();
    assert!(matches!(err, CraError::VertexNotFound(_)));

    let err = client.connect("a", "missing", "b", inp).await.unwrap_err();
    assert!(matches!(err, CraError::VertexEndpointNotFound { .. }));

    let err = client.connect("a", inp, "b", inp).await.unwrap_err();
    assert!(matches!(err, CraError::VertexOutputNotFound { .. }));

    let err = client.connect("a", out, "b", out).await.unwrap_err();
    assert!(matches!(err, CraError::VertexInputNotFound { .. }));

    client
        .data()
        .endpoints
        .add_endpoint(EndpointInfo::new("a", "sync-out", false, false))
        .await
        .unwrap();
    let err = client.connect("a", "sync-out", "b", inp).await.unwrap_err();
    assert!(matches!(err, CraError::VerticesEndpointsNotMatched { .. }));

    client.deactivate_vertex("b").await.unwrap();
    let err = client.connect("a", out, "b", inp).await.unwrap_err();
    assert!(matches!(err, CraError::ActiveVertexNotFound(_)));

    // Failed connects leave no rows behind.
    assert!(client.data().connections.get_all().await.unwrap().is_empty());
    shutdown(workers).await;
}

#[tokio::test]
async fn test_repeated_connect_is_idempotent() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    for _ in 0..2 {
        client
            .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
            .await
            .unwrap();
    }
    assert_eq!(client.data().connections.get_all().await.unwrap().len(), 1);
    assert_eq!(workers[0].bound_endpoint_count(), 1);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_instantiate_enforces_one_active_row() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;

    let err = client
        .instantiate_vertex("w1", "a", "undefined", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::VertexNotFound(_)));
    let err = client
        .instantiate_vertex("w9", "a", DEF, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::InstanceNotFound(_)));

    client.instantiate_vertex("w1", "a", DEF, vec![7]).await.unwrap();
    let err = client
        .instantiate_vertex("w1", "a", DEF, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::VertexAlreadyExists(_)));

    client.instantiate_vertex("w2", "a", DEF, Vec::new()).await.unwrap();
    let rows = client.data().vertices.get_rows_for_vertex("a").await.unwrap();
    assert_eq!(rows.len(), 2);
    let active: Vec<_> = rows.iter().filter(|row| row.is_active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].instance_name, "w2");
    assert_eq!(client.vertex_names().await.unwrap(), vec!["a"]);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_disconnect_removes_row_and_stops_stream() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    client
        .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();
    assert_eq!(workers[0].bound_endpoint_count(), 1);

    client
        .disconnect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();
    assert!(client.data().connections.get_all().await.unwrap().is_empty());
    wait_until_unbound(&workers[0]).await;
    wait_until_unbound(&workers[1]).await;

    // Wire can be made again.
    client
        .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();
    shutdown(workers).await;
}

#[tokio::test]
async fn test_delete_vertex_unloads_and_removes_rows() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client.instantiate_vertex("w2", "b", DEF, Vec::new()).await.unwrap();
    client
        .connect("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT)
        .await
        .unwrap();

    client.delete_vertex("b").await.unwrap();
    assert!(workers[1].hosted_vertices().is_empty());
    let data = client.data();
    assert!(data.vertices.get_rows_for_vertex("b").await.unwrap().is_empty());
    assert!(data.endpoints.get_endpoints("b").await.unwrap().is_empty());
    assert!(data.connections.get_all().await.unwrap().is_empty());
    assert_eq!(workers[0].hosted_vertices(), vec!["a"]);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_sharded_vertex_lifecycle() {
    let (client, _taps, workers) = cluster(&["w1", "w2"]).await;
    client.define_sharded_vertex("sharded-relay", "channel").await.unwrap();
    let placement = vec![("w1".to_string(), vec![0, 1]), ("w2".to_string(), vec![2])];

    let epoch = client
        .instantiate_sharded_vertex("src", "sharded-relay", &placement, b"p", "builtin::modulo")
        .await
        .unwrap();
    assert_eq!(epoch.epoch_id, 0);
    assert_eq!(epoch.added_shards, vec![0, 1, 2]);
    client
        .instantiate_sharded_vertex("dst", "sharded-relay", &placement, b"p", "builtin::modulo")
        .await
        .unwrap();
    assert_eq!(workers[0].hosted_vertices(), vec!["dst$0", "dst$1", "src$0", "src$1"]);
    assert_eq!(workers[1].hosted_vertices(), vec!["dst$2", "src$2"]);

    let row = client
        .data()
        .vertices
        .get_row_for_vertex("w2", "src$2")
        .await
        .unwrap()
        .unwrap();
    assert!(row.is_sharded);
    let parameter = ShardedVertexParameter::from_bytes(&row.vertex_parameter).unwrap();
    assert_eq!(parameter.shard_id, 2);
    assert_eq!(parameter.sharding.all_shards, vec![0, 1, 2]);
    assert_eq!(parameter.parameter, b"p");

    let err = client
        .instantiate_sharded_vertex("src", "sharded-relay", &placement, b"p", "builtin::modulo")
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::VertexAlreadyExists(_)));

    let made = client
        .connect_sharded(
            "src",
            ChannelVertex::OUTPUT,
            "dst",
            ChannelVertex::INPUT,
            ShardedConnectionKind::Aligned,
        )
        .await
        .unwrap();
    assert_eq!(made, 3);

    // Channel vertices expose no per-peer endpoints.
    let err = client
        .connect_sharded(
            "src",
            ChannelVertex::OUTPUT,
            "dst",
            ChannelVertex::INPUT,
            ShardedConnectionKind::AllToAll,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::VertexEndpointNotFound { .. }));

    let grown = client
        .add_shards("src", "sharded-relay", &[("w2".to_string(), vec![3])], b"p")
        .await
        .unwrap();
    assert_eq!(grown.epoch_id, 1);
    assert_eq!(grown.added_shards, vec![3]);
    assert_eq!(grown.shard_ids(), vec![0, 1, 2, 3]);
    assert_eq!(grown.instance_for_shard(3), Some("w2"));

    let shrunk = client.remove_shards("src", &[0, 1]).await.unwrap();
    assert_eq!(shrunk.epoch_id, 2);
    assert_eq!(shrunk.removed_shards, vec![0, 1]);
    assert_eq!(shrunk.all_instances, vec!["w2"]);
    assert!(
        client
            .data()
            .vertices
            .get_rows_for_vertex("src$0")
            .await
            .unwrap()
            .is_empty()
    );
    let err = client.remove_shards("src", &[0]).await.unwrap_err();
    assert!(matches!(err, CraError::VertexNotFound(_)));

    client.delete_vertex("src").await.unwrap();
    assert!(client.latest_sharded_vertex("src").await.unwrap().is_none());
    assert_eq!(workers[1].hosted_vertices(), vec!["dst$2"]);
    shutdown(workers).await;
}

#[tokio::test]
async fn test_local_vertex_on_sideloaded_worker() {
    let (client, taps, workers) = cluster(&["w1"]).await;
    let registry = Arc::new(VertexRegistry::only(
        "channel",
        ChannelVertex::factory(taps.clone()),
    ));
    let local = Worker::start(
        WorkerConfig::sideloaded("client"),
        client.data().clone(),
        registry,
        None,
    )
    .await
    .unwrap();

    let err = client
        .instantiate_vertex("client", "sink", DEF, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), CraErrorCode::ConnectionEstablishFailed);
    client.delete_vertex("sink").await.unwrap();

    client
        .instantiate_local_vertex(&local, "sink", DEF, Vec::new())
        .await
        .unwrap();
    client.instantiate_vertex("w1", "a", DEF, Vec::new()).await.unwrap();
    client
        .connect("a", ChannelVertex::OUTPUT, "sink", ChannelVertex::INPUT)
        .await
        .unwrap();

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("sink").unwrap();
    tx.send(b"to-client".to_vec()).await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), b"to-client");

    local.shutdown().await;
    shutdown(workers).await;
}

#[tokio::test]
async fn test_instance_liveness_and_reset() {
    let (client, _taps, mut workers) = cluster(&["w1", "w2"]).await;
    assert_eq!(client.instance_names().await.unwrap(), vec!["w1", "w2"]);
    assert!(client.is_instance_alive("w1").await.unwrap());
    assert!(!client.is_instance_alive("w9").await.unwrap());

    let w2 = workers.pop().unwrap();
    w2.shutdown().await;
    client.free();
    assert!(!client.is_instance_alive("w2").await.unwrap());

    client.delete_instance("w2").await.unwrap();
    assert_eq!(client.instance_names().await.unwrap(), vec!["w1"]);

    client.reset().await.unwrap();
    assert!(client.instance_names().await.unwrap().is_empty());
    shutdown(workers).await;
}

/// Control server replying to `LoadVertex` with `replies` in order, on a
/// single pooled stream.
async fn scripted_worker(replies: Vec<CraErrorCode>) -> (u16, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut served = 0;
        for code in replies {
            let frame = read_frame(&mut stream).await.unwrap();
            assert_eq!(frame.message, ControlMessage::LoadVertex);
            write_frame(&mut stream, &ControlFrame::ready(code).unwrap())
                .await
                .unwrap();
            served += 1;
        }
        served
    });
    (port, handle)
}

#[tokio::test]
async fn test_recovering_replies_are_retried() {
    let data = DataProvider::in_memory();
    let client = ClientLibrary::new(data.clone(), client_config());
    client.define_vertex(DEF, "channel").await.unwrap();
    let (port, server) = scripted_worker(vec![
        CraErrorCode::ServerRecovering,
        CraErrorCode::ServerRecovering,
        CraErrorCode::Success,
    ])
    .await;
    data.vertices
        .insert_or_replace(VertexInfo::instance("scripted", "127.0.0.1", port), ANY_VERSION)
        .await
        .unwrap();

    timeout(WAIT, client.instantiate_vertex("scripted", "v", DEF, Vec::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timeout(WAIT, server).await.unwrap().unwrap(), 3);
    assert_eq!(client.created_connections(), 1);
}

#[tokio::test]
async fn test_recovering_retries_are_bounded() {
    let data = DataProvider::in_memory();
    let config = ClientConfig {
        recovering_retries: 2,
        ..client_config()
    };
    let client = ClientLibrary::new(data.clone(), config);
    client.define_vertex(DEF, "channel").await.unwrap();
    let (port, server) = scripted_worker(vec![CraErrorCode::ServerRecovering; 3]).await;
    data.vertices
        .insert_or_replace(VertexInfo::instance("scripted", "127.0.0.1", port), ANY_VERSION)
        .await
        .unwrap();

    let err = timeout(WAIT, client.instantiate_vertex("scripted", "v", DEF, Vec::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CraError::ServerRecovering(_)));
    assert_eq!(timeout(WAIT, server).await.unwrap().unwrap(), 3);
}
