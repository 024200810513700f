use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};

use super::*;
use crate::metadata::VertexConnectionInfo;
use crate::vertex::{ChannelTaps, ChannelVertex};

const WAIT: Duration = Duration::from_secs(5);

fn config(instance: &str) -> WorkerConfig {
    WorkerConfig::new(instance, 0)
        .with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .without_recovery()
}

fn registry(taps: &ChannelTaps) -> Arc<VertexRegistry> {
    Arc::new(VertexRegistry::only(
        "channel",
        ChannelVertex::factory(taps.clone()),
    ))
}

fn placement(instance: &str, vertex: &str) -> VertexInfo {
    VertexInfo {
        instance_name: instance.to_string(),
        vertex_name: vertex.to_string(),
        vertex_definition: "channel".to_string(),
        vertex_create_action: "channel".to_string(),
        is_active: true,
        ..VertexInfo::default()
    }
}

async fn place(data: &DataProvider, instance: &str, vertex: &str) {
    data.vertices
        .insert_or_replace(placement(instance, vertex), ANY_VERSION)
        .await
        .unwrap();
}

fn wire(from: &str, to: &str) -> ConnectRequest {
    ConnectRequest::new(from, ChannelVertex::OUTPUT, to, ChannelVertex::INPUT)
}

fn client_dialer() -> Dialer {
    Dialer::new("127.0.0.1", 0, 4, None)
}

async fn expect_records(rx: &mut mpsc::Receiver<Vec<u8>>, expected: &[&[u8]]) {
    for record in expected {
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.as_slice(), *record);
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
async fn test_start_publishes_instance_row_and_answers_ping() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(config("w1"), data.clone(), registry(&ChannelTaps::new()), None)
        .await
        .unwrap();

    let row = data.vertices.get_row_for_instance("w1").await.unwrap().unwrap();
    assert_eq!(row.address, "127.0.0.1");
    assert_eq!(row.port, worker.port());
    assert!(worker.port() > 0);

    let dialer = client_dialer();
    let code = dialer
        .call("127.0.0.1", worker.port(), &ControlFrame::empty(ControlMessage::Ping))
        .await
        .unwrap();
    assert_eq!(code, CraErrorCode::Success);
    assert_eq!(dialer.pools().idle_count(), 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_load_vertex_registers_endpoints_and_rejects_duplicates() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(config("w1"), data.clone(), registry(&ChannelTaps::new()), None)
        .await
        .unwrap();

    let err = worker.load_vertex("ghost").await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexNotFound);

    place(&data, "w1", "relay").await;
    worker.load_vertex("relay").await.unwrap();
    assert_eq!(worker.hosted_vertices(), vec!["relay"]);

    let endpoints = data.endpoints.get_endpoints("relay").await.unwrap();
    assert_eq!(endpoints.len(), 2);
    let input = data
        .endpoints
        .get_endpoint("relay", ChannelVertex::INPUT)
        .await
        .unwrap()
        .unwrap();
    assert!(input.is_input);

    let err = worker.load_vertex("relay").await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexAlreadyExists);

    let mut odd = placement("w1", "odd");
    odd.vertex_create_action = "unknown".to_string();
    data.vertices.insert_or_replace(odd, ANY_VERSION).await.unwrap();
    assert!(matches!(
        worker.load_vertex("odd").await,
        Err(CraError::Unsupported(_))
    ));

    worker.unload_vertex("relay").await.unwrap();
    assert!(worker.hosted_vertices().is_empty());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_load_vertex_over_control_stream() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let worker = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "relay").await;

    let dialer = client_dialer();
    let frame = ControlFrame::with(
        ControlMessage::LoadVertex,
        &LoadVertexRequest {
            vertex_name: "relay".to_string(),
        },
    )
    .unwrap();
    let code = dialer.call("127.0.0.1", worker.port(), &frame).await.unwrap();
    assert_eq!(code, CraErrorCode::Success);
    assert!(taps.take_writer("relay").is_some());

    let code = dialer.call("127.0.0.1", worker.port(), &frame).await.unwrap();
    assert_eq!(code, CraErrorCode::VertexAlreadyExists);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_recovering_worker_defers_requests() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(config("w1"), data.clone(), registry(&ChannelTaps::new()), None)
        .await
        .unwrap();
    place(&data, "w1", "relay").await;
    worker.inner.recovering.send_replace(true);
    assert!(worker.is_recovering());

    let dialer = client_dialer();
    let load = ControlFrame::with(
        ControlMessage::LoadVertex,
        &LoadVertexRequest {
            vertex_name: "relay".to_string(),
        },
    )
    .unwrap();
    let code = dialer.call("127.0.0.1", worker.port(), &load).await.unwrap();
    assert_eq!(code, CraErrorCode::ServerRecovering);

    let connect = ControlFrame::with(ControlMessage::ConnectVertexInitiator, &wire("relay", "x")).unwrap();
    let code = dialer.call("127.0.0.1", worker.port(), &connect).await.unwrap();
    assert_eq!(code, CraErrorCode::ServerRecovering);

    worker.inner.recovering.send_replace(false);
    timeout(WAIT, worker.wait_recovered()).await.unwrap();
    let code = dialer.call("127.0.0.1", worker.port(), &load).await.unwrap();
    assert_eq!(code, CraErrorCode::Success);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_sideloaded_worker_refuses_dynamic_loading() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(
        WorkerConfig::sideloaded("client"),
        data.clone(),
        registry(&ChannelTaps::new()),
        None,
    )
    .await
    .unwrap();
    assert!(!worker.is_recovering());
    place(&data, "client", "relay").await;

    let load = ControlFrame::with(
        ControlMessage::LoadVertex,
        &LoadVertexRequest {
            vertex_name: "relay".to_string(),
        },
    )
    .unwrap();
    let code = client_dialer()
        .call("127.0.0.1", worker.port(), &load)
        .await
        .unwrap();
    assert_eq!(code, CraErrorCode::ConnectionEstablishFailed);
    assert!(worker.hosted_vertices().is_empty());

    worker.load_vertex("relay").await.unwrap();
    worker.shutdown().await;
}

#[tokio::test]
async fn test_connect_streams_records_between_workers() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let w1 = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    let w2 = Worker::start(config("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    w1.load_vertex("a").await.unwrap();
    w2.load_vertex("b").await.unwrap();

    w1.connect(&wire("a", "b"), false).await.unwrap();

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    tx.send(b"hello".to_vec()).await.unwrap();
    tx.send(b"world".to_vec()).await.unwrap();
    expect_records(&mut rx, &[b"hello", b"world"]).await;

    drop(tx);
    wait_until_unbound(&w1).await;
    wait_until_unbound(&w2).await;
    assert_eq!(w1.created_connections(), 1);
    assert_eq!(w1.idle_connections(), 1);

    w1.shutdown().await;
    w2.shutdown().await;
}

#[tokio::test]
async fn test_reverse_connect_is_initiated_by_input_side() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let w1 = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    let w2 = Worker::start(config("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    w1.load_vertex("a").await.unwrap();
    w2.load_vertex("b").await.unwrap();

    w2.connect(&wire("a", "b"), true).await.unwrap();
    assert_eq!(w2.created_connections(), 1);
    assert_eq!(w1.created_connections(), 0);

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    tx.send(vec![1, 2, 3]).await.unwrap();
    expect_records(&mut rx, &[&[1, 2, 3]]).await;

    w1.shutdown().await;
    w2.shutdown().await;
}

#[tokio::test]
async fn test_colocated_connection_is_fused() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let worker = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w1", "b").await;
    worker.load_vertex("a").await.unwrap();
    worker.load_vertex("b").await.unwrap();

    worker.connect(&wire("a", "b"), false).await.unwrap();
    assert_eq!(worker.bound_endpoint_count(), 2);

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    for i in 0u8..10 {
        tx.send(vec![i]).await.unwrap();
    }
    for i in 0u8..10 {
        expect_records(&mut rx, &[&[i]]).await;
    }
    assert_eq!(worker.created_connections(), 0);

    drop(tx);
    wait_until_unbound(&worker).await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_connect_errors_are_typed() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let w1 = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    let w2 = Worker::start(config("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    w1.load_vertex("a").await.unwrap();

    let err = w1.connect(&wire("missing", "b"), false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexNotFound);

    let bad_output = ConnectRequest::new("a", "nope", "b", ChannelVertex::INPUT);
    let err = w1.connect(&bad_output, false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexOutputNotFound);

    let err = w1.connect(&wire("a", "nowhere"), false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::ActiveVertexNotFound);

    // b has a row but is not loaded on w2.
    let err = w1.connect(&wire("a", "b"), false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexNotFound);
    assert_eq!(w1.bound_endpoint_count(), 0);

    w2.load_vertex("b").await.unwrap();
    let bad_input = ConnectRequest::new("a", ChannelVertex::OUTPUT, "b", "nope");
    let err = w1.connect(&bad_input, false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::VertexInputNotFound);

    w1.shutdown().await;
    w2.shutdown().await;
}

#[tokio::test]
async fn test_endpoint_serves_one_connection_at_a_time() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let w1 = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    let w2 = Worker::start(config("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    place(&data, "w2", "c").await;
    w1.load_vertex("a").await.unwrap();
    w2.load_vertex("b").await.unwrap();
    w2.load_vertex("c").await.unwrap();

    w1.connect(&wire("a", "b"), false).await.unwrap();
    let err = w1.connect(&wire("a", "c"), false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::ConnectionEstablishFailed);

    // The input side of b is already taken on w2.
    w1.load_vertex("a2").await.unwrap_err();
    place(&data, "w1", "a2").await;
    w1.load_vertex("a2").await.unwrap();
    let err = w1.connect(&wire("a2", "b"), false).await.unwrap_err();
    assert_eq!(err.code(), CraErrorCode::ConnectionEstablishFailed);
    assert_eq!(w1.bound_endpoint_count(), 1);

    w1.shutdown().await;
    w2.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_cancels_live_connection() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    let w1 = Worker::start(config("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    let w2 = Worker::start(config("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    w1.load_vertex("a").await.unwrap();
    w2.load_vertex("b").await.unwrap();
    let request = wire("a", "b");
    w1.connect(&request, false).await.unwrap();

    let dialer = client_dialer();
    let frame = ControlFrame::with(ControlMessage::DisconnectVertex, &request).unwrap();
    let code = dialer.call("127.0.0.1", w2.port(), &frame).await.unwrap();
    assert_eq!(code, CraErrorCode::Success);
    assert_eq!(w1.disconnect(&request), 1);

    wait_until_unbound(&w1).await;
    wait_until_unbound(&w2).await;
    assert_eq!(w1.disconnect(&request), 0);

    // The output endpoint is free again.
    w1.connect(&request, false).await.unwrap();

    w1.shutdown().await;
    w2.shutdown().await;
}

struct RejectingHandshake;

#[async_trait]
impl SecureStreamConnectionDescriptor for RejectingHandshake {
    async fn create_secure_client(&self, _stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        Err(anyhow::anyhow!("certificate rejected"))
    }

    async fn create_secure_server(&self, _stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        Err(anyhow::anyhow!("certificate rejected"))
    }
}

#[derive(Default)]
struct CountingPassthrough {
    servers: AtomicUsize,
}

#[async_trait]
impl SecureStreamConnectionDescriptor for CountingPassthrough {
    async fn create_secure_client(&self, stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        Ok(stream)
    }

    async fn create_secure_server(&self, stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        self.servers.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

#[tokio::test]
async fn test_secure_handshake_failure_is_connection_failure() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(
        config("w1"),
        data.clone(),
        registry(&ChannelTaps::new()),
        Some(Arc::new(RejectingHandshake)),
    )
    .await
    .unwrap();
    let ping = ControlFrame::empty(ControlMessage::Ping);

    let err = client_dialer()
        .call("127.0.0.1", worker.port(), &ping)
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::ConnectionEstablishFailed(_)));

    let secure_client = Dialer::new("127.0.0.1", 0, 4, Some(Arc::new(RejectingHandshake)));
    let err = secure_client
        .call("127.0.0.1", worker.port(), &ping)
        .await
        .unwrap_err();
    assert!(matches!(err, CraError::ConnectionEstablishFailed(_)));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_secure_descriptor_wraps_accepted_streams() {
    let secure = Arc::new(CountingPassthrough::default());
    let worker = Worker::start(
        config("w1"),
        DataProvider::in_memory(),
        registry(&ChannelTaps::new()),
        Some(secure.clone()),
    )
    .await
    .unwrap();

    let dialer = Dialer::new("127.0.0.1", 0, 4, Some(secure.clone()));
    let ping = ControlFrame::empty(ControlMessage::Ping);
    for _ in 0..3 {
        let code = dialer.call("127.0.0.1", worker.port(), &ping).await.unwrap();
        assert_eq!(code, CraErrorCode::Success);
    }
    // One pooled stream carried all three pings.
    assert_eq!(secure.servers.load(Ordering::SeqCst), 1);
    assert_eq!(dialer.pools().created_count(), 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_restores_deleted_instance_row() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(
        config("w1").with_heartbeat(Duration::from_millis(20)),
        data.clone(),
        registry(&ChannelTaps::new()),
        None,
    )
    .await
    .unwrap();

    let row = data.vertices.get_row_for_instance("w1").await.unwrap().unwrap();
    data.vertices.delete(&row).await.unwrap();

    timeout(WAIT, async {
        while !data.vertices.contains_instance("w1").await.unwrap() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    worker.shutdown().await;
}

#[tokio::test]
async fn test_dropped_worker_stops_serving_and_heartbeating() {
    let data = DataProvider::in_memory();
    let worker = Worker::start(
        config("w1").with_heartbeat(Duration::from_millis(20)),
        data.clone(),
        registry(&ChannelTaps::new()),
        None,
    )
    .await
    .unwrap();
    let port = worker.port();
    drop(worker);

    timeout(WAIT, async {
        while tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    sleep(Duration::from_millis(50)).await;
    let row = data.vertices.get_row_for_instance("w1").await.unwrap().unwrap();
    data.vertices.delete(&row).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(!data.vertices.contains_instance("w1").await.unwrap());
}

#[tokio::test]
async fn test_restart_recovers_vertices_and_connections() {
    let data = DataProvider::in_memory();
    let taps = ChannelTaps::new();
    place(&data, "w1", "a").await;
    place(&data, "w2", "b").await;
    data.connections
        .add(
            VertexConnectionInfo::new("a", ChannelVertex::OUTPUT, "b", ChannelVertex::INPUT),
            crate::metadata::NEW_ROW,
        )
        .await
        .unwrap();

    let recovering = |instance: &str| WorkerConfig::new(instance, 0).with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let w2 = Worker::start(recovering("w2"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    timeout(WAIT, w2.wait_recovered()).await.unwrap();
    assert_eq!(w2.hosted_vertices(), vec!["b"]);

    let w1 = Worker::start(recovering("w1"), data.clone(), registry(&taps), None)
        .await
        .unwrap();
    timeout(WAIT, w1.wait_recovered()).await.unwrap();
    assert_eq!(w1.hosted_vertices(), vec!["a"]);

    let tx = taps.take_writer("a").unwrap();
    let mut rx = taps.take_reader("b").unwrap();
    tx.send(b"recovered".to_vec()).await.unwrap();
    expect_records(&mut rx, &[b"recovered"]).await;

    w1.shutdown().await;
    w2.shutdown().await;
}

#[test]
fn test_auto_initiator_prefers_local_side() {
    let auto = ConnectionInitiator::Auto;
    assert_eq!(auto.resolve(None, "w1", "w2"), ConnectionInitiator::FromSide);
    assert_eq!(
        auto.resolve(Some("w2"), "w1", "w2"),
        ConnectionInitiator::ToSide
    );
    assert_eq!(
        auto.resolve(Some("w1"), "w1", "w1"),
        ConnectionInitiator::FromSide
    );
    assert_eq!(
        ConnectionInitiator::ToSide.resolve(Some("w1"), "w1", "w2"),
        ConnectionInitiator::ToSide
    );
    assert_eq!(ConnectionState::DataStreaming.to_string(), "DATA_STREAMING");
}
