use super::*;
use crate::network::stream::BoxedStream;

fn conn(port: u16) -> StreamConnection {
    let (stream, _peer) = tokio::io::duplex(64);
    StreamConnection {
        from_address: "127.0.0.1".to_string(),
        from_port: 1,
        to_address: "127.0.0.1".to_string(),
        to_port: port,
        stream: Box::new(stream) as BoxedStream,
    }
}

#[test]
fn test_return_beyond_capacity_is_rejected() {
    let pool = ConnectionPool::new(2);
    assert!(pool.return_connection(conn(10)).is_ok());
    assert!(pool.return_connection(conn(11)).is_ok());

    let rejected = pool.return_connection(conn(12)).unwrap_err();
    assert_eq!(rejected.to_port, 12);
    assert_eq!(pool.len(), 2);
}

#[test]
fn test_get_on_empty_pool_does_not_block() {
    let pool = ConnectionPool::new(4);
    assert!(pool.get().is_none());
    assert!(pool.is_empty());
}

#[test]
fn test_get_is_fifo_and_free_drains() {
    let pool = ConnectionPool::unlimited();
    for port in 0..5 {
        pool.return_connection(conn(port)).unwrap();
    }
    assert_eq!(pool.get().unwrap().to_port, 0);
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.free(), 4);
    assert!(pool.get().is_none());
}

#[test]
fn test_peer_pools_track_created_sockets() {
    let pools = PeerPools::new(8);
    assert_eq!(pools.created_count(), 0);
    pools.record_created("127.0.0.1:10");
    pools.record_created("127.0.0.1:11");

    pools.return_connection(conn(10)).unwrap();
    assert_eq!(pools.idle_count(), 1);
    assert!(pools.get("127.0.0.1:11").is_none());
    assert_eq!(pools.get("127.0.0.1:10").unwrap().to_port, 10);
    assert_eq!(pools.created_count(), 2);
}
