use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{Receiver, Sender};

use super::stream::StreamConnection;

/// Bounded MPMC queue of idle streams to one peer.
///
/// The size counter is adjusted atomically next to the queue, not under a
/// lock, so capacity rejection is best effort under contention.
pub struct ConnectionPool {
    capacity: Option<usize>,
    tx: Sender<StreamConnection>,
    rx: Receiver<StreamConnection>,
    size: AtomicUsize,
    created: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    pub fn unlimited() -> Self {
        Self::build(None)
    }

    fn build(capacity: Option<usize>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            capacity,
            tx,
            rx,
            size: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    /// Offer a stream back to the pool. A full pool hands it back so the
    /// caller can dispose of it.
    pub fn return_connection(&self, conn: StreamConnection) -> Result<(), StreamConnection> {
        if let Some(capacity) = self.capacity
            && self.size.load(Ordering::Acquire) >= capacity
        {
            tracing::debug!(peer = %conn.peer(), capacity, "connection pool full");
            return Err(conn);
        }
        self.size.fetch_add(1, Ordering::AcqRel);
        self.tx.send(conn).map_err(|err| {
            self.size.fetch_sub(1, Ordering::AcqRel);
            err.into_inner()
        })
    }

    /// Pop an idle stream without blocking.
    pub fn get(&self) -> Option<StreamConnection> {
        let conn = self.rx.try_recv().ok()?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(conn)
    }

    /// Drop every pooled stream. Returns how many were closed.
    pub fn free(&self) -> usize {
        let mut closed = 0;
        while self.get().is_some() {
            closed += 1;
        }
        closed
    }

    /// Approximate number of idle streams.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Count a freshly opened socket.
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::AcqRel);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}

/// One [`ConnectionPool`] per peer address.
pub struct PeerPools {
    capacity: usize,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl PeerPools {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool_for(&self, peer: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().expect("pools poisoned").get(peer) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().expect("pools poisoned");
        Arc::clone(
            pools
                .entry(peer.to_string())
                .or_insert_with(|| Arc::new(ConnectionPool::new(self.capacity))),
        )
    }

    pub fn get(&self, peer: &str) -> Option<StreamConnection> {
        self.pool_for(peer).get()
    }

    pub fn return_connection(&self, conn: StreamConnection) -> Result<(), StreamConnection> {
        self.pool_for(&conn.peer()).return_connection(conn)
    }

    pub fn record_created(&self, peer: &str) {
        self.pool_for(peer).record_created();
    }

    /// Sockets opened across every peer.
    pub fn created_count(&self) -> usize {
        self.pools
            .read()
            .expect("pools poisoned")
            .values()
            .map(|pool| pool.created_count())
            .sum()
    }

    pub fn idle_count(&self) -> usize {
        self.pools
            .read()
            .expect("pools poisoned")
            .values()
            .map(|pool| pool.len())
            .sum()
    }

    pub fn free(&self) -> usize {
        self.pools
            .read()
            .expect("pools poisoned")
            .values()
            .map(|pool| pool.free())
            .sum()
    }
}

#[cfg(test)]
#[path = "tests/connection_pool_tests.rs"]
mod tests;
