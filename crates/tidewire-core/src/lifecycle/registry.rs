//! Live connections keyed by remote address, plus the pending-handshake set.

use std::net::SocketAddr;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use tracing::warn;

use crate::connection::Connection;
use crate::errors::AdmissionRejected;

/// Concurrent registry of admitted connections.
///
/// Every address in the pending set is also registered. The live count is
/// reserved atomically on admission so concurrent accepts never overshoot
/// the ceiling.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SocketAddr, Arc<Connection>>,
    pending: DashSet<SocketAddr>,
    live: AtomicUsize,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` and mark it pending, unless `max > 0` and the live
    /// count has already reached `max`. Returns the live count after
    /// admission.
    pub fn admit(&self, conn: &Arc<Connection>, max: usize) -> Result<usize, AdmissionRejected> {
        let remote = conn.remote_addr();
        let previous = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (max == 0 || live < max).then_some(live + 1)
            })
            .map_err(|live| AdmissionRejected { remote, live, max })?;

        if let Some(replaced) = self.connections.insert(remote, Arc::clone(conn)) {
            let _ = self.live.fetch_sub(1, Ordering::AcqRel);
            warn!(
                remote = %remote,
                replaced = %replaced.id(),
                "remote address re-registered, previous entry replaced"
            );
        }
        let _ = self.pending.insert(remote);
        Ok(previous + 1)
    }

    fn owns(&self, conn: &Connection) -> bool {
        self.connections
            .get(&conn.remote_addr())
            .is_some_and(|entry| ptr::eq(Arc::as_ptr(entry.value()), conn))
    }

    /// Remove `conn` from the pending set. Returns whether it was pending.
    pub fn clear_pending(&self, conn: &Connection) -> bool {
        self.owns(conn) && self.pending.remove(&conn.remote_addr()).is_some()
    }

    /// Remove `conn` entirely. Returns `false` if it was not registered
    /// (already removed, or its address now belongs to another connection).
    pub fn remove(&self, conn: &Connection) -> bool {
        if !self.owns(conn) {
            return false;
        }
        let remote = conn.remote_addr();
        let _ = self.pending.remove(&remote);
        let removed = self
            .connections
            .remove_if(&remote, |_, entry| ptr::eq(Arc::as_ptr(entry), conn))
            .is_some();
        if removed {
            let _ = self.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Connection registered for `remote`.
    pub fn get(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.get(remote).map(|e| Arc::clone(e.value()))
    }

    /// Whether `remote` is awaiting its handshake.
    pub fn is_pending(&self, remote: &SocketAddr) -> bool {
        self.pending.contains(remote)
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections awaiting their handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Every connection awaiting its handshake.
    pub fn pending(&self) -> Vec<Arc<Connection>> {
        let addrs: Vec<SocketAddr> = self.pending.iter().map(|a| *a).collect();
        addrs.iter().filter_map(|a| self.get(a)).collect()
    }

    /// Remove everything, returning what was registered.
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        let drained = self.snapshot();
        for conn in &drained {
            let _ = self.remove(conn);
        }
        drained
    }
}
