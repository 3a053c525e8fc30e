//! Open connections, for diagnostics and bandwidth sampling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use conduit_http::connection::ConnectionStats;
use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<u64, Arc<ConnectionStats>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `stats` until the returned guard is dropped.
    pub fn register(&self, stats: Arc<ConnectionStats>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, stats);
        Registration { id, connections: Arc::clone(&self.connections) }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Oldest connection first.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionStats>> {
        let mut connections: Vec<_> = self.connections.iter().map(|entry| Arc::clone(entry.value())).collect();
        connections.sort_by_key(|stats| stats.connected_at());
        connections
    }

    pub fn sample_bandwidth(&self, now: Instant) {
        for entry in self.connections.iter() {
            entry.value().update_bandwidth(now);
        }
    }
}

/// Keeps a connection listed in its [`ConnectionRegistry`].
#[derive(Debug)]
pub struct Registration {
    id: u64,
    connections: Arc<DashMap<u64, Arc<ConnectionStats>>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.connections.remove(&self.id);
    }
}
