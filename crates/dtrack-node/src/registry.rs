//! C1 — Peer Registry.
//!
//! The authoritative list of participating nodes and their transport
//! addresses. Source of truth for "expected peers" used by both the sync
//! barrier and the cycle engine's frame-completion check.

use dtrack_types::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// One known peer, including self (with `link_cost == 0`).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub link_cost: u32,
    pub last_seen: Instant,
}

/// Lock discipline: a single `std::sync::Mutex`, held only for memory
/// operations — never across a socket send/receive.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<NodeId, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Insert or refresh a peer. Refreshing (same node_id, new data)
    /// updates `last_seen` and is how discovery/sync stay idempotent under
    /// duplicate responses.
    pub fn upsert(&self, peer: PeerRecord) {
        let mut guard = self.inner.lock().unwrap();
        guard.insert(peer.node_id.clone(), peer);
    }

    pub fn remove(&self, node_id: &str) -> Option<PeerRecord> {
        let mut guard = self.inner.lock().unwrap();
        guard.remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<PeerRecord> {
        let guard = self.inner.lock().unwrap();
        guard.get(node_id).cloned()
    }

    /// All known peers including self, in no particular order.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let guard = self.inner.lock().unwrap();
        guard.values().cloned().collect()
    }

    /// All known peers other than `node_id`.
    pub fn peers_excluding(&self, node_id: &str) -> Vec<PeerRecord> {
        let guard = self.inner.lock().unwrap();
        guard.values().filter(|p| p.node_id != node_id).cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(node_id)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, port: u16) -> PeerRecord {
        PeerRecord {
            node_id: id.to_string(),
            endpoint: format!("127.0.0.1:{port}").parse().unwrap(),
            link_cost: 1,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn upsert_and_count() {
        let reg = PeerRegistry::new();
        reg.upsert(peer("A", 5050));
        reg.upsert(peer("B", 5051));
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn upsert_is_idempotent_on_same_node_id() {
        let reg = PeerRegistry::new();
        reg.upsert(peer("A", 5050));
        reg.upsert(peer("A", 5050));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn remove_drops_peer() {
        let reg = PeerRegistry::new();
        reg.upsert(peer("A", 5050));
        assert!(reg.remove("A").is_some());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn peers_excluding_omits_self() {
        let reg = PeerRegistry::new();
        reg.upsert(peer("A", 5050));
        reg.upsert(peer("B", 5051));
        let others = reg.peers_excluding("A");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].node_id, "B");
    }
}
