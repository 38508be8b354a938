//! C3 — Sync Manager.
//!
//! A cluster-wide barrier with a variable cohort size: every node
//! broadcasts "I am ready" to every known peer's sync port and waits until
//! the cohort it knows about is both fully ready and has not grown for a
//! grace window — this is how the barrier avoids releasing right as a
//! slow discovery response is still in flight. After release, every node
//! waits until the next 10-second wall-clock boundary as the
//! system's only clock-alignment mechanism.

use crate::transport::send_json;
use dtrack_types::{NodeId, SyncEnvelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CohortEntry {
    endpoint: SocketAddr,
    ready: bool,
    last_seen: Instant,
}

/// Tracks the currently-known cohort and whether each member has announced
/// readiness. Cheaply cloneable — internal state is `Arc`-shared.
#[derive(Clone)]
pub struct SyncManager {
    node_id: NodeId,
    grace_window: Duration,
    stale_after: Duration,
    cohort: Arc<Mutex<HashMap<NodeId, CohortEntry>>>,
    last_growth: Arc<Mutex<Instant>>,
}

impl SyncManager {
    pub fn new(
        node_id: NodeId,
        self_endpoint: SocketAddr,
        seed_peers: impl IntoIterator<Item = (NodeId, SocketAddr)>,
        grace_window: Duration,
        stale_after: Duration,
    ) -> Self {
        let now = Instant::now();
        let mut cohort = HashMap::new();
        cohort.insert(
            node_id.clone(),
            CohortEntry { endpoint: self_endpoint, ready: false, last_seen: now },
        );
        for (id, endpoint) in seed_peers {
            cohort.entry(id).or_insert(CohortEntry { endpoint, ready: false, last_seen: now });
        }
        Self {
            node_id,
            grace_window,
            stale_after,
            cohort: Arc::new(Mutex::new(cohort)),
            last_growth: Arc::new(Mutex::new(now)),
        }
    }

    /// Add a newly-seen peer to the cohort (enlarging it and resetting the
    /// grace window), or refresh `last_seen` if already known.
    pub fn note_peer(&self, node_id: &str, endpoint: SocketAddr) {
        let mut guard = self.cohort.lock().unwrap();
        match guard.get_mut(node_id) {
            Some(entry) => entry.last_seen = Instant::now(),
            None => {
                guard.insert(
                    node_id.to_string(),
                    CohortEntry { endpoint, ready: false, last_seen: Instant::now() },
                );
                drop(guard);
                *self.last_growth.lock().unwrap() = Instant::now();
            }
        }
    }

    pub fn mark_ready(&self, node_id: &str) {
        let mut guard = self.cohort.lock().unwrap();
        if let Some(entry) = guard.get_mut(node_id) {
            entry.ready = true;
            entry.last_seen = Instant::now();
        }
    }

    pub fn mark_disconnected(&self, node_id: &str) {
        let mut guard = self.cohort.lock().unwrap();
        guard.remove(node_id);
    }

    /// Drop cohort members (other than self) unseen for longer than the
    /// stale threshold.
    pub fn drop_stale(&self) {
        let stale_after = self.stale_after;
        let self_id = self.node_id.clone();
        let mut guard = self.cohort.lock().unwrap();
        guard.retain(|id, e| id == &self_id || e.last_seen.elapsed() < stale_after);
    }

    pub fn ready_count(&self) -> usize {
        self.cohort.lock().unwrap().values().filter(|e| e.ready).count()
    }

    pub fn expected_count(&self) -> usize {
        self.cohort.lock().unwrap().len()
    }

    /// The barrier may release: every currently-known cohort member is
    /// ready, and the cohort hasn't grown within the grace window.
    pub fn is_stable_and_ready(&self) -> bool {
        let all_ready = {
            let guard = self.cohort.lock().unwrap();
            !guard.is_empty() && guard.values().all(|e| e.ready)
        };
        all_ready && self.last_growth.lock().unwrap().elapsed() >= self.grace_window
    }

    /// The ready cohort at the moment of calling — what gets surfaced on
    /// release or on timeout.
    pub fn ready_peers(&self) -> Vec<(NodeId, SocketAddr)> {
        self.cohort
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.ready)
            .map(|(id, e)| (id.clone(), e.endpoint))
            .collect()
    }

    fn peer_endpoints(&self) -> Vec<(NodeId, SocketAddr)> {
        self.cohort
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id != &self.node_id)
            .map(|(id, e)| (id.clone(), e.endpoint))
            .collect()
    }
}

/// Broadcast this node's ready/disconnect status to every other known
/// cohort member.
pub async fn broadcast_status(manager: &SyncManager, socket: &UdpSocket, ready: bool) {
    let envelope = if ready {
        SyncEnvelope::ready(manager.node_id.clone())
    } else {
        SyncEnvelope::disconnect(manager.node_id.clone())
    };
    for (peer_id, endpoint) in manager.peer_endpoints() {
        if let Err(e) = send_json(socket, endpoint, &envelope).await {
            warn!("sync: failed to notify {peer_id} at {endpoint}: {e}");
        }
    }
}

/// Apply one inbound `sync_ready`/`sync_disconnect` envelope to the cohort.
///
/// There is no standalone sync receive loop: a UDP socket delivers each
/// datagram to exactly one pending `recv_from`, and this port is shared
/// with discovery traffic, so [`crate::discovery::run_discovery_and_sync_listener`]
/// owns the single receive loop on that socket and calls this function for
/// whatever doesn't parse as a discovery message.
pub fn apply_envelope(manager: &SyncManager, envelope: SyncEnvelope, addr: SocketAddr) {
    if envelope.status {
        manager.note_peer(&envelope.node_id, addr);
        manager.mark_ready(&envelope.node_id);
        debug!("sync: node {} ready", envelope.node_id);
    } else {
        manager.mark_disconnected(&envelope.node_id);
        info!("sync: node {} disconnected", envelope.node_id);
    }
}

/// Run the barrier to completion: announce readiness, then poll until the
/// cohort is stable-and-ready or `timeout` elapses. Always returns the
/// cohort that was ready at the moment of return — on timeout that may be
/// just `self` (a one-node cluster is well-defined).
pub async fn wait_for_sync(
    manager: &SyncManager,
    socket: &UdpSocket,
    timeout: Duration,
) -> Vec<(NodeId, SocketAddr)> {
    manager.mark_ready(&manager.node_id.clone());
    broadcast_status(manager, socket, true).await;

    let deadline = Instant::now() + timeout;
    loop {
        manager.drop_stale();
        if manager.is_stable_and_ready() {
            info!(
                "sync: barrier released with {}/{} ready",
                manager.ready_count(),
                manager.expected_count()
            );
            return manager.ready_peers();
        }
        if Instant::now() >= deadline {
            let err = crate::error::DtrackError::SyncTimeout {
                ready: manager.ready_count(),
                expected: manager.expected_count(),
            };
            warn!("{err}");
            return manager.ready_peers();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sleep until the next 10-second wall-clock boundary. If the next
/// boundary is under 1 second away, wait for the one after — the system's
/// only clock-alignment mechanism.
pub async fn align_to_next_boundary() {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let millis_into_second = now.subsec_millis() as u64;
    let seconds_now = now.as_secs() % 10;
    let mut wait_ms = (10 - seconds_now) * 1000 - millis_into_second;
    if wait_ms < 1000 {
        wait_ms += 10_000;
    }
    debug!("sync: aligning to next 10s boundary, waiting {wait_ms}ms");
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
}
