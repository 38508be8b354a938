//! C2 — Discovery Service.
//!
//! A request/response probe over the local subnet. The server side answers
//! `discovery_request` with a `discovery_response` describing this node;
//! the client side fans out one lightweight probe per candidate host and
//! collects whatever answers within a per-probe timeout. Failures — no
//! response, connection refused, malformed reply — are silent; discovery
//! is inherently best-effort.

use crate::sync::SyncManager;
use crate::transport::{bind_udp, recv_with_timeout, send_json};
use dtrack_types::{DiscoveredNode, SyncEnvelope, WireMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const PROBE_BUF_BYTES: usize = 1024;

/// Derive the `/24` prefix (first three octets) from a dotted-quad host.
pub fn subnet_prefix(host: &str) -> Option<String> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    Some(parts[..3].join("."))
}

/// Probe a single candidate host, returning its [`DiscoveredNode`] if it
/// answers as a dtrack peer within `timeout`.
pub async fn probe_host(host: &str, discovery_port: u16, timeout: Duration) -> Option<DiscoveredNode> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    let addr: SocketAddr = format!("{host}:{discovery_port}").parse().ok()?;

    send_json(&socket, addr, &WireMessage::DiscoveryRequest).await.ok()?;

    let mut buf = [0u8; PROBE_BUF_BYTES];
    let (len, _from) = recv_with_timeout(&socket, &mut buf, timeout).await?.ok()?;
    match serde_json::from_slice::<WireMessage>(&buf[..len]) {
        Ok(WireMessage::DiscoveryResponse { node }) => Some(node),
        _ => None,
    }
}

/// Scan the `/24` containing `local_host`, probing every other candidate
/// concurrently (one task per host) and collecting whatever responds.
pub async fn scan_subnet(
    local_host: &str,
    discovery_port: u16,
    probe_timeout: Duration,
) -> Vec<DiscoveredNode> {
    let Some(prefix) = subnet_prefix(local_host) else {
        warn!("cannot derive subnet from host {local_host}, skipping auto-discovery");
        return Vec::new();
    };

    let mut tasks = Vec::with_capacity(254);
    for i in 1..255u8 {
        let host = format!("{prefix}.{i}");
        if host == local_host {
            continue;
        }
        tasks.push(tokio::spawn(async move {
            probe_host(&host, discovery_port, probe_timeout).await
        }));
    }

    let mut found = Vec::new();
    for task in tasks {
        if let Ok(Some(node)) = task.await {
            found.push(node);
        }
    }
    found
}

/// Run the single receive loop on the shared discovery/sync socket until
/// `running` clears. Binds nothing itself — the caller supplies the
/// already-bound socket.
///
/// A UDP socket delivers each datagram to exactly one pending `recv_from`,
/// so discovery and sync traffic cannot each run their own independent
/// receive loop against the same socket without randomly stealing each
/// other's datagrams. This loop owns the socket alone: it tries
/// [`WireMessage`] first (discovery requests), and whatever doesn't parse
/// as one falls back to [`SyncEnvelope`] (sync ready/disconnect), handed
/// off to [`crate::sync::apply_envelope`]. A datagram that parses as
/// neither is malformed and is logged and dropped.
pub async fn run_discovery_and_sync_listener(
    self_info: DiscoveredNode,
    socket: Arc<UdpSocket>,
    sync_manager: SyncManager,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; PROBE_BUF_BYTES];
    debug!("discovery/sync listener running for node {}", self_info.node_id);

    while running.load(Ordering::Relaxed) {
        match recv_with_timeout(&socket, &mut buf, Duration::from_secs(1)).await {
            None => continue,
            Some(Err(e)) => {
                warn!("discovery/sync socket recv error: {e}");
                continue;
            }
            Some(Ok((len, addr))) => {
                if let Ok(WireMessage::DiscoveryRequest) = serde_json::from_slice(&buf[..len]) {
                    let response = WireMessage::DiscoveryResponse { node: self_info.clone() };
                    if let Err(e) = send_json(&socket, addr, &response).await {
                        warn!("failed to answer discovery request from {addr}: {e}");
                    }
                    continue;
                }
                match serde_json::from_slice::<SyncEnvelope>(&buf[..len]) {
                    Ok(envelope) => crate::sync::apply_envelope(&sync_manager, envelope, addr),
                    Err(source) => {
                        warn!("{}", crate::error::DtrackError::Decode { addr, source });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_takes_first_three_octets() {
        assert_eq!(subnet_prefix("192.168.1.42").as_deref(), Some("192.168.1"));
    }

    #[test]
    fn subnet_prefix_rejects_malformed_host() {
        assert_eq!(subnet_prefix("not-an-ip"), None);
    }

    fn test_sync_manager(node_id: &str, self_endpoint: SocketAddr) -> SyncManager {
        SyncManager::new(node_id.into(), self_endpoint, [], Duration::from_millis(0), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn responder_answers_discovery_request() {
        let self_info = DiscoveredNode::new("A", "127.0.0.1", 5050);
        let socket = Arc::new(bind_udp("test", "127.0.0.1", 0).await.unwrap());
        let addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let sync_manager = test_sync_manager("A", addr);

        let running_clone = running.clone();
        let responder = tokio::spawn(run_discovery_and_sync_listener(
            self_info.clone(),
            socket,
            sync_manager,
            running_clone,
        ));

        let node = probe_host("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .expect("expected a discovery response");
        assert_eq!(node, self_info);

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(2), responder).await;
    }

    #[tokio::test]
    async fn sync_ready_arriving_on_the_shared_socket_is_routed_to_the_cohort() {
        let self_info = DiscoveredNode::new("A", "127.0.0.1", 5050);
        let socket = Arc::new(bind_udp("test", "127.0.0.1", 0).await.unwrap());
        let listener_addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let sync_manager = test_sync_manager("A", listener_addr);

        let running_clone = running.clone();
        let sync_manager_clone = sync_manager.clone();
        let listener = tokio::spawn(run_discovery_and_sync_listener(
            self_info.clone(),
            socket,
            sync_manager_clone,
            running_clone,
        ));

        // Interleave a discovery probe with sync traffic on the same port,
        // the scenario the old split-socket design would randomly drop one
        // half of.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_json(&sender, listener_addr, &SyncEnvelope::ready("B".into()))
            .await
            .unwrap();
        let node = probe_host("127.0.0.1", listener_addr.port(), Duration::from_secs(2))
            .await
            .expect("discovery must still be answered while sync traffic shares the port");
        assert_eq!(node, self_info);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync_manager.ready_count(), 1, "B's sync_ready must reach the cohort, not be lost");

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(2), listener).await;
    }

    #[tokio::test]
    async fn probe_silently_fails_against_nothing_listening() {
        // Port 1 is reserved and nothing should be bound there during tests.
        let result = probe_host("127.0.0.1", 1, Duration::from_millis(50)).await;
        assert!(result.is_none());
    }
}
