//! C4 — Routing Table Manager.
//!
//! Standard distance-vector routing over the routing datagram socket
//! (`base_port + 1`). Every node advertises its table to its direct
//! neighbors every 5 seconds and immediately on any change; relaxation is
//! the textbook Bellman-Ford update. Split-horizon is applied when
//! building the snapshot sent to a given neighbor, so a route is never
//! advertised back to the neighbor it was learned through.

use crate::transport::{recv_with_timeout, send_json, ROUTING_BUF_BYTES};
use dtrack_types::{Distance, NodeId, WireMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct NeighborInfo {
    endpoint: SocketAddr,
    link_cost: Distance,
}

/// Lock discipline: one mutex over the table entries, never held across a
/// socket send.
#[derive(Clone)]
pub struct RoutingTable {
    node_id: NodeId,
    neighbors: Arc<HashMap<NodeId, NeighborInfo>>,
    addr_to_neighbor: Arc<HashMap<SocketAddr, NodeId>>,
    inner: Arc<Mutex<HashMap<NodeId, (Distance, NodeId)>>>,
}

impl RoutingTable {
    /// `neighbors` maps a direct neighbor's id to its routing endpoint
    /// (`host:base_port+1`) and link cost.
    pub fn new(node_id: NodeId, neighbors: HashMap<NodeId, (SocketAddr, Distance)>) -> Self {
        let mut table = HashMap::new();
        table.insert(node_id.clone(), (0, node_id.clone()));

        let mut addr_to_neighbor = HashMap::new();
        let neighbors: HashMap<NodeId, NeighborInfo> = neighbors
            .into_iter()
            .map(|(id, (endpoint, link_cost))| {
                addr_to_neighbor.insert(endpoint, id.clone());
                (id, NeighborInfo { endpoint, link_cost })
            })
            .collect();

        Self {
            node_id,
            neighbors: Arc::new(neighbors),
            addr_to_neighbor: Arc::new(addr_to_neighbor),
            inner: Arc::new(Mutex::new(table)),
        }
    }

    pub fn snapshot(&self) -> HashMap<NodeId, (Distance, NodeId)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn lookup(&self, dest: &str) -> Option<(Distance, NodeId)> {
        self.inner.lock().unwrap().get(dest).cloned()
    }

    fn neighbor_id_for_addr(&self, addr: SocketAddr) -> Option<NodeId> {
        self.addr_to_neighbor.get(&addr).cloned()
    }

    /// The table snapshot to advertise to `neighbor` — entries whose
    /// `next_hop == neighbor` are withheld (split-horizon).
    fn snapshot_for_neighbor(&self, neighbor: &str) -> HashMap<NodeId, (Distance, NodeId)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (_, next_hop))| next_hop != neighbor)
            .map(|(dest, entry)| (dest.clone(), entry.clone()))
            .collect()
    }

    /// Apply relaxation using a neighbor's advertised table. Returns `true`
    /// if anything changed (the signal to re-broadcast immediately).
    pub fn relax(&self, neighbor: &str, advertised: &HashMap<NodeId, (Distance, NodeId)>) -> bool {
        let Some(info) = self.neighbors.get(neighbor) else {
            warn!("routing: received table from non-neighbor {neighbor}, ignoring");
            return false;
        };
        let link_cost = info.link_cost;

        let mut guard = self.inner.lock().unwrap();
        let mut changed = false;

        let needs_direct_route = match guard.get(neighbor) {
            Some(&(dist, _)) => link_cost < dist,
            None => true,
        };
        if needs_direct_route {
            guard.insert(neighbor.to_string(), (link_cost, neighbor.to_string()));
            changed = true;
        }

        for (dest, &(dist_n, _)) in advertised {
            if dest == &self.node_id {
                continue;
            }
            let candidate = dist_n + link_cost;
            let better = match guard.get(dest) {
                Some(&(current, _)) => candidate < current,
                None => true,
            };
            if better {
                guard.insert(dest.clone(), (candidate, neighbor.to_string()));
                changed = true;
            }
        }
        changed
    }
}

/// Broadcast the (split-horizon-adjusted) routing table to every direct
/// neighbor.
pub async fn broadcast_routing_table(table: &RoutingTable, socket: &UdpSocket) {
    for (neighbor_id, info) in table.neighbors.iter() {
        let routing_table = table.snapshot_for_neighbor(neighbor_id);
        let msg = WireMessage::RoutingUpdate { routing_table };
        if let Err(e) = send_json(socket, info.endpoint, &msg).await {
            warn!("routing: failed to advertise to {neighbor_id}: {e}");
        }
    }
}

/// Listen for `routing_update` datagrams, relax the table, and
/// re-broadcast immediately whenever relaxation changes anything.
pub async fn run_routing_listener(table: RoutingTable, socket: Arc<UdpSocket>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; ROUTING_BUF_BYTES];
    while running.load(Ordering::Relaxed) {
        match recv_with_timeout(&socket, &mut buf, Duration::from_secs(1)).await {
            None => continue,
            Some(Err(e)) => {
                warn!("routing socket recv error: {e}");
                continue;
            }
            Some(Ok((len, addr))) => {
                let routing_table = match serde_json::from_slice::<WireMessage>(&buf[..len]) {
                    Ok(WireMessage::RoutingUpdate { routing_table }) => routing_table,
                    Ok(_) => continue,
                    Err(source) => {
                        warn!("{}", crate::error::DtrackError::Decode { addr, source });
                        continue;
                    }
                };
                let Some(neighbor_id) = table.neighbor_id_for_addr(addr) else {
                    warn!("routing: update from unrecognized address {addr}, ignoring");
                    continue;
                };
                debug!("routing: update from {neighbor_id}");
                if table.relax(&neighbor_id, &routing_table) {
                    broadcast_routing_table(&table, &socket).await;
                }
            }
        }
    }
}

/// Broadcast the table every `interval` until `running` clears.
pub async fn run_periodic_broadcast(
    table: RoutingTable,
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; caller already sent the initial broadcast
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        broadcast_routing_table(&table, &socket).await;
    }
}
