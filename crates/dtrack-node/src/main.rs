use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use dtrack_node::config::{load_file_config, Args, NodeConfig};
use dtrack_node::cycle::{run_detection_listener, CycleEngine};
use dtrack_node::detector::NullDetector;
use dtrack_node::discovery::{run_discovery_and_sync_listener, scan_subnet};
use dtrack_node::registry::{PeerRecord, PeerRegistry};
use dtrack_node::routing::{run_periodic_broadcast, run_routing_listener, RoutingTable};
use dtrack_node::sync::{align_to_next_boundary, wait_for_sync, SyncManager};
use dtrack_node::tracker::{ChannelSink, GlobalTracker, TrackSink};
use dtrack_node::transport::bind_udp;
use dtrack_types::DiscoveredNode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dtrack_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let file_config = load_file_config(args.config.as_deref());
    let config = NodeConfig::from_args(&args, &file_config);

    info!(
        "starting node {} on {}:{} (discovery port {})",
        config.node_id, config.host, config.base_port, config.discovery_port
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing the current cycle");
                running.store(false, Ordering::Relaxed);
            }
        });
    }

    let detection_socket =
        Arc::new(bind_udp("detection", &config.host, config.base_port).await.context("binding detection socket")?);
    let routing_socket =
        Arc::new(bind_udp("routing", &config.host, config.base_port + 1).await.context("binding routing socket")?);
    let discovery_socket = Arc::new(
        bind_udp("discovery", &config.host, config.discovery_port).await.context("binding discovery socket")?,
    );

    // Populate the peer registry: manual neighbors first, then whatever
    // subnet auto-discovery turns up (discovery is best-effort and never
    // fatal if it finds nothing).
    let registry = PeerRegistry::new();
    registry.upsert(PeerRecord {
        node_id: config.node_id.clone(),
        endpoint: format!("{}:{}", config.host, config.base_port).parse()?,
        link_cost: 0,
        last_seen: std::time::Instant::now(),
    });
    for neighbor in &config.neighbors {
        registry.upsert(PeerRecord {
            node_id: neighbor.node_id.clone(),
            endpoint: format!("{}:{}", neighbor.host, neighbor.port).parse()?,
            link_cost: 1,
            last_seen: std::time::Instant::now(),
        });
    }
    if config.discover {
        let found = scan_subnet(&config.host, config.discovery_port, Duration::from_millis(200)).await;
        for node in found {
            registry.upsert(PeerRecord {
                node_id: node.node_id.clone(),
                endpoint: format!("{}:{}", node.host, node.port).parse()?,
                link_cost: 1,
                last_seen: std::time::Instant::now(),
            });
        }
    }

    // Routing neighbors: direct peers, addressed on their routing port.
    let mut routing_neighbors: HashMap<String, (SocketAddr, u32)> = HashMap::new();
    for peer in registry.peers_excluding(&config.node_id) {
        let mut routing_addr = peer.endpoint;
        routing_addr.set_port(routing_addr.port() + 1);
        routing_neighbors.insert(peer.node_id, (routing_addr, peer.link_cost));
    }
    let routing = RoutingTable::new(config.node_id.clone(), routing_neighbors);

    // Sync barrier: wait for the cohort to stabilize, then align to the
    // next 10-second wall-clock boundary before any cycling starts.
    let seed_peers: Vec<(String, SocketAddr)> = registry
        .peers_excluding(&config.node_id)
        .into_iter()
        .map(|p| (p.node_id, SocketAddr::new(p.endpoint.ip(), config.discovery_port)))
        .collect();
    let self_sync_addr: SocketAddr = format!("{}:{}", config.host, config.discovery_port).parse()?;
    let sync_manager = SyncManager::new(
        config.node_id.clone(),
        self_sync_addr,
        seed_peers,
        Duration::from_secs(config.sync_grace_secs),
        Duration::from_secs(config.sync_stale_secs),
    );

    // Discovery requests and sync envelopes share one port, so a single
    // task owns the one receive loop on `discovery_socket` and dispatches
    // each datagram to whichever protocol it parses as.
    let discovery_and_sync = tokio::spawn(run_discovery_and_sync_listener(
        DiscoveredNode::new(config.node_id.clone(), config.host.clone(), config.base_port),
        discovery_socket.clone(),
        sync_manager.clone(),
        running.clone(),
    ));

    let ready = wait_for_sync(&sync_manager, &discovery_socket, Duration::from_secs(config.sync_timeout_secs)).await;
    info!("sync barrier released with {} node(s)", ready.len());
    align_to_next_boundary().await;

    // Routing's own long-lived activities. Advertise once immediately so
    // direct routes to neighbors exist before the first cycle, rather than
    // waiting out the first periodic interval.
    dtrack_node::routing::broadcast_routing_table(&routing, &routing_socket).await;
    tokio::spawn(run_routing_listener(routing.clone(), routing_socket.clone(), running.clone()));
    tokio::spawn(run_periodic_broadcast(
        routing.clone(),
        routing_socket.clone(),
        running.clone(),
        Duration::from_secs(5),
    ));

    // The cycle engine and its independent detection listener.
    let engine = CycleEngine::new(
        config.node_id.clone(),
        registry.clone(),
        routing.clone(),
        detection_socket.clone(),
        Duration::from_millis(config.cycle_time_ms),
        Duration::from_millis(config.collection_timeout_ms),
    );
    tokio::spawn(run_detection_listener(engine.handles(), running.clone()));

    let tracker = GlobalTracker::new(config.cluster_eps_m, config.inactive_timeout_frames);
    let (sink, mut sink_rx) = ChannelSink::new(64);
    let sink: Arc<dyn TrackSink> = Arc::new(sink);
    tokio::spawn(async move {
        while let Some(update) = sink_rx.recv().await {
            info!("frame {}: {} globally tracked detection(s)", update.frame_number, update.labeled.len());
        }
    });

    // The local detector is an external collaborator with no shipped
    // implementation in this crate; absent a calibration pipeline this
    // runs with a null detector that contributes nothing, which still
    // exercises discovery, sync, routing, and cycling end to end.
    if config.calibration_path.is_none() {
        tracing::warn!("no calibration path configured, running with a null local detector");
    }
    engine.run(NullDetector, tracker, sink, running.clone()).await;

    // Shutdown: join the startup-phase tasks with a bounded timeout; a
    // thread that doesn't join in time is logged and left behind rather
    // than blocking exit.
    let join_timeout = Duration::from_secs(5);
    if tokio::time::timeout(join_timeout, discovery_and_sync).await.is_err() {
        tracing::warn!("discovery/sync listener did not join within {join_timeout:?}");
    }
    Ok(())
}
