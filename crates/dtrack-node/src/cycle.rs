//! C7 — Distributed Cycle Engine, the central core.
//!
//! Drives the DETECT -> COLLECT -> PROCESS -> padding loop once per cycle,
//! forever, until asked to stop. `frame_number`/`current_frame` live under
//! one lock (`FrameState`); the early-arrival buffer lives under a second,
//! separate lock. Neither is ever held across a socket send or the
//! detector call. The detection listener (a second, independent activity —
//! see [`run_detection_listener`]) shares both locks but owns neither the
//! detector nor the tracker.

use crate::detector::LocalDetector;
use crate::frame::Frame;
use crate::registry::PeerRegistry;
use crate::routing::RoutingTable;
use crate::tracker::{GlobalTracker, TrackSink, TrackUpdate};
use crate::transport::{recv_with_timeout, send_json, DETECTION_BUF_BYTES};
use dtrack_types::{Detection, NodeId, WireMessage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::warn;

/// Detections that arrived for a frame not yet current, keyed by
/// `frame_number` then `source_node`. Bounded in practice to at most the
/// next cycle's frame — the detection listener only ever buffers
/// `current + 1`, and PROCESS evicts every entry `<= frame_number` once it
/// finishes.
type EarlyBuffer = BTreeMap<u64, BTreeMap<NodeId, Vec<Detection>>>;

struct FrameState {
    frame_number: u64,
    frame: Frame,
}

fn now_ms() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64() * 1000.0
}

/// Route `msg` toward `destination_node` via the routing table's next hop,
/// resolving that hop's detection-port endpoint through the peer registry.
/// Used both for a node's own broadcast and for relaying a message that
/// arrived addressed to someone else.
async fn send_toward(
    registry: &PeerRegistry,
    routing: &RoutingTable,
    socket: &UdpSocket,
    destination_node: &str,
    msg: &WireMessage,
) {
    let Some((_, next_hop)) = routing.lookup(destination_node) else {
        warn!("no route to {destination_node}, dropping detection for this cycle");
        return;
    };
    let Some(hop_endpoint) = registry.get(&next_hop).map(|p| p.endpoint) else {
        warn!("next hop {next_hop} toward {destination_node} not in registry, dropping");
        return;
    };
    if let Err(e) = send_json(socket, hop_endpoint, msg).await {
        warn!("failed to send detection toward {destination_node} via {next_hop}: {e}");
    }
}

/// Handles shared between the cycle driver and the detection listener.
/// Cheap to clone — everything inside is already `Arc`-backed.
#[derive(Clone)]
pub struct CycleHandles {
    node_id: NodeId,
    registry: PeerRegistry,
    routing: RoutingTable,
    detection_socket: Arc<UdpSocket>,
    frame_lock: Arc<Mutex<FrameState>>,
    early_lock: Arc<Mutex<EarlyBuffer>>,
}

/// Listen for inbound `detection` datagrams until `running` clears.
/// A message addressed to someone else is relayed toward its destination
/// via the routing table and never touches the local frame; a message
/// addressed here is classified by `frame_number` into the current frame
/// or the early buffer, exactly as the cycle driver expects to find it.
/// Never calls the local detector.
pub async fn run_detection_listener(handles: CycleHandles, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; DETECTION_BUF_BYTES];
    while running.load(Ordering::Relaxed) {
        match recv_with_timeout(&handles.detection_socket, &mut buf, Duration::from_millis(10)).await {
            None => continue,
            Some(Err(e)) => {
                warn!("detection socket recv error: {e}");
                continue;
            }
            Some(Ok((len, addr))) => {
                let (frame_number, source_node, destination_node, timestamp_ms, detections) =
                    match serde_json::from_slice::<WireMessage>(&buf[..len]) {
                        Ok(WireMessage::Detection { frame_number, source_node, destination_node, timestamp_ms, detections }) => {
                            (frame_number, source_node, destination_node, timestamp_ms, detections)
                        }
                        Ok(_) => continue,
                        Err(source) => {
                            warn!("{}", crate::error::DtrackError::Decode { addr, source });
                            continue;
                        }
                    };

                if destination_node != handles.node_id {
                    let msg = WireMessage::Detection {
                        frame_number,
                        source_node,
                        destination_node: destination_node.clone(),
                        timestamp_ms,
                        detections,
                    };
                    send_toward(&handles.registry, &handles.routing, &handles.detection_socket, &destination_node, &msg)
                        .await;
                    continue;
                }

                let mut guard = handles.frame_lock.lock().unwrap();
                if frame_number == guard.frame_number {
                    guard.frame.detections.entry(source_node).or_default().extend(detections);
                } else if frame_number == guard.frame_number + 1 {
                    drop(guard);
                    let mut early = handles.early_lock.lock().unwrap();
                    early.entry(frame_number).or_default().entry(source_node).or_default().extend(detections);
                }
                // Any other frame_number is stale or too far in the future
                // and is dropped silently.
            }
        }
    }
}

/// Owns the per-cycle DETECT/COLLECT/PROCESS/padding sequencing. Cloning a
/// handle out (via [`CycleEngine::handles`]) is how the detection listener
/// gets access to the same locks without taking ownership of the
/// detector/tracker, which stay exclusive to [`CycleEngine::run`].
pub struct CycleEngine {
    node_id: NodeId,
    registry: PeerRegistry,
    routing: RoutingTable,
    detection_socket: Arc<UdpSocket>,
    cycle_time: Duration,
    collection_timeout: Duration,
    frame_lock: Arc<Mutex<FrameState>>,
    early_lock: Arc<Mutex<EarlyBuffer>>,
}

impl CycleEngine {
    pub fn new(
        node_id: NodeId,
        registry: PeerRegistry,
        routing: RoutingTable,
        detection_socket: Arc<UdpSocket>,
        cycle_time: Duration,
        collection_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            routing,
            detection_socket,
            cycle_time,
            collection_timeout,
            frame_lock: Arc::new(Mutex::new(FrameState { frame_number: 0, frame: Frame::new(0, 0.0) })),
            early_lock: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn handles(&self) -> CycleHandles {
        CycleHandles {
            node_id: self.node_id.clone(),
            registry: self.registry.clone(),
            routing: self.routing.clone(),
            detection_socket: self.detection_socket.clone(),
            frame_lock: self.frame_lock.clone(),
            early_lock: self.early_lock.clone(),
        }
    }

    /// Run the cycle loop until `running` clears.
    pub async fn run(
        &self,
        mut detector: impl LocalDetector,
        mut tracker: GlobalTracker,
        sink: Arc<dyn TrackSink>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Relaxed) {
            self.run_one_cycle(&mut detector, &mut tracker, &sink).await;
        }
    }

    async fn run_one_cycle(
        &self,
        detector: &mut impl LocalDetector,
        tracker: &mut GlobalTracker,
        sink: &Arc<dyn TrackSink>,
    ) {
        let cycle_start = Instant::now();
        let wall_start_ms = now_ms();

        // 1. Cycle anchor.
        let frame_number = {
            let mut guard = self.frame_lock.lock().unwrap();
            guard.frame_number += 1;
            guard.frame = Frame::new(guard.frame_number, wall_start_ms);
            guard.frame_number
        };

        // 2. DETECT phase. A detector that panics (the closest Rust analog
        // to the source's "exception from the detection pipeline") must
        // not take the cycle down with it — the frame proceeds with an
        // empty local detection list instead, same as a slow detector that
        // missed the budget.
        let local_detections = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| detector.detect())) {
            Ok(detections) => detections,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "local detector panicked".to_string());
                warn!("{}", crate::error::DtrackError::DetectorFailed { reason });
                Vec::new()
            }
        };
        {
            let mut guard = self.frame_lock.lock().unwrap();
            guard.frame.detections.insert(self.node_id.clone(), local_detections.clone());
        }
        self.drain_early_buffer(frame_number);
        self.broadcast_detection(frame_number, wall_start_ms, &local_detections).await;

        // 3. COLLECT phase.
        let expected_peers = self.registry.count();
        loop {
            let complete = self.frame_lock.lock().unwrap().frame.is_complete(expected_peers);
            if complete || cycle_start.elapsed() >= self.collection_timeout {
                if !complete {
                    warn!("cycle {frame_number}: COLLECT timed out with a partial frame");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // 4. PROCESS phase.
        let completed_frame = {
            let mut guard = self.frame_lock.lock().unwrap();
            std::mem::replace(&mut guard.frame, Frame::new(frame_number, wall_start_ms))
        };
        let labeled = tracker.process_frame(&completed_frame);
        sink.push(TrackUpdate { frame_number, labeled });
        self.early_lock.lock().unwrap().retain(|&fnum, _| fnum > frame_number);

        // 5. Cycle padding.
        let elapsed = cycle_start.elapsed();
        if elapsed < self.cycle_time {
            tokio::time::sleep(self.cycle_time - elapsed).await;
        } else {
            warn!("cycle {frame_number}: overran budget by {:?}", elapsed - self.cycle_time);
        }
    }

    /// Fold any detections buffered for `frame_number` into the now-current
    /// frame, then forget them — the re-entry case from the early-arrival
    /// property: this must leave `current_frame.detections` exactly as if
    /// those messages had arrived during COLLECT instead.
    fn drain_early_buffer(&self, frame_number: u64) {
        let Some(by_source) = self.early_lock.lock().unwrap().remove(&frame_number) else {
            return;
        };
        let mut guard = self.frame_lock.lock().unwrap();
        for (source, detections) in by_source {
            guard.frame.detections.entry(source).or_default().extend(detections);
        }
    }

    async fn broadcast_detection(&self, frame_number: u64, timestamp_ms: f64, detections: &[Detection]) {
        for peer in self.registry.peers_excluding(&self.node_id) {
            let msg = WireMessage::Detection {
                frame_number,
                source_node: self.node_id.clone(),
                destination_node: peer.node_id.clone(),
                timestamp_ms,
                detections: detections.to_vec(),
            };
            send_toward(&self.registry, &self.routing, &self.detection_socket, &peer.node_id, &msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{NullDetector, PanickingDetector, ScriptedDetector};
    use crate::registry::PeerRecord;
    use crate::tracker::ChannelSink;
    use crate::transport::bind_udp;
    use dtrack_types::{BoundingBox, WorldPosition};
    use std::collections::HashMap;

    fn peer(id: &str) -> PeerRecord {
        PeerRecord {
            node_id: id.to_string(),
            endpoint: "127.0.0.1:0".parse().unwrap(),
            link_cost: 0,
            last_seen: Instant::now(),
        }
    }

    fn sample_detection() -> Detection {
        Detection {
            tracking_id: 1,
            confidence: 88.0,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            world_position: Some(WorldPosition { x: 1.0, y: 0.0, z: 2.0 }),
        }
    }

    async fn engine_with_self_only(cycle_time: Duration, collection_timeout: Duration) -> CycleEngine {
        let registry = PeerRegistry::new();
        registry.upsert(peer("A"));
        let routing = RoutingTable::new("A".into(), HashMap::new());
        let socket = Arc::new(bind_udp("test", "127.0.0.1", 0).await.unwrap());
        CycleEngine::new("A".into(), registry, routing, socket, cycle_time, collection_timeout)
    }

    #[tokio::test]
    async fn single_node_cycle_produces_one_labeled_detection() {
        let engine = engine_with_self_only(Duration::from_millis(30), Duration::from_millis(30)).await;
        let mut detector = ScriptedDetector::new(vec![vec![sample_detection()]]);
        let mut tracker = GlobalTracker::new(0.5, 10);
        let (sink, mut rx) = ChannelSink::new(4);
        let sink: Arc<dyn TrackSink> = Arc::new(sink);

        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;

        let update = rx.try_recv().expect("expected a track update");
        assert_eq!(update.frame_number, 1);
        assert_eq!(update.labeled.len(), 1);
    }

    #[tokio::test]
    async fn frame_number_increases_by_exactly_one_each_cycle() {
        let engine = engine_with_self_only(Duration::from_millis(10), Duration::from_millis(10)).await;
        let mut detector = NullDetector;
        let mut tracker = GlobalTracker::new(0.5, 10);
        let (sink, mut rx) = ChannelSink::new(4);
        let sink: Arc<dyn TrackSink> = Arc::new(sink);

        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;
        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;
        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;

        let numbers: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|u| u.frame_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn early_buffered_detection_is_folded_in_without_a_second_round_trip() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("A"));
        registry.upsert(peer("B"));
        let routing = RoutingTable::new("A".into(), HashMap::new());
        let socket = Arc::new(bind_udp("test", "127.0.0.1", 0).await.unwrap());
        let engine = CycleEngine::new(
            "A".into(),
            registry,
            routing,
            socket,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        // Seed frame 1's early buffer as if B's detection for frame 1
        // arrived while this node was still starting up.
        {
            let mut by_source = BTreeMap::new();
            by_source.insert("B".to_string(), vec![sample_detection()]);
            engine.early_lock.lock().unwrap().insert(1, by_source);
        }

        let mut detector = NullDetector;
        let mut tracker = GlobalTracker::new(0.5, 10);
        let (sink, mut rx) = ChannelSink::new(4);
        let sink: Arc<dyn TrackSink> = Arc::new(sink);

        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;

        let update = rx.try_recv().expect("expected a track update");
        assert_eq!(update.frame_number, 1);
        assert_eq!(update.labeled.len(), 1, "B's early-buffered detection must be folded into frame 1");
        assert!(
            !engine.early_lock.lock().unwrap().contains_key(&1),
            "the early buffer must not retain an entry for an already-processed frame"
        );
    }

    #[tokio::test]
    async fn collect_times_out_with_a_partial_frame_when_a_peer_never_answers() {
        let registry = PeerRegistry::new();
        registry.upsert(peer("A"));
        registry.upsert(peer("B")); // never sends anything
        let routing = RoutingTable::new("A".into(), HashMap::new());
        let socket = Arc::new(bind_udp("test", "127.0.0.1", 0).await.unwrap());
        let engine = CycleEngine::new(
            "A".into(),
            registry,
            routing,
            socket,
            Duration::from_millis(30),
            Duration::from_millis(20),
        );

        let mut detector = ScriptedDetector::new(vec![vec![sample_detection()]]);
        let mut tracker = GlobalTracker::new(0.5, 10);
        let (sink, mut rx) = ChannelSink::new(4);
        let sink: Arc<dyn TrackSink> = Arc::new(sink);

        let started = Instant::now();
        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;
        assert!(started.elapsed() >= Duration::from_millis(20));

        let update = rx.try_recv().expect("expected a track update even with a partial frame");
        assert_eq!(update.labeled.len(), 1, "only A's own detection made it into the frame");
    }

    #[tokio::test]
    async fn panicking_detector_does_not_abort_the_cycle() {
        let engine = engine_with_self_only(Duration::from_millis(20), Duration::from_millis(20)).await;
        let mut detector = PanickingDetector;
        let mut tracker = GlobalTracker::new(0.5, 10);
        let (sink, mut rx) = ChannelSink::new(4);
        let sink: Arc<dyn TrackSink> = Arc::new(sink);

        engine.run_one_cycle(&mut detector, &mut tracker, &sink).await;

        let update = rx.try_recv().expect("the cycle must still complete and produce an update");
        assert_eq!(update.frame_number, 1);
        assert!(update.labeled.is_empty(), "a panicking detector contributes no detections this frame");
    }
}
