//! C8 — Global Tracker.
//!
//! Fuses one frame's multi-node detections into stable global identities.
//! Clustering uses union-find connected-components instead of a DBSCAN
//! crate: with `min_samples = 1` every point is its own core point, so
//! DBSCAN degenerates exactly to connected components under the `eps`
//! adjacency relation. No clustering crate in
//! the retrieval pack covers this, so the equivalent is hand-rolled rather
//! than reaching for an unfamiliar dependency.

use crate::frame::Frame;
use dtrack_types::{Detection, NodeId, WorldPosition};
use std::collections::HashMap;
use tracing::debug;

/// A detection stamped with the global identity the tracker assigned it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDetection {
    pub node_id: NodeId,
    pub global_id: u64,
    pub detection: Detection,
}

/// What the tracker publishes to its sink after processing a frame.
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub frame_number: u64,
    pub labeled: Vec<LabeledDetection>,
}

/// Where tracked output goes. Kept deliberately non-blocking: a blocking
/// HTTP call from inside the tracker's hot path would stall the next
/// frame's processing behind a stalled network peer, so this contract
/// rules that out by construction.
pub trait TrackSink: Send + Sync {
    fn push(&self, update: TrackUpdate);
}

/// A sink that just logs — useful as a default and in tests.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl TrackSink for LoggingSink {
    fn push(&self, update: TrackUpdate) {
        debug!("frame {}: {} tracked detections", update.frame_number, update.labeled.len());
    }
}

/// A sink backed by a bounded channel; a full or closed channel drops the
/// update with a warning rather than blocking the tracker.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<TrackUpdate>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<TrackUpdate>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TrackSink for ChannelSink {
    fn push(&self, update: TrackUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            tracing::warn!("track sink channel unavailable, dropping update: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    last_position: WorldPosition,
    last_seen_frame: u64,
}

/// Per-node global tracker state: the active track table and the
/// monotonic `global_id` counter. Not `Send`-shared — owned by the cycle
/// engine and driven only from the PROCESS phase.
pub struct GlobalTracker {
    eps: f64,
    inactive_timeout: u64,
    next_global_id: u64,
    tracks: HashMap<u64, Track>,
}

impl GlobalTracker {
    pub fn new(eps: f64, inactive_timeout: u64) -> Self {
        Self { eps, inactive_timeout, next_global_id: 1, tracks: HashMap::new() }
    }

    /// Process one frame: cluster its positioned detections, match clusters
    /// to existing tracks, stamp global ids, and purge stale tracks. Frames
    /// with no valid world positions are a no-op beyond the purge.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<LabeledDetection> {
        let mut items: Vec<(NodeId, &Detection, WorldPosition)> = Vec::new();
        for (node_id, detections) in &frame.detections {
            for detection in detections {
                if let Some(pos) = detection.world_position {
                    items.push((node_id.clone(), detection, pos));
                }
            }
        }

        if items.is_empty() {
            self.purge_inactive(frame.frame_number);
            return Vec::new();
        }

        let positions: Vec<WorldPosition> = items.iter().map(|(_, _, pos)| *pos).collect();
        let cluster_ids = cluster_by_eps(&positions, self.eps);
        let cluster_count = cluster_ids.iter().copied().max().map(|m| m + 1).unwrap_or(0);

        let mut centroids = vec![(0.0f64, 0.0f64, 0.0f64, 0u32); cluster_count];
        for (i, &cid) in cluster_ids.iter().enumerate() {
            let p = positions[i];
            let entry = &mut centroids[cid];
            entry.0 += p.x;
            entry.1 += p.y;
            entry.2 += p.z;
            entry.3 += 1;
        }
        let centroids: Vec<WorldPosition> = centroids
            .into_iter()
            .map(|(sx, sy, sz, n)| WorldPosition { x: sx / n as f64, y: sy / n as f64, z: sz / n as f64 })
            .collect();

        let cluster_to_global = self.match_clusters_to_tracks(&centroids);

        let mut out = Vec::with_capacity(items.len());
        for (i, (node_id, detection, _pos)) in items.into_iter().enumerate() {
            let cid = cluster_ids[i];
            let global_id = cluster_to_global[cid];
            self.tracks.insert(
                global_id,
                Track { last_position: centroids[cid], last_seen_frame: frame.frame_number },
            );
            out.push(LabeledDetection { node_id, global_id, detection: detection.clone() });
        }

        self.purge_inactive(frame.frame_number);
        out
    }

    /// Greedy nearest-track matching, in cluster-id order. Ties are broken
    /// by iterating candidate tracks in ascending `global_id` and only
    /// replacing the current best on a strictly shorter distance.
    fn match_clusters_to_tracks(&mut self, centroids: &[WorldPosition]) -> Vec<u64> {
        let mut candidates: Vec<u64> = self.tracks.keys().copied().collect();
        candidates.sort_unstable();

        let mut used = vec![false; candidates.len()];
        let mut mapping = Vec::with_capacity(centroids.len());

        for centroid in centroids {
            let mut best: Option<(usize, f64)> = None;
            for (idx, &global_id) in candidates.iter().enumerate() {
                if used[idx] {
                    continue;
                }
                let dist = self.tracks[&global_id].last_position.distance(centroid);
                if dist > self.eps {
                    continue;
                }
                match best {
                    Some((_, best_dist)) if dist < best_dist => best = Some((idx, dist)),
                    None => best = Some((idx, dist)),
                    _ => {}
                }
            }
            match best {
                Some((idx, _)) => {
                    used[idx] = true;
                    mapping.push(candidates[idx]);
                }
                None => {
                    let global_id = self.next_global_id;
                    self.next_global_id += 1;
                    mapping.push(global_id);
                }
            }
        }
        mapping
    }

    fn purge_inactive(&mut self, current_frame: u64) {
        let inactive_timeout = self.inactive_timeout;
        self.tracks.retain(|_, t| current_frame.saturating_sub(t.last_seen_frame) <= inactive_timeout);
    }

    #[cfg(test)]
    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

/// Connected components of the "within `eps`" graph over `positions`,
/// returned as a cluster id per position. Cluster ids are assigned in
/// order of first occurrence, so the result is deterministic for a given
/// input order — `Frame::detections` is a `BTreeMap`, which is what makes
/// that order stable across runs.
fn cluster_by_eps(positions: &[WorldPosition], eps: f64) -> Vec<usize> {
    let n = positions.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if positions[i].distance(&positions[j]) <= eps {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut root_to_cluster: HashMap<usize, usize> = HashMap::new();
    let mut labels = vec![0usize; n];
    for i in 0..n {
        let root = find(&mut parent, i);
        let next_id = root_to_cluster.len();
        labels[i] = *root_to_cluster.entry(root).or_insert(next_id);
    }
    labels
}
