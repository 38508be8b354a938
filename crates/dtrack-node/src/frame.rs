//! The per-cycle data unit shared between the cycle engine (C7, which
//! assembles it) and the global tracker (C8, which consumes it).

use dtrack_types::{Detection, NodeId};
use std::collections::BTreeMap;

/// One cycle's assembled observations. `detections` uses a `BTreeMap` so
/// iteration order is deterministic by `node_id` — the global tracker's
/// clustering depends on a stable item order for its tie-breaks.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_number: u64,
    pub start_time_ms: f64,
    pub detections: BTreeMap<NodeId, Vec<Detection>>,
}

impl Frame {
    pub fn new(frame_number: u64, start_time_ms: f64) -> Self {
        Self { frame_number, start_time_ms, detections: BTreeMap::new() }
    }

    /// A frame is complete once it holds exactly one entry per known peer.
    pub fn is_complete(&self, expected_peers: usize) -> bool {
        self.detections.len() == expected_peers
    }
}
