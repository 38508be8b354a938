//! # dtrack-types
//!
//! Shared wire types for the dtrack distributed camera-tracking fleet.
//!
//! These types are used by:
//! - `dtrack-node`: every peer in the fleet, for both sending and parsing
//!   datagrams exchanged over the detection/routing/discovery sockets.
//! - any external `LocalDetector` implementation that needs to produce
//!   `Detection` values for the cycle engine to broadcast.
//!
//! ## Coordinate conventions
//!
//! - `BoundingBox` is in image pixels, `(x1, y1)` top-left, `(x2, y2)`
//!   bottom-right.
//! - `WorldPosition` is in ground-plane meters; `y` is fixed to `0` by the
//!   projection collaborator (ground plane assumption), `x`/`z` span the
//!   plane.
//!
//! ## Wire format
//!
//! All messages are JSON objects, UTF-8, bounded to 64 KB per datagram.
//! [`WireMessage`] covers everything dispatched by a `type` discriminant
//! (discovery requests/responses, routing updates, detections).
//! [`SyncEnvelope`] has no `type` field — it is distinguished by arriving
//! on the discovery/sync port and failing to parse as a [`WireMessage`],
//! matching the source system's sync protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque, cluster-unique identifier for a node. Stable for the life of the
/// cluster; never reused.
pub type NodeId = String;

/// A destination-agnostic distance, summed along an advertised path.
pub type Distance = u32;

// ─── Detections ───────────────────────────────────────────────────────────

/// A detection bounding box in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// A point on the shared ground plane, in meters. `y` is conventionally 0
/// (the projection collaborator pins detections to the ground plane); it is
/// carried here rather than hardcoded so the type round-trips whatever the
/// collaborator actually sends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WorldPosition {
    /// Euclidean distance between two ground-plane points.
    pub fn distance(&self, other: &WorldPosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// A single person detection produced by a node's `LocalDetector` for one
/// DETECT phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Node-local, monotonic per-node tracking id. Not a global identity.
    pub tracking_id: u64,
    /// Confidence in `[0, 100]`.
    pub confidence: f64,
    pub bbox: BoundingBox,
    /// Absent when the projection collaborator could not place the
    /// detection on the ground plane (e.g. out of calibrated view).
    pub world_position: Option<WorldPosition>,
}

// ─── Discovery ────────────────────────────────────────────────────────────

/// Node info carried in a `discovery_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: String,
    /// `1` for active. Kept as an integer (not bool) to match the wire
    /// format the discovery protocol was distilled from.
    pub status: u8,
}

impl DiscoveredNode {
    pub fn new(node_id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            kind: "dtrack".to_string(),
            status: 1,
        }
    }
}

// ─── Tagged envelope for detection/routing/discovery sockets ─────────────

/// Every message with a `type` discriminant, dispatched by the transport
/// layer without further interpretation. Unknown `type` values deserialize
/// to [`WireMessage::Unknown`] and are dropped silently by callers; unknown
/// fields on known variants are ignored by `serde` by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    DiscoveryRequest,
    DiscoveryResponse {
        node: DiscoveredNode,
    },
    RoutingUpdate {
        /// dest_id -> (distance, next_hop_id)
        routing_table: HashMap<NodeId, (Distance, NodeId)>,
    },
    Detection {
        frame_number: u64,
        source_node: NodeId,
        destination_node: NodeId,
        timestamp_ms: f64,
        detections: Vec<Detection>,
    },
    /// Catch-all for forward-compatible/unrecognized message types.
    #[serde(other)]
    Unknown,
}

/// Sync-barrier message: a node announcing readiness or disconnection.
/// Carries no `type` tag — it is recognized by arriving on the
/// discovery/sync port and failing to parse as a [`WireMessage`]. Mirrors
/// the source protocol, which reuses the discovery port for sync traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub node_id: NodeId,
    pub status: bool,
}

impl SyncEnvelope {
    pub fn ready(node_id: impl Into<NodeId>) -> Self {
        Self { node_id: node_id.into(), status: true }
    }

    pub fn disconnect(node_id: impl Into<NodeId>) -> Self {
        Self { node_id: node_id.into(), status: false }
    }
}
