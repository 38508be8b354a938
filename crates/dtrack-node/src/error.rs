//! Error types for the node runtime.
//!
//! Only [`DtrackError::Bind`] is fatal — every other variant is logged and
//! absorbed at the call site. Recover locally wherever possible; never let
//! a peer's failure cascade into a local stall.

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum DtrackError {
    #[error("failed to bind {role} socket on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode outgoing message for {addr}: {source}")]
    Encode {
        addr: SocketAddr,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode message from {addr}: {source}")]
    Decode {
        addr: SocketAddr,
        #[source]
        source: serde_json::Error,
    },

    #[error("sync barrier timed out with {ready}/{expected} nodes ready")]
    SyncTimeout { ready: usize, expected: usize },

    #[error("local detector failed: {reason}")]
    DetectorFailed { reason: String },
}
