//! # dtrack-node
//!
//! The runtime for one fleet node: peer discovery, the sync barrier,
//! distance-vector routing, the distributed cycle engine, and the global
//! tracker. See each module for its piece of the system.

pub mod config;
pub mod cycle;
pub mod detector;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod registry;
pub mod routing;
pub mod sync;
pub mod tracker;
pub mod transport;
