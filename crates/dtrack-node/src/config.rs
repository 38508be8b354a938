//! Node configuration: CLI flags layered over an optional `config.toml`,
//! layered over built-in defaults.

use clap::Parser;
use dtrack_types::NodeId;
use serde::Deserialize;

const DEFAULT_DISCOVERY_PORT: u16 = 5000;
const DEFAULT_CYCLE_TIME_MS: u64 = 10_000;
const DEFAULT_COLLECTION_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SYNC_GRACE_SECS: u64 = 5;
const DEFAULT_SYNC_STALE_SECS: u64 = 30;
const DEFAULT_INACTIVE_TIMEOUT_FRAMES: u64 = 10;
const DEFAULT_CLUSTER_EPS_M: f64 = 0.5;

/// One neighbor as given on the command line: `id,host,port`.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborSpec {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl std::str::FromStr for NeighborSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        let node_id = parts.next().ok_or("missing node_id")?.to_string();
        let host = parts.next().ok_or("missing host")?.to_string();
        let port: u16 = parts
            .next()
            .ok_or("missing port")?
            .parse()
            .map_err(|e| format!("invalid port: {e}"))?;
        Ok(Self { node_id, host, port })
    }
}

fn parse_neighbors(raw: &str) -> Vec<NeighborSpec> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Start a fleet node.
#[derive(Debug, Parser)]
#[command(name = "dtrack-node", about = "Distributed multi-camera person-tracking fleet node")]
pub struct Args {
    /// Unique id for this node, stable for the life of the cluster.
    pub node_id: String,

    /// Base port. This node uses `base_port` for detections and
    /// `base_port + 1` for routing updates.
    pub base_port: u16,

    /// Host/interface to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Manual neighbors, `id1,host1,port1;id2,host2,port2;...`.
    #[arg(long, default_value = "")]
    pub neighbors: String,

    /// Enable subnet auto-discovery instead of (or in addition to) manual neighbors.
    #[arg(long)]
    pub discover: bool,

    /// Optional path to a calibration file, passed through opaquely to the
    /// external detector. The core never parses this.
    #[arg(long)]
    pub calibration: Option<String>,

    /// Optional path to a TOML config file layered under the CLI flags above.
    #[arg(long)]
    pub config: Option<String>,
}

/// Fully resolved configuration for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub host: String,
    pub base_port: u16,
    pub discovery_port: u16,
    pub neighbors: Vec<NeighborSpec>,
    pub discover: bool,
    pub calibration_path: Option<String>,
    pub cycle_time_ms: u64,
    pub collection_timeout_ms: u64,
    pub sync_timeout_secs: u64,
    pub sync_grace_secs: u64,
    pub sync_stale_secs: u64,
    pub inactive_timeout_frames: u64,
    pub cluster_eps_m: f64,
}

/// The subset of [`NodeConfig`] that may come from a `config.toml`. Every
/// field is optional; anything absent falls back to the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub discovery_port: Option<u16>,
    pub cycle_time_ms: Option<u64>,
    pub collection_timeout_ms: Option<u64>,
    pub sync_timeout_secs: Option<u64>,
    pub sync_grace_secs: Option<u64>,
    pub sync_stale_secs: Option<u64>,
    pub inactive_timeout_frames: Option<u64>,
    pub cluster_eps_m: Option<f64>,
}

impl NodeConfig {
    pub fn from_args(args: &Args, file: &FileConfig) -> Self {
        Self {
            node_id: args.node_id.clone(),
            host: args.host.clone(),
            base_port: args.base_port,
            discovery_port: file.discovery_port.unwrap_or(DEFAULT_DISCOVERY_PORT),
            neighbors: parse_neighbors(&args.neighbors),
            discover: args.discover,
            calibration_path: args.calibration.clone(),
            cycle_time_ms: file.cycle_time_ms.unwrap_or(DEFAULT_CYCLE_TIME_MS),
            collection_timeout_ms: file
                .collection_timeout_ms
                .unwrap_or(DEFAULT_COLLECTION_TIMEOUT_MS),
            sync_timeout_secs: file.sync_timeout_secs.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS),
            sync_grace_secs: file.sync_grace_secs.unwrap_or(DEFAULT_SYNC_GRACE_SECS),
            sync_stale_secs: file.sync_stale_secs.unwrap_or(DEFAULT_SYNC_STALE_SECS),
            inactive_timeout_frames: file
                .inactive_timeout_frames
                .unwrap_or(DEFAULT_INACTIVE_TIMEOUT_FRAMES),
            cluster_eps_m: file.cluster_eps_m.unwrap_or(DEFAULT_CLUSTER_EPS_M),
        }
    }
}

/// Load a [`FileConfig`] from disk, falling back to all-defaults if the
/// path is absent or unparsable — configuration is never a fatal error.
pub fn load_file_config(path: Option<&str>) -> FileConfig {
    let Some(path) = path else { return FileConfig::default() };
    match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("invalid config at {path}: {e}, using defaults");
            FileConfig::default()
        }),
        Err(e) => {
            tracing::warn!("could not read config at {path}: {e}, using defaults");
            FileConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_neighbor_triples() {
        let n = parse_neighbors("A,10.0.0.1,5050;B,10.0.0.2,5051");
        assert_eq!(
            n,
            vec![
                NeighborSpec { node_id: "A".into(), host: "10.0.0.1".into(), port: 5050 },
                NeighborSpec { node_id: "B".into(), host: "10.0.0.2".into(), port: 5051 },
            ]
        );
    }

    #[test]
    fn ignores_blank_segments() {
        let n = parse_neighbors("A,10.0.0.1,5050;;  ;");
        assert_eq!(n.len(), 1);
    }

    #[test]
    fn defaults_fill_in_missing_file_config() {
        let cfg = NodeConfig::from_args(
            &Args {
                node_id: "A".into(),
                base_port: 5050,
                host: "0.0.0.0".into(),
                neighbors: String::new(),
                discover: false,
                calibration: None,
                config: None,
            },
            &FileConfig::default(),
        );
        assert_eq!(cfg.cycle_time_ms, DEFAULT_CYCLE_TIME_MS);
        assert_eq!(cfg.discovery_port, DEFAULT_DISCOVERY_PORT);
    }
}
