//! Node configuration.
//!
//! A [`NodeConfig`] covers everything the engine consumes: the node's own
//! identity and position, the listen endpoint, seed peers, and the tuning
//! knobs for timeouts, maintenance periods and the bubble model. Loaded
//! from a TOML file; every field has a default so a minimal config only
//! needs the coordinates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geodesy::BubbleConfig;
use crate::peer::{NetworkEndpoint, NodeId, NodeInfo, NodeProfile};
use crate::GpsLocation;

fn default_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    6371
}

fn default_neighbourhood_target_size() -> usize {
    100
}

fn default_request_expiration_secs() -> u64 {
    10
}

fn default_db_expiration_secs() -> u64 {
    24 * 3600
}

fn default_db_maintenance_secs() -> u64 {
    7 * 3600
}

fn default_discovery_period_secs() -> u64 {
    5 * 60
}

fn default_renewal_period_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// SHA-256 hex identity. Derived from the listen endpoint when empty.
    #[serde(default)]
    pub node_id: String,

    /// Externally reachable address literal of this node.
    #[serde(default = "default_address")]
    pub address: String,

    /// TCP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    pub latitude: f64,
    pub longitude: f64,

    /// Bootstrap endpoints as `"address:port"` literals.
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_neighbourhood_target_size")]
    pub neighbourhood_target_size: usize,

    #[serde(default = "default_request_expiration_secs")]
    pub request_expiration_secs: u64,

    #[serde(default = "default_db_expiration_secs")]
    pub db_expiration_secs: u64,

    #[serde(default = "default_db_maintenance_secs")]
    pub db_maintenance_secs: u64,

    #[serde(default = "default_discovery_period_secs")]
    pub discovery_period_secs: u64,

    #[serde(default = "default_renewal_period_secs")]
    pub renewal_period_secs: u64,

    /// Where the peer snapshot is saved on shutdown.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Log file location; stderr only when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Test mode widens the request expiration to 60 s.
    #[serde(default)]
    pub test_mode: bool,

    #[serde(default)]
    pub bubble: BubbleConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::InvalidValue(format!("bad config: {}", e)))
    }

    /// The local node's identity, contact and position.
    pub fn node_info(&self) -> Result<NodeInfo> {
        let endpoint = NetworkEndpoint::new(self.address.clone(), self.port)?;
        let id = if self.node_id.is_empty() {
            NodeId::from_key_material(format!("{}:{}", self.address, self.port).as_bytes())
        } else {
            NodeId::new(self.node_id.clone())
        };
        let location = GpsLocation::new(self.latitude, self.longitude)?;
        Ok(NodeInfo::new(NodeProfile::new(id, endpoint), location))
    }

    pub fn seed_endpoints(&self) -> Result<Vec<NetworkEndpoint>> {
        self.seed_nodes
            .iter()
            .map(|literal| parse_endpoint(literal))
            .collect()
    }

    pub fn request_expiration(&self) -> Duration {
        if self.test_mode {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(self.request_expiration_secs)
        }
    }

    pub fn db_expiration(&self) -> Duration {
        Duration::from_secs(self.db_expiration_secs)
    }

    pub fn db_maintenance_period(&self) -> Duration {
        Duration::from_secs(self.db_maintenance_secs)
    }

    pub fn discovery_period(&self) -> Duration {
        Duration::from_secs(self.discovery_period_secs)
    }

    pub fn renewal_period(&self) -> Duration {
        Duration::from_secs(self.renewal_period_secs)
    }
}

/// Parse an `"address:port"` literal; IPv6 addresses use `"[addr]:port"`.
pub fn parse_endpoint(literal: &str) -> Result<NetworkEndpoint> {
    let (address, port) = literal
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidValue(format!("missing port in endpoint: {}", literal)))?;
    let address = address.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidValue(format!("bad port in endpoint: {}", literal)))?;
    NetworkEndpoint::new(address, port)
}
