//! Peer snapshot persistence.
//!
//! On shutdown the daemon dumps every known remote peer to a JSON file so a
//! restarted node can rejoin without a full bootstrap. Re-imported entries
//! get a fresh expiration and age out normally if their peers are gone.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::{ContactRole, NodeDbEntry, NodeInfo, RelationType};
use crate::store::SpatialStore;
use crate::wire::WireNodeInfo;

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPeer {
    info: WireNodeInfo,
    relation: RelationType,
    role: ContactRole,
}

/// Serializable dump of the store's remote peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    peers: Vec<SnapshotPeer>,
}

impl PeerSnapshot {
    /// Capture every colleague/neighbour entry of the store.
    pub async fn capture(store: &SpatialStore) -> Self {
        let peers = store
            .related_nodes()
            .await
            .into_iter()
            .map(|entry| SnapshotPeer {
                info: WireNodeInfo::from(entry.info()),
                relation: entry.relation(),
                role: entry.role(),
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            peers,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }

    /// Store every snapshot peer that is not yet known. Entries that fail
    /// conversion (e.g. a peer saved with an address literal that no longer
    /// parses) are skipped rather than failing the whole import.
    pub async fn restore(&self, store: &SpatialStore) -> usize {
        let mut restored = 0;
        for peer in &self.peers {
            if peer.relation == RelationType::SelfNode {
                continue;
            }
            let info = match NodeInfo::try_from(&peer.info) {
                Ok(info) => info,
                Err(_) => continue,
            };
            let entry = NodeDbEntry::new(info, peer.relation, peer.role);
            if store.store(entry).await.is_ok() {
                restored += 1;
            }
        }
        restored
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("failed to serialize snapshot: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: PeerSnapshot = serde_json::from_str(json)
            .map_err(|e| Error::InvalidValue(format!("failed to parse snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Unsupported(format!(
                "snapshot version {} is not supported",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
