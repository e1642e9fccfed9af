//! In-process spatial store of known peers.
//!
//! Holds every known [`NodeDbEntry`] keyed by node id, answers geodesic
//! queries against the local node's position, expires stale entries and
//! notifies registered change listeners after each committed mutation.
//! Writes are serialized behind a single lock; readers always observe a
//! consistent snapshot.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::geodesy::distance_km;
use crate::peer::{ContactRole, NodeDbEntry, NodeId, NodeInfo, RelationType};
use crate::GpsLocation;

/// Identifier of a live connection, formed as `"address:port"` of the
/// remote side.
pub type SessionId = String;

/// Whether neighbour entries participate in a spatial query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourFilter {
    Included,
    Excluded,
}

impl NeighbourFilter {
    pub fn from_include_flag(include_neighbours: bool) -> Self {
        if include_neighbours {
            NeighbourFilter::Included
        } else {
            NeighbourFilter::Excluded
        }
    }

    /// Spatial queries return remote peers only: the local node's own entry
    /// never appears in a candidate list.
    fn admits(self, entry: &NodeDbEntry) -> bool {
        match entry.relation() {
            RelationType::SelfNode => false,
            RelationType::Neighbour => self == NeighbourFilter::Included,
            RelationType::Colleague => true,
        }
    }
}

/// Observer of store mutations. One listener per session; the registry is
/// keyed by session id so re-registration is idempotent.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    fn session_id(&self) -> &str;

    async fn added(&self, entry: &NodeDbEntry);
    async fn updated(&self, entry: &NodeDbEntry);
    async fn removed(&self, entry: &NodeDbEntry);
}

/// Thread-safe set of change listeners, keyed by session id.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<SessionId, Arc<dyn ChangeListener>>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners
            .insert(listener.session_id().to_owned(), listener);
    }

    pub fn remove(&self, session_id: &str) {
        self.listeners.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners.iter().map(|e| Arc::clone(e.value())).collect()
    }

    async fn notify_added(&self, entry: &NodeDbEntry) {
        for listener in self.snapshot() {
            listener.added(entry).await;
        }
    }

    async fn notify_updated(&self, entry: &NodeDbEntry) {
        for listener in self.snapshot() {
            listener.updated(entry).await;
        }
    }

    async fn notify_removed(&self, entry: &NodeDbEntry) {
        for listener in self.snapshot() {
            listener.removed(entry).await;
        }
    }
}

struct StoredEntry {
    entry: NodeDbEntry,
    /// `None` means the entry never expires (the local node's own record).
    expires_at: Option<Instant>,
}

/// The store itself. Owned exclusively by the node engine; external
/// components reach peers only through engine methods.
pub struct SpatialStore {
    local_location: GpsLocation,
    entry_expiration: Duration,
    nodes: RwLock<HashMap<NodeId, StoredEntry>>,
    listeners: ListenerRegistry,
}

impl SpatialStore {
    /// Create a store seeded with the local node's own non-expiring entry.
    pub fn new(local_info: NodeInfo, entry_expiration: Duration) -> Self {
        let self_entry = NodeDbEntry::self_entry(local_info.clone());
        let mut nodes = HashMap::new();
        nodes.insert(
            self_entry.id().clone(),
            StoredEntry {
                entry: self_entry,
                expires_at: None,
            },
        );
        Self {
            local_location: local_info.location(),
            entry_expiration,
            nodes: RwLock::new(nodes),
            listeners: ListenerRegistry::default(),
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// The local node's own record.
    pub async fn this_node(&self) -> NodeDbEntry {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .find(|stored| stored.entry.relation() == RelationType::SelfNode)
            .map(|stored| stored.entry.clone())
            .expect("self entry exists from construction to teardown")
    }

    /// Insert a new entry. Fails when an entry with the same id is present.
    pub async fn store(&self, entry: NodeDbEntry) -> Result<()> {
        self.store_with_expiry(entry, true).await
    }

    pub async fn store_with_expiry(&self, entry: NodeDbEntry, expires: bool) -> Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(entry.id()) {
                return Err(Error::Conceptual(format!(
                    "node {} is already present",
                    entry.id()
                )));
            }
            nodes.insert(
                entry.id().clone(),
                StoredEntry {
                    entry: entry.clone(),
                    expires_at: expires.then(|| Instant::now() + self.entry_expiration),
                },
            );
        }
        self.listeners.notify_added(&entry).await;
        Ok(())
    }

    /// Replace an entry by id, refreshing its expiration. Relation and role
    /// may change through an update.
    pub async fn update(&self, entry: NodeDbEntry) -> Result<()> {
        self.update_with_expiry(entry, true).await
    }

    pub async fn update_with_expiry(&self, entry: NodeDbEntry, expires: bool) -> Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            let stored = nodes.get_mut(entry.id()).ok_or_else(|| {
                Error::Conceptual(format!("node {} is not known", entry.id()))
            })?;
            stored.entry = entry.clone();
            stored.expires_at = expires.then(|| Instant::now() + self.entry_expiration);
        }
        self.listeners.notify_updated(&entry).await;
        Ok(())
    }

    pub async fn load(&self, id: &NodeId) -> Option<NodeDbEntry> {
        let nodes = self.nodes.read().await;
        nodes.get(id).map(|stored| stored.entry.clone())
    }

    pub async fn remove(&self, id: &NodeId) -> Result<()> {
        let removed = {
            let mut nodes = self.nodes.write().await;
            nodes
                .remove(id)
                .ok_or_else(|| Error::Conceptual(format!("node {} is not known", id)))?
        };
        self.listeners.notify_removed(&removed.entry).await;
        Ok(())
    }

    /// Evict every entry whose deadline has passed. The self entry carries
    /// no deadline and is never evicted.
    pub async fn expire_old_nodes(&self) {
        let now = Instant::now();
        let expired: Vec<NodeDbEntry> = {
            let mut nodes = self.nodes.write().await;
            let stale: Vec<NodeId> = nodes
                .iter()
                .filter(|(_, stored)| matches!(stored.expires_at, Some(at) if at < now))
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| nodes.remove(id))
                .map(|stored| stored.entry)
                .collect()
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale node entries");
        }
        for entry in &expired {
            self.listeners.notify_removed(entry).await;
        }
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn node_count_by_relation(&self, relation: RelationType) -> usize {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|stored| stored.entry.relation() == relation)
            .count()
    }

    pub async fn nodes_by_relation(&self, relation: RelationType) -> Vec<NodeDbEntry> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|stored| stored.entry.relation() == relation)
            .map(|stored| stored.entry.clone())
            .collect()
    }

    pub async fn nodes_by_role(&self, role: ContactRole) -> Vec<NodeDbEntry> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|stored| stored.entry.role() == role)
            .map(|stored| stored.entry.clone())
            .collect()
    }

    /// All peers the engine keeps a relation with (colleagues + neighbours).
    pub async fn related_nodes(&self) -> Vec<NodeDbEntry> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|stored| {
                matches!(
                    stored.entry.relation(),
                    RelationType::Colleague | RelationType::Neighbour
                )
            })
            .map(|stored| stored.entry.clone())
            .collect()
    }

    /// Neighbour entries ordered by ascending distance from the local node.
    pub async fn neighbours_by_distance(&self) -> Vec<NodeDbEntry> {
        let mut neighbours: Vec<(f64, NodeDbEntry)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|stored| stored.entry.relation() == RelationType::Neighbour)
                .map(|stored| {
                    (
                        distance_km(self.local_location, stored.entry.location()),
                        stored.entry.clone(),
                    )
                })
                .collect()
        };
        sort_by_distance(&mut neighbours);
        neighbours.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Entries ordered by ascending distance from `location`, bounded by a
    /// radius and a count. Equal distances order by node id so the result
    /// is deterministic.
    pub async fn closest_nodes(
        &self,
        location: GpsLocation,
        max_radius_km: f64,
        max_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        let mut candidates: Vec<(f64, NodeDbEntry)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|stored| filter.admits(&stored.entry))
                .map(|stored| {
                    (
                        distance_km(location, stored.entry.location()),
                        stored.entry.clone(),
                    )
                })
                .filter(|(distance, _)| *distance <= max_radius_km)
                .collect()
        };
        sort_by_distance(&mut candidates);
        candidates.truncate(max_count);
        candidates.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Uniform sample without replacement.
    pub async fn random_nodes(&self, max_count: usize, filter: NeighbourFilter) -> Vec<NodeDbEntry> {
        let mut remaining: Vec<NodeDbEntry> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|stored| filter.admits(&stored.entry))
                .map(|stored| stored.entry.clone())
                .collect()
        };
        let mut rng = rand::thread_rng();
        let mut result = Vec::new();
        while !remaining.is_empty() && result.len() < max_count {
            let selected = rng.gen_range(0..remaining.len());
            result.push(remaining.swap_remove(selected));
        }
        result
    }
}

fn sort_by_distance(entries: &mut [(f64, NodeDbEntry)]) {
    entries.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id().cmp(b.1.id()))
    });
}
