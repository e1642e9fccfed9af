//! Engine behaviour tests over an in-process connector registry.
//!
//! Instead of sockets, every engine is registered under its endpoint in a
//! shared registry; connecting returns a handle that calls the target
//! engine directly. This exercises bootstrap, admission and renewal logic
//! end to end without any networking.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use locmesh::error::{Error, Result};
use locmesh::geodesy::BubbleConfig;
use locmesh::node::{EngineSettings, Node, NodeConnector, RemoteNode};
use locmesh::peer::{
    ContactRole, NetworkEndpoint, NodeDbEntry, NodeId, NodeInfo, NodeProfile, RelationType,
};
use locmesh::store::{NeighbourFilter, SpatialStore};
use locmesh::GpsLocation;

/// Adapter exposing an in-process engine through the remote-node interface.
struct LocalNodeHandle(Arc<Node>);

#[async_trait]
impl RemoteNode for LocalNodeHandle {
    async fn get_node_count(&self) -> Result<usize> {
        Ok(self.0.get_node_count().await)
    }

    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        Ok(self.0.get_random_nodes(max_node_count, filter).await)
    }

    async fn get_closest_nodes(
        &self,
        location: GpsLocation,
        max_radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        Ok(self
            .0
            .get_closest_nodes(location, max_radius_km, max_node_count, filter)
            .await)
    }

    async fn accept_colleague(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        Ok(self.0.accept_colleague(requestor).await)
    }

    async fn renew_colleague(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        Ok(self.0.renew_colleague(requestor).await)
    }

    async fn accept_neighbour(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        Ok(self.0.accept_neighbour(requestor).await)
    }

    async fn renew_neighbour(&self, requestor: NodeInfo) -> Result<Option<NodeInfo>> {
        Ok(self.0.renew_neighbour(requestor).await)
    }
}

/// Shared endpoint-to-engine map standing in for the network.
#[derive(Default)]
struct NodeRegistry {
    nodes: RwLock<HashMap<NetworkEndpoint, Arc<Node>>>,
}

impl NodeRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, node: &Arc<Node>, endpoint: NetworkEndpoint) {
        self.nodes
            .write()
            .unwrap()
            .insert(endpoint, Arc::clone(node));
    }

    fn unregister(&self, endpoint: &NetworkEndpoint) {
        self.nodes.write().unwrap().remove(endpoint);
    }
}

#[async_trait]
impl NodeConnector for NodeRegistry {
    async fn connect(&self, endpoint: &NetworkEndpoint) -> Result<Arc<dyn RemoteNode>> {
        let node = self.nodes.read().unwrap().get(endpoint).cloned();
        node.map(|node| Arc::new(LocalNodeHandle(node)) as Arc<dyn RemoteNode>)
            .ok_or_else(|| Error::Connection(format!("nothing listens on {}", endpoint)))
    }
}

fn info(id: &str, port: u16, latitude: f64, longitude: f64) -> NodeInfo {
    NodeInfo::new(
        NodeProfile::new(
            NodeId::new(id),
            NetworkEndpoint::new("127.0.0.1", port).unwrap(),
        ),
        GpsLocation::new(latitude, longitude).unwrap(),
    )
}

fn spawn_engine(
    registry: &Arc<NodeRegistry>,
    own: NodeInfo,
    seeds: Vec<NetworkEndpoint>,
    neighbourhood_target_size: usize,
) -> Arc<Node> {
    let store = Arc::new(SpatialStore::new(own.clone(), Duration::from_secs(3600)));
    let node = Node::new(
        own.clone(),
        store,
        Arc::clone(registry) as Arc<dyn NodeConnector>,
        seeds,
        EngineSettings {
            neighbourhood_target_size,
            bubble: BubbleConfig::default(),
        },
    );
    registry.register(&node, own.endpoint().clone());
    node
}

fn budapest() -> NodeInfo {
    info("BudapestId", 6371, 47.497912, 19.040235)
}

fn kecskemet() -> NodeInfo {
    info("KecskemetId", 6372, 46.8963711, 19.6896861)
}

fn wien() -> NodeInfo {
    info("WienId", 6373, 48.2081743, 16.3738189)
}

fn london() -> NodeInfo {
    info("LondonId", 6374, 51.5073509, -0.1277583)
}

fn new_york() -> NodeInfo {
    info("NewYorkId", 6375, 40.741895, -73.989308)
}

fn cape_town() -> NodeInfo {
    info("CapeTownId", 6376, -33.9248685, 18.4240553)
}

/// Bootstrap through a live seed: the joining node fills its world map from
/// the seed's random nodes and then walks to its neighbourhood.
#[tokio::test]
async fn test_bootstrap_through_seed() {
    let registry = NodeRegistry::new();

    // The seed (Budapest) already knows the world.
    let seed = spawn_engine(&registry, budapest(), vec![], 100);
    for entry in [
        NodeDbEntry::new(kecskemet(), RelationType::Neighbour, ContactRole::Initiator),
        NodeDbEntry::new(london(), RelationType::Colleague, ContactRole::Initiator),
        NodeDbEntry::new(new_york(), RelationType::Colleague, ContactRole::Acceptor),
        NodeDbEntry::new(cape_town(), RelationType::Colleague, ContactRole::Acceptor),
    ] {
        seed.store().store(entry).await.unwrap();
    }

    // Everyone the seed knows is alive too.
    spawn_engine(&registry, kecskemet(), vec![], 100);
    spawn_engine(&registry, london(), vec![], 100);
    spawn_engine(&registry, new_york(), vec![], 100);
    spawn_engine(&registry, cape_town(), vec![], 100);

    // A fresh node in Wien joins through the seed. The neighbourhood
    // target is kept small so the walk stops once the closest peers are
    // in; otherwise every node of this tiny world would qualify.
    let joiner = spawn_engine(&registry, wien(), vec![budapest().endpoint().clone()], 2);
    joiner.init().await.unwrap();

    // The seed itself was taken as a neighbour, and the neighbourhood walk
    // found Kecskemét through it.
    let neighbours = joiner.get_neighbour_nodes_by_distance().await;
    let neighbour_ids: Vec<&str> = neighbours.iter().map(|n| n.id().as_str()).collect();
    assert_eq!(neighbour_ids.len(), 2);
    assert!(neighbour_ids.contains(&"BudapestId"));
    assert!(neighbour_ids.contains(&"KecskemetId"));

    // The faraway peers became colleagues.
    let colleagues = joiner
        .store()
        .nodes_by_relation(RelationType::Colleague)
        .await;
    let mut colleague_ids: Vec<&str> = colleagues.iter().map(|n| n.id().as_str()).collect();
    colleague_ids.sort_unstable();
    assert_eq!(colleague_ids, ["CapeTownId", "LondonId", "NewYorkId"]);

    // And the seed learned about the joiner in return.
    assert!(seed.store().load(&NodeId::new("WienId")).await.is_some());
}

/// A node whose seed list contains only itself is the first node of a
/// fresh network: bootstrap succeeds without any connection attempt.
#[tokio::test]
async fn test_first_seed_node_bootstraps_alone() {
    let registry = NodeRegistry::new();
    let own = budapest();
    let node = spawn_engine(&registry, own.clone(), vec![own.endpoint().clone()], 100);

    node.init().await.unwrap();
    assert_eq!(node.get_node_count().await, 1);
}

/// With unreachable seeds and no self-seed excuse, bootstrap fails.
#[tokio::test]
async fn test_bootstrap_fails_when_all_seeds_dead() {
    let registry = NodeRegistry::new();
    let dead_seed = NetworkEndpoint::new("127.0.0.1", 9999).unwrap();
    let node = spawn_engine(&registry, budapest(), vec![dead_seed], 100);

    assert!(node.init().await.is_err());
}

/// The neighbour set never exceeds its cap, whatever is thrown at it.
#[tokio::test]
async fn test_neighbour_cap_holds_under_pressure() {
    let registry = NodeRegistry::new();
    let node = spawn_engine(&registry, info("SelfId", 7000, 0.0, 0.0), vec![], 5);

    for i in 0..20 {
        let candidate = info(
            &format!("Candidate{:02}Id", i),
            7100 + i as u16,
            (i as f64) * 0.7 - 7.0,
            1.0,
        );
        node.accept_neighbour(candidate).await;
        let count = node
            .store()
            .node_count_by_relation(RelationType::Neighbour)
            .await;
        assert!(count <= 5, "neighbour cap exceeded: {}", count);
    }
    assert_eq!(
        node.store()
            .node_count_by_relation(RelationType::Neighbour)
            .await,
        5
    );
}

/// Relations renew while the peer answers and are dropped after repeated
/// failures once it disappears.
#[tokio::test]
async fn test_renewal_and_drop_of_dead_peer() {
    let registry = NodeRegistry::new();
    let node_a = spawn_engine(&registry, budapest(), vec![], 100);
    let node_b = spawn_engine(&registry, london(), vec![], 100);

    // Mutual colleague relation, initiated by A.
    let entry = NodeDbEntry::new(london(), RelationType::Colleague, ContactRole::Initiator);
    assert!(node_a.safe_store_node(entry, None).await.accepted());
    assert!(node_b.store().load(&NodeId::new("BudapestId")).await.is_some());

    // While B lives, renewal keeps the relation.
    node_a.renew_node_relations().await;
    assert!(node_a.store().load(&NodeId::new("LondonId")).await.is_some());

    // B vanishes; after enough failed rounds A forgets it.
    registry.unregister(london().endpoint());
    for _ in 0..3 {
        node_a.renew_node_relations().await;
    }
    assert!(node_a.store().load(&NodeId::new("LondonId")).await.is_none());
}

/// A peer that moved is denied renewal instead of silently keeping its
/// stale coordinates. (Re-running admission with the new position is a
/// deliberately open design question.)
#[tokio::test]
async fn test_renew_is_denied_when_location_moved() {
    let registry = NodeRegistry::new();
    let node = spawn_engine(&registry, budapest(), vec![], 100);

    assert!(node.accept_colleague(london()).await.is_some());

    let moved = info("LondonId", 6374, 52.0, -0.1277583);
    assert!(node.renew_colleague(moved).await.is_none());

    // The stored entry keeps the original coordinates.
    let stored = node.store().load(&NodeId::new("LondonId")).await.unwrap();
    assert_eq!(stored.location(), london().location());
}

/// Periodic discovery probes random peers and admits nearby strangers.
#[tokio::test]
async fn test_discover_unknown_areas_finds_nearby_nodes() {
    let registry = NodeRegistry::new();
    let node_a = spawn_engine(&registry, budapest(), vec![], 100);
    let node_b = spawn_engine(&registry, london(), vec![], 100);
    spawn_engine(&registry, kecskemet(), vec![], 100);

    // A knows B; B knows Kecskemét, which sits right next to A.
    node_a
        .store()
        .store(NodeDbEntry::new(
            london(),
            RelationType::Colleague,
            ContactRole::Initiator,
        ))
        .await
        .unwrap();
    node_b
        .store()
        .store(NodeDbEntry::new(
            kecskemet(),
            RelationType::Colleague,
            ContactRole::Acceptor,
        ))
        .await
        .unwrap();

    node_a.discover_unknown_areas().await;

    let found = node_a.store().load(&NodeId::new("KecskemetId")).await;
    assert!(matches!(
        found.map(|entry| entry.relation()),
        Some(RelationType::Neighbour)
    ));
}
