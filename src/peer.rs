//! Identity and peer data model.
//!
//! Profiles couple an opaque node id with a reachable TCP endpoint; adding
//! a GPS location yields the full `NodeInfo` that travels on the wire and
//! is stored in the spatial store.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::GpsLocation;

/// Opaque node identifier, intended to be a SHA-256 hex of a public key.
/// The overlay never interprets the content beyond requiring it non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id as the SHA-256 hex digest of arbitrary key material.
    pub fn from_key_material(material: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(material);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address family of an endpoint, derivable from the address literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A reachable TCP contact: textual IPv4/IPv6 literal plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    address: String,
    port: u16,
}

impl NetworkEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self, Error> {
        let address = address.into();
        if port == 0 {
            return Err(Error::InvalidValue("port must be in [1, 65535]".into()));
        }
        address
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidValue(format!("not an IP address literal: {}", address)))?;
        Ok(Self { address, port })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => AddressFamily::V6,
            _ => AddressFamily::V4,
        }
    }

    /// Replace the address literal, keeping the port. Used when a peer's
    /// externally visible address is observed on an accepted connection.
    pub fn with_address(&self, address: impl Into<String>) -> Result<Self, Error> {
        Self::new(address, self.port)
    }
}

impl std::fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Identity and contact of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    id: NodeId,
    endpoint: NetworkEndpoint,
}

impl NodeProfile {
    pub fn new(id: NodeId, endpoint: NetworkEndpoint) -> Self {
        Self { id, endpoint }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn endpoint(&self) -> &NetworkEndpoint {
        &self.endpoint
    }
}

/// A local service advertises the same identity/contact shape as a node.
pub type ServiceProfile = NodeProfile;

/// Profile plus geographic point: everything the overlay knows of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    profile: NodeProfile,
    location: GpsLocation,
}

impl NodeInfo {
    pub fn new(profile: NodeProfile, location: GpsLocation) -> Self {
        Self { profile, location }
    }

    pub fn profile(&self) -> &NodeProfile {
        &self.profile
    }

    pub fn id(&self) -> &NodeId {
        self.profile.id()
    }

    pub fn endpoint(&self) -> &NetworkEndpoint {
        self.profile.endpoint()
    }

    pub fn location(&self) -> GpsLocation {
        self.location
    }

    /// Copy of this info with the endpoint address replaced by an observed one.
    pub fn with_observed_address(&self, address: &str) -> Result<Self, Error> {
        let endpoint = self.profile.endpoint().with_address(address)?;
        Ok(Self {
            profile: NodeProfile::new(self.profile.id().clone(), endpoint),
            location: self.location,
        })
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} {}",
            self.profile.id(),
            self.profile.endpoint(),
            self.location
        )
    }
}

/// Kinds of services that may register with the local node, one each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Unstructured,
    Content,
    Latency,
    Location,
    Token,
    Profile,
    Proximity,
    Relay,
    Reputation,
    Minting,
}

/// How a stored peer relates to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    /// The local node's own record.
    SelfNode,
    /// Coarse world-map peer, admission gated by bubble overlap.
    Colleague,
    /// Fine neighbourhood peer, admission gated by a count cap.
    Neighbour,
}

/// Which side asked to establish the relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactRole {
    Initiator,
    Acceptor,
}

/// A spatial-store record: peer info plus its relation to the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDbEntry {
    info: NodeInfo,
    relation: RelationType,
    role: ContactRole,
}

impl NodeDbEntry {
    pub fn new(info: NodeInfo, relation: RelationType, role: ContactRole) -> Self {
        Self {
            info,
            relation,
            role,
        }
    }

    /// The entry representing the local node itself.
    pub fn self_entry(info: NodeInfo) -> Self {
        Self::new(info, RelationType::SelfNode, ContactRole::Acceptor)
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &NodeId {
        self.info.id()
    }

    pub fn location(&self) -> GpsLocation {
        self.info.location()
    }

    pub fn relation(&self) -> RelationType {
        self.relation
    }

    pub fn role(&self) -> ContactRole {
        self.role
    }
}
