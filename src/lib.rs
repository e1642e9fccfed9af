//! locmesh: a node of a location-based peer-to-peer overlay network.
//!
//! Every node sits at a fixed GPS coordinate and maintains two overlapping
//! views of the network: a coarse, distance-gated world map of "colleague"
//! nodes and a fine-grained set of its nearest "neighbour" nodes. Co-hosted
//! services register with the local node and are advertised to clients in
//! the same geographic vicinity.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod geodesy;
pub mod logging;
pub mod node;
pub mod peer;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod wire;

pub use error::Error;

use serde::{Deserialize, Serialize};

/// A point on the Earth's surface given as latitude/longitude degrees.
///
/// Valid latitudes are in the half-open range (-90, 90] and longitudes in
/// (-180, 180]. Equality is bitwise on the two coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    latitude: f64,
    longitude: f64,
}

impl GpsLocation {
    /// Create a new location, validating the coordinate ranges.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, Error> {
        if !latitude.is_finite() || latitude <= -90.0 || latitude > 90.0 {
            return Err(Error::InvalidValue(format!(
                "latitude {} out of range (-90, 90]",
                latitude
            )));
        }
        if !longitude.is_finite() || longitude <= -180.0 || longitude > 180.0 {
            return Err(Error::InvalidValue(format!(
                "longitude {} out of range (-180, 180]",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl std::fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}
