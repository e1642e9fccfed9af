//! Geodesic distance and the bubble admission model.
//!
//! Distances are great-circle kilometres from the Haversine formula on a
//! spherical Earth. Around every remote point the overlay draws a "bubble"
//! whose radius grows logarithmically with the point's distance from the
//! local node: nearby regions are mapped at fine resolution, far regions
//! coarsely. A colleague candidate is rejected when its bubble overlaps the
//! bubble of the closest already-known non-neighbour node.

use serde::{Deserialize, Serialize};

use crate::GpsLocation;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two locations in kilometres.
///
/// Haversine formula, see e.g. http://www.movable-type.co.uk/scripts/latlong.html
pub fn distance_km(one: GpsLocation, other: GpsLocation) -> f64 {
    let fi1 = one.latitude().to_radians();
    let fi2 = other.latitude().to_radians();
    let delta_fi = fi2 - fi1;
    let delta_lambda = (other.longitude() - one.longitude()).to_radians();

    let a = (delta_fi / 2.0).sin() * (delta_fi / 2.0).sin()
        + fi1.cos() * fi2.cos() * (delta_lambda / 2.0).sin() * (delta_lambda / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Tuning constants of the bubble-size function
/// `bubble(d) = scale · log10(d + base_km) − offset_km`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BubbleConfig {
    pub scale: f64,
    pub base_km: f64,
    pub offset_km: f64,
}

impl Default for BubbleConfig {
    fn default() -> Self {
        Self {
            scale: 500.0,
            base_km: 2500.0,
            offset_km: 1700.0,
        }
    }
}

impl BubbleConfig {
    /// Admission radius around a point at the given distance from the local
    /// node. Monotonically increasing in the distance, clamped at zero.
    pub fn bubble_size_km(&self, distance_from_local_km: f64) -> f64 {
        let bubble = self.scale * (distance_from_local_km + self.base_km).log10() - self.offset_km;
        bubble.max(0.0)
    }
}
