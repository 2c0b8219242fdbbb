use serde::{Deserialize, Serialize};

use crate::constants::EARTH_RADIUS_METERS;

/// A WGS-84 position in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite, latitude in [-90, 90], longitude in [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let d_phi = (other.latitude - self.latitude).to_radians();
        let d_lambda = (other.longitude - self.longitude).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        // Clamp guards against a > 1 from rounding on antipodal points
        let c = 2.0 * a.sqrt().min(1.0).asin();
        EARTH_RADIUS_METERS * c
    }

    /// Move `north_m` meters north and `east_m` meters east.
    /// Flat-earth approximation, fine for the short hops used in simulation.
    pub fn offset_meters(&self, north_m: f64, east_m: f64) -> Coordinate {
        let d_lat = (north_m / EARTH_RADIUS_METERS).to_degrees();
        let cos_lat = self.latitude.to_radians().cos().max(1e-9);
        let d_lon = (east_m / (EARTH_RADIUS_METERS * cos_lat)).to_degrees();
        Coordinate::new(self.latitude + d_lat, self.longitude + d_lon)
    }

    /// Linear interpolation between two coordinates, `t` in [0, 1].
    pub fn lerp(&self, other: &Coordinate, t: f64) -> Coordinate {
        Coordinate::new(
            self.latitude + (other.latitude - self.latitude) * t,
            self.longitude + (other.longitude - self.longitude) * t,
        )
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}
