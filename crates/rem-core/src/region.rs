use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::geo::Coordinate;
use crate::time::UnixMillis;

/// A circular geofence around one memory. The region id is the memory id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitoredRegion {
    pub id: String,
    pub center: Coordinate,
    pub radius_meters: f64,
    pub created_at: UnixMillis,
    pub expires_at: Option<UnixMillis>,
    pub last_visited_at: Option<UnixMillis>,
}

impl MonitoredRegion {
    pub fn is_expired(&self, now: UnixMillis) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        self.center.distance_meters(point) <= self.radius_meters
    }

    /// Timestamp used by least-recently-visited eviction.
    pub fn last_activity(&self) -> UnixMillis {
        self.last_visited_at.unwrap_or(self.created_at)
    }
}

/// Caller-supplied part of a region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionRequest {
    pub id: String,
    pub center: Coordinate,
    pub radius_meters: f64,
}

impl RegionRequest {
    pub fn new(id: impl Into<String>, center: Coordinate, radius_meters: f64) -> Self {
        Self {
            id: id.into(),
            center,
            radius_meters,
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidRegion("empty id".to_string()));
        }
        if !self.center.is_valid() {
            return Err(RegistryError::InvalidRegion(format!(
                "invalid center {}",
                self.center
            )));
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(RegistryError::InvalidRegion(format!(
                "radius must be > 0, got {}",
                self.radius_meters
            )));
        }
        Ok(())
    }

    pub fn into_region(self, created_at: UnixMillis, expires_at: Option<UnixMillis>) -> MonitoredRegion {
        MonitoredRegion {
            id: self.id,
            center: self.center,
            radius_meters: self.radius_meters,
            created_at,
            expires_at,
            last_visited_at: None,
        }
    }
}
