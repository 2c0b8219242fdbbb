use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COOLDOWN_SECS, DEFAULT_EXPIRY_SWEEP_SECS, DEFAULT_RADIUS_METERS,
    DEFAULT_REGION_CAPACITY, FALLBACK_LATITUDE, FALLBACK_LONGITUDE,
};
use crate::geo::Coordinate;
use crate::policy::PolicyTable;
use crate::registry::EvictionPolicy;

/// Engine tunables. Every field has a default, so a partial TOML file works.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Simultaneously monitored regions the platform allows.
    pub region_capacity: usize,
    pub eviction: EvictionPolicy,
    pub cooldown_secs: u64,
    /// Suppress fixes closer than this to the last forwarded one.
    /// `None` forwards everything and leaves filtering to the provider.
    pub min_distance_meters: Option<f64>,
    pub battery_optimization: bool,
    /// Served with `has_real_fix = false` while no fix is known.
    pub fallback: Coordinate,
    pub notifications_enabled: bool,
    /// Period of the actor's expiry sweep; 0 disables it.
    pub expiry_sweep_secs: u64,
    pub default_radius_meters: f64,
    pub policy: PolicyTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_capacity: DEFAULT_REGION_CAPACITY,
            eviction: EvictionPolicy::default(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            min_distance_meters: None,
            battery_optimization: false,
            fallback: Coordinate::new(FALLBACK_LATITUDE, FALLBACK_LONGITUDE),
            notifications_enabled: true,
            expiry_sweep_secs: DEFAULT_EXPIRY_SWEEP_SECS,
            default_radius_meters: DEFAULT_RADIUS_METERS,
            policy: PolicyTable::default(),
        }
    }
}
