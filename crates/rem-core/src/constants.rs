/// Mean Earth radius in meters (IUGG), used for haversine distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Platform cap on simultaneously monitored regions.
pub const DEFAULT_REGION_CAPACITY: usize = 20;

/// Cool-down before the same region may notify again (5 minutes).
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// Radius used when a memory is saved without an explicit one.
pub const DEFAULT_RADIUS_METERS: f64 = 100.0;

/// How often the engine actor sweeps expired regions.
pub const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 60;

/// Coordinate served while no real fix is available (San Francisco).
pub const FALLBACK_LATITUDE: f64 = 37.7749;
pub const FALLBACK_LONGITUDE: f64 = -122.4194;

/// Horizontal accuracy reported alongside the fallback coordinate.
pub const FALLBACK_ACCURACY_METERS: f64 = 50_000.0;

/// Broadcast capacity of the engine event stream.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
