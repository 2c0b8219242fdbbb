//! Location and geofence lifecycle engine for Reminiscence.
//!
//! Turns raw platform callbacks (authorization changes, fixes, region
//! crossings, failures) into a small typed event stream, keeps the set of
//! monitored regions under the platform cap, and debounces "memory nearby"
//! notifications.
//!
//! No SQL, no filesystem: storage, the platform provider, the notification
//! presenter and the clock are traits supplied by the host.

pub mod activity;
pub mod actor;
pub mod authorization;
pub mod config;
pub mod constants;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod event;
pub mod geo;
pub mod platform;
pub mod policy;
pub mod region;
pub mod registry;
pub mod sim;
pub mod time;

pub use activity::ActivityMode;
pub use actor::{EngineHandle, spawn};
pub use authorization::{AuthorizationRequest, AuthorizationState};
pub use config::EngineConfig;
pub use constants::{DEFAULT_COOLDOWN_SECS, DEFAULT_RADIUS_METERS, DEFAULT_REGION_CAPACITY};
pub use debounce::NotificationDebouncer;
pub use engine::{
    Collaborators, EngineSnapshot, EngineState, InactiveReason, LocationEngine,
    LocationSnapshot, derive_state,
};
pub use error::{
    CollaboratorError, CommandError, ErrorKind, FailureClass, PlatformFailure, RegistryError,
};
pub use event::{EngineEvent, EventEmitter, LocationFix};
pub use geo::Coordinate;
pub use platform::{
    Clock, LocationProvider, Memory, NotificationPresenter, RegionMonitor, Storage,
    SystemClock, Visit,
};
pub use policy::{
    AccuracyClass, LocationUpdatePolicy, PolicyRow, PolicyTable, UpdateConfig,
    select_update_config,
};
pub use region::{MonitoredRegion, RegionRequest};
pub use registry::{EvictionPolicy, GeofenceRegistry, ReconcileReport, Removal, RemovalCause};
pub use time::{UnixMillis, now_unix_millis, unix_millis_to_iso8601};
