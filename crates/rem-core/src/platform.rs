//! Narrow interfaces to everything the engine does not own: the platform
//! location provider, storage, the notification presenter and the clock.
//!
//! Provider calls are fire-and-forget. Their outcomes come back later through
//! the engine's `ingest_*` methods.

use serde::{Deserialize, Serialize};

use crate::authorization::{AuthorizationRequest, AuthorizationState};
use crate::error::CollaboratorError;
use crate::geo::Coordinate;
use crate::policy::UpdateConfig;
use crate::region::MonitoredRegion;
use crate::time::{UnixMillis, now_unix_millis};

/// The geofencing half of the platform provider.
pub trait RegionMonitor {
    fn start_monitoring(&mut self, region: &MonitoredRegion);
    fn stop_monitoring(&mut self, region_id: &str);
    /// Ids the platform reports as currently monitored.
    fn monitored_region_ids(&self) -> Vec<String>;
}

pub trait LocationProvider: RegionMonitor + Send {
    fn authorization_status(&self) -> AuthorizationState;
    fn is_monitoring_available(&self) -> bool;
    fn request_authorization(&mut self, request: AuthorizationRequest);
    fn start_updating(&mut self, config: &UpdateConfig);
    /// Adjust a running session in place (distance filter, background).
    fn reconfigure(&mut self, config: &UpdateConfig);
    fn stop_updating(&mut self);
}

/// A memory as seen by the engine: enough to word a notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub title: String,
    pub note: String,
    pub coordinate: Coordinate,
    pub radius_meters: f64,
    pub created_at: UnixMillis,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub memory_id: Option<String>,
    pub coordinate: Coordinate,
    pub timestamp: UnixMillis,
}

pub trait Storage: Send {
    fn record_visit(
        &mut self,
        coordinate: Coordinate,
        timestamp: UnixMillis,
        memory_id: Option<&str>,
    ) -> Result<(), CollaboratorError>;
    fn find_memory_by_id(&self, id: &str) -> Result<Option<Memory>, CollaboratorError>;
    fn delete_memory(&mut self, id: &str) -> Result<(), CollaboratorError>;

    // --- Registry persistence ---

    fn load_regions(&self) -> Result<Vec<MonitoredRegion>, CollaboratorError>;
    /// Insert or replace.
    fn save_region(&mut self, region: &MonitoredRegion) -> Result<(), CollaboratorError>;
    fn remove_region(&mut self, id: &str) -> Result<(), CollaboratorError>;
}

pub trait NotificationPresenter: Send {
    fn present(&mut self, title: &str, body: &str);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixMillis;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixMillis {
        now_unix_millis()
    }
}
