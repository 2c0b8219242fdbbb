//! In-process stand-ins for the platform, storage, presenter and clock.
//!
//! Every double is a cheap `Clone` over shared state, so a test (or the CLI
//! replay driver) keeps one handle for inspection while the engine owns
//! another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;

use crate::authorization::{AuthorizationRequest, AuthorizationState};
use crate::config::EngineConfig;
use crate::engine::{Collaborators, LocationEngine};
use crate::error::CollaboratorError;
use crate::event::LocationFix;
use crate::geo::Coordinate;
use crate::platform::{
    Clock, LocationProvider, Memory, NotificationPresenter, RegionMonitor, Storage, Visit,
};
use crate::policy::UpdateConfig;
use crate::region::MonitoredRegion;
use crate::time::UnixMillis;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Platform ---

/// A call the engine made on the simulated provider.
#[derive(Clone, Debug, PartialEq)]
pub enum PlatformCall {
    RequestAuthorization(AuthorizationRequest),
    StartUpdating(UpdateConfig),
    Reconfigure(UpdateConfig),
    StopUpdating,
    StartMonitoring(String),
    StopMonitoring(String),
}

#[derive(Debug)]
struct PlatformState {
    authorization: AuthorizationState,
    monitoring_available: bool,
    monitored: BTreeMap<String, MonitoredRegion>,
    updating: Option<UpdateConfig>,
    calls: Vec<PlatformCall>,
}

#[derive(Clone, Debug)]
pub struct SimulatedPlatform {
    inner: Arc<Mutex<PlatformState>>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlatformState {
                authorization: AuthorizationState::NotDetermined,
                monitoring_available: true,
                monitored: BTreeMap::new(),
                updating: None,
                calls: Vec::new(),
            })),
        }
    }

    /// What `authorization_status` reports. Does not notify the engine;
    /// feed the change through `ingest_authorization_change`.
    pub fn set_authorization(&self, authorization: AuthorizationState) {
        lock(&self.inner).authorization = authorization;
    }

    pub fn set_monitoring_available(&self, available: bool) {
        lock(&self.inner).monitoring_available = available;
    }

    /// Seed a region the platform kept from an earlier launch. Not logged.
    pub fn preload_monitored(&self, region: MonitoredRegion) {
        lock(&self.inner).monitored.insert(region.id.clone(), region);
    }

    pub fn monitored_ids(&self) -> Vec<String> {
        lock(&self.inner).monitored.keys().cloned().collect()
    }

    pub fn updating(&self) -> Option<UpdateConfig> {
        lock(&self.inner).updating
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&PlatformCall) -> bool) -> usize {
        lock(&self.inner).calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner).calls.clear();
    }

    fn record(&self, call: PlatformCall) {
        tracing::trace!(?call, "platform call");
        lock(&self.inner).calls.push(call);
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionMonitor for SimulatedPlatform {
    fn start_monitoring(&mut self, region: &MonitoredRegion) {
        self.record(PlatformCall::StartMonitoring(region.id.clone()));
        lock(&self.inner)
            .monitored
            .insert(region.id.clone(), region.clone());
    }

    fn stop_monitoring(&mut self, region_id: &str) {
        self.record(PlatformCall::StopMonitoring(region_id.to_string()));
        lock(&self.inner).monitored.remove(region_id);
    }

    fn monitored_region_ids(&self) -> Vec<String> {
        self.monitored_ids()
    }
}

impl LocationProvider for SimulatedPlatform {
    fn authorization_status(&self) -> AuthorizationState {
        lock(&self.inner).authorization
    }

    fn is_monitoring_available(&self) -> bool {
        lock(&self.inner).monitoring_available
    }

    fn request_authorization(&mut self, request: AuthorizationRequest) {
        self.record(PlatformCall::RequestAuthorization(request));
    }

    fn start_updating(&mut self, config: &UpdateConfig) {
        self.record(PlatformCall::StartUpdating(*config));
        lock(&self.inner).updating = Some(*config);
    }

    fn reconfigure(&mut self, config: &UpdateConfig) {
        self.record(PlatformCall::Reconfigure(*config));
        lock(&self.inner).updating = Some(*config);
    }

    fn stop_updating(&mut self) {
        self.record(PlatformCall::StopUpdating);
        lock(&self.inner).updating = None;
    }
}

// --- Storage ---

#[derive(Debug, Default)]
struct StorageState {
    memories: HashMap<String, Memory>,
    visits: Vec<Visit>,
    regions: BTreeMap<String, MonitoredRegion>,
    failing: bool,
}

/// Storage kept in memory. `set_failing(true)` makes every call error.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_memory(&self, memory: Memory) {
        lock(&self.inner).memories.insert(memory.id.clone(), memory);
    }

    pub fn memory_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner).memories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn visits(&self) -> Vec<Visit> {
        lock(&self.inner).visits.clone()
    }

    pub fn regions(&self) -> Vec<MonitoredRegion> {
        lock(&self.inner).regions.values().cloned().collect()
    }

    /// Seed a persisted region without going through an engine.
    pub fn insert_region(&self, region: MonitoredRegion) {
        lock(&self.inner).regions.insert(region.id.clone(), region);
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.inner).failing = failing;
    }

    fn guard(&self) -> Result<MutexGuard<'_, StorageState>, CollaboratorError> {
        let state = lock(&self.inner);
        if state.failing {
            return Err(CollaboratorError::new("simulated storage failure"));
        }
        Ok(state)
    }
}

impl Storage for MemoryStorage {
    fn record_visit(
        &mut self,
        coordinate: Coordinate,
        timestamp: UnixMillis,
        memory_id: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        self.guard()?.visits.push(Visit {
            memory_id: memory_id.map(str::to_string),
            coordinate,
            timestamp,
        });
        Ok(())
    }

    fn find_memory_by_id(&self, id: &str) -> Result<Option<Memory>, CollaboratorError> {
        Ok(self.guard()?.memories.get(id).cloned())
    }

    fn delete_memory(&mut self, id: &str) -> Result<(), CollaboratorError> {
        let mut state = self.guard()?;
        state.memories.remove(id);
        state.visits.retain(|v| v.memory_id.as_deref() != Some(id));
        Ok(())
    }

    fn load_regions(&self) -> Result<Vec<MonitoredRegion>, CollaboratorError> {
        Ok(self.guard()?.regions.values().cloned().collect())
    }

    fn save_region(&mut self, region: &MonitoredRegion) -> Result<(), CollaboratorError> {
        self.guard()?
            .regions
            .insert(region.id.clone(), region.clone());
        Ok(())
    }

    fn remove_region(&mut self, id: &str) -> Result<(), CollaboratorError> {
        self.guard()?.regions.remove(id);
        Ok(())
    }
}

// --- Presenter ---

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

#[derive(Clone, Debug, Default)]
pub struct RecordingPresenter {
    inner: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.inner).clone()
    }
}

impl NotificationPresenter for RecordingPresenter {
    fn present(&mut self, title: &str, body: &str) {
        lock(&self.inner).push(Notification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

// --- Clock ---

#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: UnixMillis) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: UnixMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: UnixMillis) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(crate::time::secs_to_millis(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixMillis {
        self.now.load(Ordering::SeqCst)
    }
}

// --- Harness ---

/// 2026-01-01T00:00:00Z, so simulated timestamps read like real ones.
pub const SIM_EPOCH: UnixMillis = 1_767_225_600_000;

/// One of each double, wired together.
#[derive(Clone, Debug)]
pub struct Harness {
    pub platform: SimulatedPlatform,
    pub storage: MemoryStorage,
    pub presenter: RecordingPresenter,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            platform: SimulatedPlatform::new(),
            storage: MemoryStorage::new(),
            presenter: RecordingPresenter::new(),
            clock: ManualClock::new(SIM_EPOCH),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: Box::new(self.platform.clone()),
            storage: Box::new(self.storage.clone()),
            presenter: Box::new(self.presenter.clone()),
            clock: Arc::new(self.clock.clone()),
        }
    }

    /// A fresh, unstarted engine over this harness's doubles.
    pub fn engine(&self, config: EngineConfig) -> LocationEngine {
        LocationEngine::new(config, self.collaborators())
    }

    pub fn memory(&self, id: &str, coordinate: Coordinate) -> Memory {
        Memory {
            id: id.to_string(),
            title: id.to_string(),
            note: String::new(),
            coordinate,
            radius_meters: crate::constants::DEFAULT_RADIUS_METERS,
            created_at: self.clock.now(),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

// --- Paths ---

/// Fixes along a straight line from `from` to `to`, each displaced by up to
/// `jitter_meters` north and east. Returns `steps + 1` fixes spaced
/// `interval` apart starting at `start`.
pub fn jittered_path<R: Rng + ?Sized>(
    from: Coordinate,
    to: Coordinate,
    steps: usize,
    jitter_meters: f64,
    start: UnixMillis,
    interval: UnixMillis,
    rng: &mut R,
) -> Vec<LocationFix> {
    let jitter = if jitter_meters.is_finite() {
        jitter_meters.max(0.0)
    } else {
        0.0
    };
    let accuracy = jitter.max(5.0);

    (0..=steps)
        .map(|i| {
            let t = if steps == 0 {
                0.0
            } else {
                i as f64 / steps as f64
            };
            let base = from.lerp(&to, t);
            let (north, east) = if jitter > 0.0 {
                (
                    rng.random_range(-jitter..=jitter),
                    rng.random_range(-jitter..=jitter),
                )
            } else {
                (0.0, 0.0)
            };
            LocationFix::new(
                base.offset_meters(north, east),
                start + interval * i as u64,
                accuracy,
            )
        })
        .collect()
}
