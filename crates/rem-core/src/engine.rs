//! The location engine: a state machine fed by tagged platform callbacks.
//!
//! Every mutation goes through `&mut self`, so the engine itself has no
//! locking; `actor::spawn` puts it behind a single queue when callbacks come
//! from several threads.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::activity::ActivityMode;
use crate::authorization::{AuthorizationRequest, AuthorizationState};
use crate::config::EngineConfig;
use crate::constants::FALLBACK_ACCURACY_METERS;
use crate::debounce::NotificationDebouncer;
use crate::error::{ErrorKind, FailureClass, PlatformFailure, RegistryError};
use crate::event::{EngineEvent, EventEmitter, LocationFix};
use crate::platform::{Clock, LocationProvider, Memory, NotificationPresenter, Storage};
use crate::policy::{LocationUpdatePolicy, UpdateConfig};
use crate::region::RegionRequest;
use crate::registry::{GeofenceRegistry, RemovalCause};
use crate::time::UnixMillis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Denied,
    Restricted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    AwaitingAuthorization,
    Inactive(InactiveReason),
    Active(ActivityMode),
}

impl EngineState {
    pub fn is_active(self) -> bool {
        matches!(self, EngineState::Active(_))
    }

    pub fn is_inactive(self) -> bool {
        matches!(self, EngineState::Inactive(_))
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "uninitialized"),
            EngineState::AwaitingAuthorization => write!(f, "awaiting_authorization"),
            EngineState::Inactive(InactiveReason::Denied) => write!(f, "inactive(denied)"),
            EngineState::Inactive(InactiveReason::Restricted) => write!(f, "inactive(restricted)"),
            EngineState::Active(mode) => write!(f, "active({mode})"),
        }
    }
}

/// State a started engine settles in for a given authorization.
pub fn derive_state(authorization: AuthorizationState, activity: ActivityMode) -> EngineState {
    match authorization {
        AuthorizationState::NotDetermined => EngineState::AwaitingAuthorization,
        AuthorizationState::Denied => EngineState::Inactive(InactiveReason::Denied),
        AuthorizationState::Restricted => EngineState::Inactive(InactiveReason::Restricted),
        AuthorizationState::AuthorizedLimited | AuthorizationState::AuthorizedFull => {
            EngineState::Active(activity)
        }
    }
}

/// Best available position. `has_real_fix` is false when `fix` is the
/// configured fallback rather than something the platform reported.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LocationSnapshot {
    pub fix: LocationFix,
    pub has_real_fix: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub authorization: AuthorizationState,
    pub authorization_pending: bool,
    pub activity: ActivityMode,
    pub battery_optimization: bool,
    pub monitoring_available: bool,
    pub running: Option<UpdateConfig>,
    pub location: LocationSnapshot,
    pub region_ids: Vec<String>,
    pub transient_failures: u64,
}

/// Everything the engine talks to but does not own.
pub struct Collaborators {
    pub provider: Box<dyn LocationProvider>,
    pub storage: Box<dyn Storage>,
    pub presenter: Box<dyn NotificationPresenter>,
    pub clock: Arc<dyn Clock>,
}

pub struct LocationEngine {
    config: EngineConfig,
    policy: LocationUpdatePolicy,
    registry: GeofenceRegistry,
    debouncer: NotificationDebouncer,
    provider: Box<dyn LocationProvider>,
    storage: Box<dyn Storage>,
    presenter: Box<dyn NotificationPresenter>,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,

    state: EngineState,
    authorization: AuthorizationState,
    pending_request: Option<AuthorizationRequest>,
    activity: ActivityMode,
    battery_optimization: bool,
    /// Config the provider is currently updating with; `None` when stopped.
    running: Option<UpdateConfig>,
    last_fix: Option<LocationFix>,
    last_forwarded: Option<LocationFix>,
    monitoring_available: bool,
    transient_failures: u64,
}

impl LocationEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            provider,
            storage,
            presenter,
            clock,
        } = collaborators;

        Self {
            policy: LocationUpdatePolicy::new(config.policy.clone()),
            registry: GeofenceRegistry::new(config.region_capacity, config.eviction),
            debouncer: NotificationDebouncer::from_secs(config.cooldown_secs),
            battery_optimization: config.battery_optimization,
            config,
            provider,
            storage,
            presenter,
            clock,
            emitter: EventEmitter::new(),
            state: EngineState::Uninitialized,
            authorization: AuthorizationState::NotDetermined,
            pending_request: None,
            activity: ActivityMode::Default,
            running: None,
            last_fix: None,
            last_forwarded: None,
            monitoring_available: true,
            transient_failures: 0,
        }
    }

    // --- Accessors ---

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn authorization(&self) -> AuthorizationState {
        self.authorization
    }

    pub fn activity(&self) -> ActivityMode {
        self.activity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &GeofenceRegistry {
        &self.registry
    }

    pub fn monitoring_available(&self) -> bool {
        self.monitoring_available
    }

    pub fn running_config(&self) -> Option<UpdateConfig> {
        self.running
    }

    pub fn last_fix(&self) -> Option<LocationFix> {
        self.last_fix
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.emitter.subscribe()
    }

    pub fn current_location(&self) -> LocationSnapshot {
        match self.last_fix {
            Some(fix) => LocationSnapshot {
                fix,
                has_real_fix: true,
            },
            None => LocationSnapshot {
                fix: LocationFix::new(
                    self.config.fallback,
                    self.clock.now(),
                    FALLBACK_ACCURACY_METERS,
                ),
                has_real_fix: false,
            },
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            authorization: self.authorization,
            authorization_pending: self.pending_request.is_some(),
            activity: self.activity,
            battery_optimization: self.battery_optimization,
            monitoring_available: self.monitoring_available,
            running: self.running,
            location: self.current_location(),
            region_ids: self.registry.ids(),
            transient_failures: self.transient_failures,
        }
    }

    // --- Lifecycle ---

    /// Restore and reconcile regions, then settle on the provider's current
    /// authorization.
    pub fn start(&mut self) {
        if self.state != EngineState::Uninitialized {
            tracing::debug!("start ignored: engine already {}", self.state);
            return;
        }

        self.monitoring_available = self.provider.is_monitoring_available();
        if !self.monitoring_available {
            self.report(
                ErrorKind::MonitoringUnavailable,
                "platform cannot monitor regions; geofencing disabled".to_string(),
            );
        }

        // Persisted rows stay in storage for a launch that can monitor them.
        if self.monitoring_available {
            match self.storage.load_regions() {
                Ok(regions) => {
                    let restored = self.registry.restore(regions);
                    tracing::info!("restored {restored} persisted regions");
                }
                Err(e) => self.report(
                    ErrorKind::StorageFailure,
                    format!("failed to load regions: {e}"),
                ),
            }
        }

        let now = self.clock.now();
        self.registry.expire_older_than(now, self.provider.as_mut());
        if self.monitoring_available {
            self.registry.reconcile(self.provider.as_mut());
        }
        self.drain_removals();

        self.set_state(EngineState::AwaitingAuthorization);
        let status = self.provider.authorization_status();
        self.ingest_authorization_change(status);
    }

    /// Stop location updates and return to `Uninitialized`. Regions stay
    /// registered with the platform and in storage.
    pub fn stop(&mut self) {
        if self.state == EngineState::Uninitialized {
            return;
        }
        self.stop_updates();
        self.set_state(EngineState::Uninitialized);
    }

    // --- Authorization ---

    /// Ask for while-in-use access. No-op once determined or while a request
    /// is pending.
    pub fn request_authorization(&mut self) {
        if self.authorization.is_determined() {
            tracing::debug!("authorization already {}; not requesting", self.authorization);
            return;
        }
        if self.pending_request.is_some() {
            tracing::debug!("authorization request already pending");
            return;
        }
        self.pending_request = Some(AuthorizationRequest::WhenInUse);
        self.provider
            .request_authorization(AuthorizationRequest::WhenInUse);
    }

    /// Ask for always access (needed for background updates).
    pub fn request_background_authorization(&mut self) {
        match self.authorization {
            AuthorizationState::NotDetermined | AuthorizationState::AuthorizedLimited => {
                if self.pending_request == Some(AuthorizationRequest::Always) {
                    tracing::debug!("background authorization request already pending");
                    return;
                }
                self.pending_request = Some(AuthorizationRequest::Always);
                self.provider.request_authorization(AuthorizationRequest::Always);
            }
            other => tracing::debug!("background authorization not requestable from {other}"),
        }
    }

    pub fn ingest_authorization_change(&mut self, status: AuthorizationState) {
        // A stale not_determined keeps the current value but still drives the
        // state out of AwaitingAuthorization.
        let status = if status == AuthorizationState::NotDetermined
            && self.authorization.is_determined()
        {
            tracing::debug!(
                "ignoring stale not_determined report (current: {})",
                self.authorization
            );
            self.authorization
        } else {
            status
        };

        let changed = status != self.authorization;
        self.authorization = status;
        if changed {
            self.pending_request = None;
        }

        if self.state == EngineState::Uninitialized {
            tracing::debug!("authorization {status} recorded before start");
            return;
        }

        let previous = self.state;
        let next = derive_state(status, self.activity);
        self.set_state(next);

        if changed || previous != next {
            self.emitter.emit(EngineEvent::AuthorizationChanged {
                authorization: status,
                state: next,
            });
        }

        if next.is_inactive() && !previous.is_inactive() {
            self.report(
                ErrorKind::PermissionDenied,
                format!("location access {status}; serving last known or fallback location"),
            );
            let location = self.current_location();
            self.emitter.emit(EngineEvent::LocationChanged {
                fix: location.fix,
                has_real_fix: location.has_real_fix,
            });
        }
    }

    // --- Location ---

    pub fn ingest_location_fix(&mut self, fix: LocationFix) {
        if !self.state.is_active() {
            tracing::debug!("dropping fix while {}", self.state);
            return;
        }
        if !fix.is_valid() {
            self.transient_failures += 1;
            tracing::debug!("dropping invalid fix at {}", fix.coordinate);
            return;
        }
        if let Some(last) = self.last_fix
            && fix.timestamp < last.timestamp
        {
            tracing::debug!("dropping out-of-order fix ({} < {})", fix.timestamp, last.timestamp);
            return;
        }

        self.last_fix = Some(fix);

        if let (Some(min), Some(prev)) = (self.config.min_distance_meters, self.last_forwarded)
            && prev.coordinate.distance_meters(&fix.coordinate) < min
        {
            tracing::trace!("fix within {min}m of last forwarded; not forwarding");
            return;
        }
        self.last_forwarded = Some(fix);

        if let Err(e) = self
            .storage
            .record_visit(fix.coordinate, fix.timestamp, None)
        {
            self.report(ErrorKind::StorageFailure, format!("failed to record visit: {e}"));
        }
        self.emitter.emit(EngineEvent::LocationChanged {
            fix,
            has_real_fix: true,
        });
    }

    pub fn ingest_region_event(&mut self, region_id: &str, entered: bool) {
        if !self.state.is_active() {
            tracing::debug!("dropping region event for '{region_id}' while {}", self.state);
            return;
        }
        if !self.registry.contains(region_id) {
            tracing::debug!("dropping region event for unknown region '{region_id}'");
            return;
        }
        if !entered {
            tracing::debug!("exited region '{region_id}'");
            return;
        }

        let now = self.clock.now();
        if !self.debouncer.should_fire(region_id, now) {
            tracing::debug!("region '{region_id}' inside cool-down; suppressed");
            return;
        }

        let memory = match self.storage.find_memory_by_id(region_id) {
            Ok(Some(memory)) => Some(memory),
            Ok(None) => {
                tracing::info!("memory '{region_id}' no longer exists; dropping its region");
                self.unregister_region(region_id);
                return;
            }
            Err(e) => {
                self.report(
                    ErrorKind::StorageFailure,
                    format!("failed to look up memory '{region_id}': {e}"),
                );
                None
            }
        };

        let Some(region) = self.registry.touch(region_id, now).cloned() else {
            return;
        };
        if let Err(e) = self.storage.save_region(&region) {
            self.report(ErrorKind::StorageFailure, format!("failed to save region: {e}"));
        }

        let coordinate = self
            .last_fix
            .map(|f| f.coordinate)
            .unwrap_or(region.center);
        if let Err(e) = self.storage.record_visit(coordinate, now, Some(region_id)) {
            self.report(ErrorKind::StorageFailure, format!("failed to record visit: {e}"));
        }

        if self.config.notifications_enabled {
            let (title, body) = notification_text(memory.as_ref());
            self.presenter.present(&title, &body);
        }

        tracing::info!("memory '{region_id}' nearby");
        self.emitter.emit(EngineEvent::MemoryNearby {
            memory_id: region_id.to_string(),
        });
    }

    /// Never fails: transient failures are counted, terminal ones become
    /// error events.
    pub fn ingest_failure(&mut self, failure: PlatformFailure) {
        if failure.class() == FailureClass::Transient {
            self.transient_failures += 1;
            tracing::debug!("transient location failure: {failure}");
            return;
        }

        match failure {
            PlatformFailure::LocationUnknown | PlatformFailure::Network => {}
            PlatformFailure::Denied => {
                self.ingest_authorization_change(AuthorizationState::Denied);
            }
            PlatformFailure::MonitoringUnavailable => {
                if self.monitoring_available {
                    self.monitoring_available = false;
                    self.report(
                        ErrorKind::MonitoringUnavailable,
                        "platform reported region monitoring unavailable".to_string(),
                    );
                }
            }
            PlatformFailure::RegionMonitoringFailed { region_id, message } => {
                self.unregister_region(&region_id);
                self.report(
                    ErrorKind::PlatformCallFailure,
                    format!("monitoring failed for region '{region_id}': {message}"),
                );
            }
            PlatformFailure::Other { message } => {
                self.report(ErrorKind::PlatformCallFailure, message);
            }
        }
    }

    // --- Configuration ---

    pub fn set_activity_mode(&mut self, mode: ActivityMode) {
        self.activity = mode;
        if self.state.is_active() {
            self.set_state(EngineState::Active(mode));
        }
    }

    pub fn set_battery_optimization(&mut self, enabled: bool) {
        self.battery_optimization = enabled;
        if self.state.is_active() {
            self.apply_update_config();
        }
    }

    // --- Regions ---

    pub fn register_region(
        &mut self,
        request: RegionRequest,
        expires_at: Option<UnixMillis>,
    ) -> Result<(), RegistryError> {
        if !self.monitoring_available {
            return Err(RegistryError::MonitoringUnavailable);
        }

        let id = request.id.clone();
        let now = self.clock.now();
        let result = self
            .registry
            .register(request, expires_at, now, self.provider.as_mut());
        self.drain_removals();
        result?;

        if let Some(region) = self.registry.get(&id)
            && let Err(e) = self.storage.save_region(region)
        {
            self.report(ErrorKind::StorageFailure, format!("failed to save region: {e}"));
        }
        Ok(())
    }

    /// Idempotent. Later events for this id are treated as unknown.
    pub fn unregister_region(&mut self, region_id: &str) -> bool {
        let removed = self.registry.unregister(region_id, self.provider.as_mut());
        self.drain_removals();
        removed
    }

    pub fn expire_regions(&mut self) -> usize {
        let now = self.clock.now();
        let expired = self.registry.expire_older_than(now, self.provider.as_mut());
        self.drain_removals();
        expired
    }

    /// Stop monitoring every region and drop them from storage. Memories are
    /// kept.
    pub fn clear_regions(&mut self) -> usize {
        let cleared = self.registry.clear(self.provider.as_mut());
        self.drain_removals();
        tracing::info!("cleared {cleared} regions");
        cleared
    }

    /// Unregister the memory's region and delete the memory from storage.
    pub fn delete_memory(&mut self, memory_id: &str) -> bool {
        let removed = self.unregister_region(memory_id);
        if let Err(e) = self.storage.delete_memory(memory_id) {
            self.report(
                ErrorKind::StorageFailure,
                format!("failed to delete memory '{memory_id}': {e}"),
            );
        }
        removed
    }

    // --- Internals ---

    fn set_state(&mut self, next: EngineState) {
        let previous = self.state;
        match next {
            EngineState::Active(_) => {
                self.state = next;
                self.apply_update_config();
            }
            _ => {
                self.stop_updates();
                self.state = next;
            }
        }
        if previous != next {
            tracing::info!("engine {previous} -> {next}");
        }
    }

    /// Push the policy's config to the provider, touching it only when the
    /// config actually changed.
    fn apply_update_config(&mut self) {
        let desired = self
            .policy
            .select(self.authorization, self.activity, self.battery_optimization);

        match self.running {
            Some(current) if current == desired => return,
            Some(current)
                if current.accuracy != desired.accuracy
                    || current.significant_changes_only != desired.significant_changes_only =>
            {
                tracing::info!(
                    "restarting updates: {} -> {}",
                    current.accuracy.as_str(),
                    desired.accuracy.as_str()
                );
                self.provider.stop_updating();
                self.provider.start_updating(&desired);
            }
            Some(_) => self.provider.reconfigure(&desired),
            None => {
                tracing::info!(
                    "starting updates: accuracy={} filter={}m background={}",
                    desired.accuracy.as_str(),
                    desired.distance_filter_meters,
                    desired.allow_background
                );
                self.provider.start_updating(&desired);
            }
        }
        self.running = Some(desired);
    }

    fn stop_updates(&mut self) {
        if self.running.take().is_some() {
            tracing::info!("stopping updates");
            self.provider.stop_updating();
        }
    }

    /// Propagate registry removals to the debouncer and storage.
    fn drain_removals(&mut self) {
        for removal in self.registry.take_removed() {
            let id = &removal.region.id;
            self.debouncer.forget(id);
            if removal.cause != RemovalCause::Unregistered {
                tracing::info!("region '{id}' removed ({:?})", removal.cause);
            }
            if let Err(e) = self.storage.remove_region(id) {
                self.report(
                    ErrorKind::StorageFailure,
                    format!("failed to remove region '{id}': {e}"),
                );
            }
        }
    }

    fn report(&self, kind: ErrorKind, message: String) {
        tracing::warn!(?kind, "{message}");
        self.emitter.emit(EngineEvent::EngineError { kind, message });
    }
}

fn notification_text(memory: Option<&Memory>) -> (String, String) {
    let title = "You're near a memory".to_string();
    let body = match memory {
        Some(m) if !m.note.trim().is_empty() => format!("{}: {}", m.title, excerpt(&m.note, 120)),
        Some(m) if !m.title.trim().is_empty() => m.title.clone(),
        _ => "You're back where you saved something.".to_string(),
    };
    (title, body)
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::sim::{Harness, PlatformCall};

    const SF: Coordinate = Coordinate::new(37.7749, -122.4194);

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn started(h: &Harness) -> LocationEngine {
        let mut engine = h.engine(EngineConfig::default());
        engine.start();
        engine
    }

    fn fix_at(h: &Harness, coordinate: Coordinate) -> LocationFix {
        LocationFix::new(coordinate, h.clock.now(), 5.0)
    }

    #[test]
    fn test_start_moves_to_awaiting() {
        let h = Harness::new();
        let engine = started(&h);
        assert_eq!(engine.state(), EngineState::AwaitingAuthorization);
        assert!(h.platform.updating().is_none());
    }

    #[test]
    fn test_start_seeds_known_authorization() {
        let h = Harness::new();
        h.platform.set_authorization(AuthorizationState::AuthorizedLimited);
        let engine = started(&h);
        assert_eq!(engine.state(), EngineState::Active(ActivityMode::Default));
        assert!(!h.platform.updating().unwrap().allow_background);
    }

    #[test]
    fn test_request_authorization_is_idempotent() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.request_authorization();
        engine.request_authorization();
        assert_eq!(
            h.platform
                .count(|c| matches!(c, PlatformCall::RequestAuthorization(_))),
            1
        );

        engine.ingest_authorization_change(AuthorizationState::Denied);
        engine.request_authorization();
        assert_eq!(
            h.platform
                .count(|c| matches!(c, PlatformCall::RequestAuthorization(_))),
            1
        );
    }

    #[test]
    fn test_background_request_escalates_from_limited() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        engine.request_background_authorization();
        engine.request_background_authorization();
        assert_eq!(
            h.platform.count(|c| *c
                == PlatformCall::RequestAuthorization(AuthorizationRequest::Always)),
            1
        );

        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        assert!(!engine.snapshot().authorization_pending);
        engine.request_background_authorization();
        assert_eq!(
            h.platform
                .count(|c| matches!(c, PlatformCall::RequestAuthorization(_))),
            1
        );
    }

    #[test]
    fn test_duplicate_authorization_has_no_side_effects() {
        let h = Harness::new();
        let mut engine = started(&h);
        let mut rx = engine.subscribe();

        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);

        assert_eq!(
            h.platform
                .count(|c| matches!(c, PlatformCall::StartUpdating(_))),
            1
        );
        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::AuthorizationChanged { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn test_stale_not_determined_dropped() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        engine.ingest_authorization_change(AuthorizationState::NotDetermined);
        assert_eq!(engine.authorization(), AuthorizationState::AuthorizedLimited);
        assert!(engine.state().is_active());
    }

    #[test]
    fn test_restart_with_stale_not_determined_resumes_active() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine.stop();
        assert_eq!(engine.state(), EngineState::Uninitialized);

        // the platform has not re-reported yet on the second launch
        h.platform.set_authorization(AuthorizationState::NotDetermined);
        h.platform.clear_calls();
        engine.start();

        assert_eq!(engine.authorization(), AuthorizationState::AuthorizedFull);
        assert_eq!(engine.state(), EngineState::Active(ActivityMode::Default));
        assert_eq!(
            h.platform
                .count(|c| matches!(c, PlatformCall::StartUpdating(_))),
            1
        );
    }

    #[test]
    fn test_authorization_before_start_survives_stale_status() {
        let h = Harness::new();
        let mut engine = h.engine(EngineConfig::default());
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        let mut rx = engine.subscribe();
        engine.start();

        assert_eq!(engine.state(), EngineState::Active(ActivityMode::Default));
        assert!(h.platform.updating().is_some());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            EngineEvent::AuthorizationChanged {
                authorization: AuthorizationState::AuthorizedLimited,
                ..
            }
        )));

        engine.ingest_location_fix(fix_at(&h, SF));
        assert!(engine.current_location().has_real_fix);
    }

    #[test]
    fn test_upgrade_to_full_rearms_background_in_place() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        h.platform.clear_calls();

        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);

        let calls = h.platform.calls();
        assert_eq!(calls.len(), 1, "{calls:?}");
        assert!(matches!(calls[0], PlatformCall::Reconfigure(cfg) if cfg.allow_background));
    }

    #[test]
    fn test_denied_stops_updates_and_serves_fallback() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        let mut rx = engine.subscribe();

        engine.ingest_authorization_change(AuthorizationState::Denied);

        assert_eq!(engine.state(), EngineState::Inactive(InactiveReason::Denied));
        assert!(h.platform.updating().is_none());
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            EngineEvent::AuthorizationChanged {
                authorization: AuthorizationState::Denied,
                ..
            }
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::EngineError {
                kind: ErrorKind::PermissionDenied,
                ..
            }
        )));
        let fallback = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::LocationChanged { fix, has_real_fix } => Some((*fix, *has_real_fix)),
                _ => None,
            })
            .unwrap();
        assert!(!fallback.1);
        assert_eq!(fallback.0.coordinate, engine.config().fallback);

        // Denied -> Restricted stays in the denied class: no second error
        engine.ingest_authorization_change(AuthorizationState::Restricted);
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::EngineError { .. }))
            .count();
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_denied_serves_last_known_fix() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        let fix = fix_at(&h, SF.offset_meters(10.0, 10.0));
        engine.ingest_location_fix(fix);

        engine.ingest_authorization_change(AuthorizationState::Denied);
        let loc = engine.current_location();
        assert!(loc.has_real_fix);
        assert_eq!(loc.fix, fix);
    }

    #[test]
    fn test_activity_change_reconfigures_or_restarts() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        h.platform.clear_calls();

        // Default (medium) -> Walking (medium): in place
        engine.set_activity_mode(ActivityMode::Walking);
        assert_eq!(engine.state(), EngineState::Active(ActivityMode::Walking));
        let calls = h.platform.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], PlatformCall::Reconfigure(_)));

        // Walking (medium) -> Navigating (fine): restart
        h.platform.clear_calls();
        engine.set_activity_mode(ActivityMode::Navigating);
        let calls = h.platform.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], PlatformCall::StopUpdating);
        assert!(matches!(calls[1], PlatformCall::StartUpdating(_)));

        // Same mode again: nothing
        h.platform.clear_calls();
        engine.set_activity_mode(ActivityMode::Navigating);
        assert!(h.platform.calls().is_empty());
    }

    #[test]
    fn test_activity_mode_remembered_while_inactive() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.set_activity_mode(ActivityMode::Stationary);
        assert_eq!(engine.state(), EngineState::AwaitingAuthorization);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        assert_eq!(engine.state(), EngineState::Active(ActivityMode::Stationary));
        assert_eq!(
            h.platform.updating().unwrap().distance_filter_meters,
            100.0
        );
    }

    #[test]
    fn test_fix_forwarded_and_recorded() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        let mut rx = engine.subscribe();

        let fix = fix_at(&h, SF);
        engine.ingest_location_fix(fix);

        assert_eq!(
            drain(&mut rx),
            vec![EngineEvent::LocationChanged {
                fix,
                has_real_fix: true
            }]
        );
        let visits = h.storage.visits();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].memory_id, None);
    }

    #[test]
    fn test_fix_dropped_when_not_active() {
        let h = Harness::new();
        let mut engine = started(&h);
        let mut rx = engine.subscribe();
        engine.ingest_location_fix(fix_at(&h, SF));
        assert!(drain(&mut rx).is_empty());
        assert!(engine.last_fix().is_none());
    }

    #[test]
    fn test_invalid_and_out_of_order_fixes() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);

        engine.ingest_location_fix(LocationFix::new(SF, h.clock.now(), -1.0));
        assert_eq!(engine.snapshot().transient_failures, 1);
        assert!(engine.last_fix().is_none());

        let newer = LocationFix::new(SF, 2_000, 5.0);
        let older = LocationFix::new(SF.offset_meters(500.0, 0.0), 1_000, 5.0);
        engine.ingest_location_fix(newer);
        engine.ingest_location_fix(older);
        assert_eq!(engine.last_fix(), Some(newer));
    }

    #[test]
    fn test_min_distance_filter() {
        let h = Harness::new();
        let config = EngineConfig {
            min_distance_meters: Some(50.0),
            ..EngineConfig::default()
        };
        let mut engine = h.engine(config);
        engine.start();
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        let mut rx = engine.subscribe();

        engine.ingest_location_fix(fix_at(&h, SF));
        engine.ingest_location_fix(fix_at(&h, SF.offset_meters(20.0, 0.0)));
        engine.ingest_location_fix(fix_at(&h, SF.offset_meters(40.0, 0.0)));
        engine.ingest_location_fix(fix_at(&h, SF.offset_meters(80.0, 0.0)));

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(h.storage.visits().len(), 2);
        assert_eq!(
            engine.last_fix().unwrap().coordinate,
            SF.offset_meters(80.0, 0.0)
        );
    }

    #[test]
    fn test_region_events_dropped_until_active() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        let mut engine = started(&h);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();
        let mut rx = engine.subscribe();

        engine.ingest_region_event("m1", true);
        assert!(drain(&mut rx).is_empty());

        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        drain(&mut rx);
        engine.ingest_region_event("m1", true);
        assert_eq!(
            drain(&mut rx),
            vec![EngineEvent::MemoryNearby {
                memory_id: "m1".into()
            }]
        );
    }

    #[test]
    fn test_region_entry_side_effects() {
        let h = Harness::new();
        let mut memory = h.memory("m1", SF);
        memory.title = "First date".into();
        memory.note = "Tartine, the morning bun".into();
        h.storage.insert_memory(memory);
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();

        h.clock.advance_secs(10);
        engine.ingest_region_event("m1", true);

        let notes = h.presenter.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].body, "First date: Tartine, the morning bun");

        let visits = h.storage.visits();
        assert_eq!(visits.last().unwrap().memory_id.as_deref(), Some("m1"));
        assert_eq!(
            engine.registry().get("m1").unwrap().last_visited_at,
            Some(h.clock.now())
        );
        assert_eq!(
            h.storage.regions()[0].last_visited_at,
            Some(h.clock.now())
        );
    }

    #[test]
    fn test_exit_and_unknown_region_are_silent() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();
        let mut rx = engine.subscribe();

        engine.ingest_region_event("m1", false);
        engine.ingest_region_event("nope", true);

        assert!(drain(&mut rx).is_empty());
        assert!(h.presenter.notifications().is_empty());
    }

    #[test]
    fn test_entry_for_deleted_memory_unregisters_region() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine
            .register_region(RegionRequest::new("gone", SF, 100.0), None)
            .unwrap();
        let mut rx = engine.subscribe();

        engine.ingest_region_event("gone", true);

        assert!(drain(&mut rx).is_empty());
        assert!(!engine.registry().contains("gone"));
        assert!(h.storage.regions().is_empty());
        assert!(!h.platform.monitored_ids().contains(&"gone".to_string()));
    }

    #[test]
    fn test_event_after_unregister_is_dropped() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();
        assert!(engine.unregister_region("m1"));
        assert!(!engine.unregister_region("m1"));
        let mut rx = engine.subscribe();

        engine.ingest_region_event("m1", true);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_notifications_can_be_disabled() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        let config = EngineConfig {
            notifications_enabled: false,
            ..EngineConfig::default()
        };
        let mut engine = h.engine(config);
        engine.start();
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();
        let mut rx = engine.subscribe();
        engine.ingest_region_event("m1", true);
        assert!(h.presenter.notifications().is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_transient_failures_swallowed() {
        let h = Harness::new();
        let mut engine = started(&h);
        let mut rx = engine.subscribe();
        engine.ingest_failure(PlatformFailure::LocationUnknown);
        engine.ingest_failure(PlatformFailure::Network);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.snapshot().transient_failures, 2);
    }

    #[test]
    fn test_denied_failure_deactivates() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedFull);
        engine.ingest_failure(PlatformFailure::Denied);
        assert_eq!(engine.state(), EngineState::Inactive(InactiveReason::Denied));
    }

    #[test]
    fn test_monitoring_unavailable_disables_registration() {
        let h = Harness::new();
        let mut engine = started(&h);
        let mut rx = engine.subscribe();
        engine.ingest_failure(PlatformFailure::MonitoringUnavailable);
        engine.ingest_failure(PlatformFailure::MonitoringUnavailable);

        let errors = drain(&mut rx);
        assert_eq!(errors.len(), 1);
        assert!(!engine.monitoring_available());
        assert_eq!(
            engine.register_region(RegionRequest::new("m1", SF, 100.0), None),
            Err(RegistryError::MonitoringUnavailable)
        );
    }

    #[test]
    fn test_monitoring_unavailable_at_start() {
        let h = Harness::new();
        h.platform.set_monitoring_available(false);
        let mut engine = h.engine(EngineConfig::default());
        let mut rx = engine.subscribe();
        engine.start();
        assert!(!engine.monitoring_available());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            EngineEvent::EngineError {
                kind: ErrorKind::MonitoringUnavailable,
                ..
            }
        )));
    }

    #[test]
    fn test_monitoring_unavailable_leaves_persisted_regions_alone() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        h.storage
            .insert_region(RegionRequest::new("m1", SF, 100.0).into_region(h.clock.now(), None));
        h.platform.set_monitoring_available(false);
        h.platform.set_authorization(AuthorizationState::AuthorizedFull);

        let mut engine = h.engine(EngineConfig::default());
        let mut rx = engine.subscribe();
        engine.start();

        assert!(engine.registry().is_empty());
        assert!(h.platform.monitored_ids().is_empty());
        assert_eq!(h.storage.regions().len(), 1);

        engine.ingest_region_event("m1", true);
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, EngineEvent::MemoryNearby { .. }))
        );
    }

    #[test]
    fn test_clear_regions_stops_monitoring_and_storage() {
        let h = Harness::new();
        let mut engine = started(&h);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            h.storage.insert_memory(h.memory(id, SF.offset_meters(i as f64 * 500.0, 0.0)));
            engine
                .register_region(
                    RegionRequest::new(*id, SF.offset_meters(i as f64 * 500.0, 0.0), 100.0),
                    None,
                )
                .unwrap();
        }

        assert_eq!(engine.clear_regions(), 3);
        assert!(engine.registry().is_empty());
        assert!(h.platform.monitored_ids().is_empty());
        assert!(h.storage.regions().is_empty());
        assert_eq!(h.storage.memory_ids().len(), 3);
        assert_eq!(engine.clear_regions(), 0);
    }

    #[test]
    fn test_region_monitoring_failure_drops_region() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();
        let mut rx = engine.subscribe();

        engine.ingest_failure(PlatformFailure::RegionMonitoringFailed {
            region_id: "m1".into(),
            message: "too many regions".into(),
        });

        assert!(!engine.registry().contains("m1"));
        assert!(h.storage.regions().is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::EngineError {
                kind: ErrorKind::PlatformCallFailure,
                ..
            }]
        ));
    }

    #[test]
    fn test_storage_failure_surfaces_as_event() {
        let h = Harness::new();
        let mut engine = started(&h);
        engine.ingest_authorization_change(AuthorizationState::AuthorizedLimited);
        let mut rx = engine.subscribe();
        h.storage.set_failing(true);

        engine.ingest_location_fix(fix_at(&h, SF));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::EngineError {
                kind: ErrorKind::StorageFailure,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::LocationChanged { .. })));
    }

    #[test]
    fn test_delete_memory_removes_everything() {
        let h = Harness::new();
        h.storage.insert_memory(h.memory("m1", SF));
        let mut engine = started(&h);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();

        assert!(engine.delete_memory("m1"));
        assert!(h.storage.memory_ids().is_empty());
        assert!(h.storage.regions().is_empty());
        assert!(h.platform.monitored_ids().is_empty());
    }

    #[test]
    fn test_expire_regions_persists_removal() {
        let h = Harness::new();
        let mut engine = started(&h);
        let expires = h.clock.now() + 60_000;
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), Some(expires))
            .unwrap();
        assert_eq!(engine.expire_regions(), 0);
        h.clock.advance_secs(61);
        assert_eq!(engine.expire_regions(), 1);
        assert!(h.storage.regions().is_empty());
    }

    #[test]
    fn test_stop_then_restart() {
        let h = Harness::new();
        h.platform.set_authorization(AuthorizationState::AuthorizedFull);
        let mut engine = started(&h);
        engine
            .register_region(RegionRequest::new("m1", SF, 100.0), None)
            .unwrap();

        engine.stop();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(h.platform.updating().is_none());
        assert_eq!(h.platform.monitored_ids(), vec!["m1".to_string()]);

        engine.start();
        assert!(engine.state().is_active());
        assert!(engine.registry().contains("m1"));
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let cut = excerpt(&long, 120);
        assert_eq!(cut.chars().count(), 121);
        assert!(cut.ends_with('…'));
    }
}
