//! Replay scripts: a JSON list of platform callbacks and commands fed
//! through the engine actor against a simulated platform and a manual clock.
//!
//! ```json
//! {
//!   "memories": [{"id": "m1", "title": "Cafe", "latitude": 37.7749, "longitude": -122.4194}],
//!   "steps": [
//!     {"step": "start"},
//!     {"step": "request_authorization"},
//!     {"step": "authorization", "status": "authorized_full"},
//!     {"step": "register", "id": "m1"},
//!     {"step": "enter", "id": "m1"},
//!     {"step": "advance", "secs": 60},
//!     {"step": "enter", "id": "m1"}
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use tokio::sync::broadcast;

use rem_core::sim::{ManualClock, SIM_EPOCH, SimulatedPlatform, jittered_path};
use rem_core::time::secs_to_millis;
use rem_core::{
    ActivityMode, AuthorizationState, Clock, Collaborators, CommandError, Coordinate,
    EngineConfig, EngineEvent, EngineHandle, LocationEngine, LocationFix, Memory,
    PlatformFailure, RegionRequest, spawn,
};
use rem_store::Store;

use crate::LogPresenter;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Replaces the loaded config; omitted fields take their defaults.
    #[serde(default)]
    pub config: Option<EngineConfig>,
    #[serde(default)]
    pub initial_authorization: AuthorizationState,
    #[serde(default = "default_true")]
    pub monitoring_available: bool,
    #[serde(default)]
    pub memories: Vec<ScriptMemory>,
    pub steps: Vec<ScriptStep>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptMemory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub note: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius_meters: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Start,
    Stop,
    RequestAuthorization,
    RequestBackgroundAuthorization,
    Authorization {
        status: AuthorizationState,
    },
    Fix {
        latitude: f64,
        longitude: f64,
        #[serde(default = "default_accuracy")]
        accuracy_meters: f64,
    },
    Enter {
        id: String,
    },
    Exit {
        id: String,
    },
    Failure(PlatformFailure),
    Activity {
        activity: String,
    },
    Battery {
        enabled: bool,
    },
    Advance {
        secs: u64,
    },
    Register {
        id: String,
        #[serde(default)]
        latitude: Option<f64>,
        #[serde(default)]
        longitude: Option<f64>,
        #[serde(default)]
        radius_meters: Option<f64>,
        #[serde(default)]
        expires_in_secs: Option<u64>,
    },
    Unregister {
        id: String,
    },
    ClearRegions,
    /// Fixes along a jittered line; crossings of registered regions are
    /// reported as enter/exit the way the platform would.
    Walk {
        from: Coordinate,
        to: Coordinate,
        steps: usize,
        #[serde(default)]
        jitter_meters: f64,
        #[serde(default = "default_interval")]
        interval_secs: u64,
    },
    Snapshot,
}

fn default_true() -> bool {
    true
}

fn default_accuracy() -> f64 {
    10.0
}

fn default_interval() -> u64 {
    5
}

pub fn load_script(path: &Path) -> Result<Script> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid script {}", path.display()))
}

/// Geometry of a region the driver registered, for `walk` crossings.
struct KnownRegion {
    center: Coordinate,
    radius_meters: f64,
}

pub struct Replay<W: Write> {
    handle: EngineHandle,
    join: Option<tokio::task::JoinHandle<LocationEngine>>,
    events: broadcast::Receiver<EngineEvent>,
    clock: ManualClock,
    config: EngineConfig,
    memories: BTreeMap<String, Memory>,
    regions: BTreeMap<String, KnownRegion>,
    inside: BTreeSet<String>,
    rng: StdRng,
    out: W,
    printed: usize,
}

impl<W: Write> Replay<W> {
    /// Build the engine over a fresh in-memory SQLite store seeded with the
    /// script's memories, and spawn it.
    pub fn new(script: &Script, base_config: EngineConfig, seed: u64, out: W) -> Result<Self> {
        let config = script.config.clone().unwrap_or(base_config);
        let clock = ManualClock::new(SIM_EPOCH);

        let store = Store::open_in_memory().context("failed to open replay store")?;
        let mut memories = BTreeMap::new();
        for m in &script.memories {
            let memory = Memory {
                id: m.id.clone(),
                title: m.title.clone(),
                note: m.note.clone(),
                coordinate: Coordinate::new(m.latitude, m.longitude),
                radius_meters: m.radius_meters.unwrap_or(config.default_radius_meters),
                created_at: SIM_EPOCH,
            };
            store
                .insert_memory(&memory)
                .with_context(|| format!("failed to seed memory '{}'", m.id))?;
            memories.insert(memory.id.clone(), memory);
        }

        let platform = SimulatedPlatform::new();
        platform.set_authorization(script.initial_authorization);
        platform.set_monitoring_available(script.monitoring_available);

        let engine = LocationEngine::new(
            config.clone(),
            Collaborators {
                provider: Box::new(platform),
                storage: Box::new(store),
                presenter: Box::new(LogPresenter),
                clock: Arc::new(clock.clone()),
            },
        );
        let (handle, join) = spawn(engine);
        let events = handle.subscribe();

        Ok(Self {
            handle,
            join: Some(join),
            events,
            clock,
            config,
            memories,
            regions: BTreeMap::new(),
            inside: BTreeSet::new(),
            rng: StdRng::seed_from_u64(seed),
            out,
            printed: 0,
        })
    }

    pub async fn run(mut self, steps: &[ScriptStep]) -> Result<usize> {
        for (i, step) in steps.iter().enumerate() {
            tracing::debug!("step {i}: {step:?}");
            self.apply(step)
                .await
                .with_context(|| format!("step {i} failed"))?;
            self.flush().await?;
        }

        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            join.await.context("engine task panicked")?;
        }
        self.drain()?;
        Ok(self.printed)
    }

    async fn apply(&mut self, step: &ScriptStep) -> Result<()> {
        match step {
            ScriptStep::Start => self.handle.start(),
            ScriptStep::Stop => self.handle.stop(),
            ScriptStep::RequestAuthorization => self.handle.request_authorization(),
            ScriptStep::RequestBackgroundAuthorization => {
                self.handle.request_background_authorization()
            }
            ScriptStep::Authorization { status } => {
                self.handle.ingest_authorization_change(*status)
            }
            ScriptStep::Fix {
                latitude,
                longitude,
                accuracy_meters,
            } => {
                let coordinate = Coordinate::new(*latitude, *longitude);
                self.handle.ingest_location_fix(LocationFix::new(
                    coordinate,
                    self.clock.now(),
                    *accuracy_meters,
                ));
            }
            ScriptStep::Enter { id } => self.handle.ingest_region_event(id.as_str(), true),
            ScriptStep::Exit { id } => self.handle.ingest_region_event(id.as_str(), false),
            ScriptStep::Failure(failure) => self.handle.ingest_failure(failure.clone()),
            ScriptStep::Activity { activity } => {
                self.handle
                    .set_activity_mode(ActivityMode::from_activity_name(activity));
            }
            ScriptStep::Battery { enabled } => self.handle.set_battery_optimization(*enabled),
            ScriptStep::Advance { secs } => {
                // everything queued so far happens before the clock moves
                self.handle.snapshot().await?;
                self.clock.advance_secs(*secs);
            }
            ScriptStep::Register {
                id,
                latitude,
                longitude,
                radius_meters,
                expires_in_secs,
            } => {
                self.register(id, *latitude, *longitude, *radius_meters, *expires_in_secs)
                    .await?;
            }
            ScriptStep::Unregister { id } => {
                self.handle.unregister_region(id.as_str()).await?;
                self.regions.remove(id);
                self.inside.remove(id);
            }
            ScriptStep::ClearRegions => {
                self.handle.clear_regions().await?;
                self.regions.clear();
                self.inside.clear();
            }
            ScriptStep::Walk {
                from,
                to,
                steps,
                jitter_meters,
                interval_secs,
            } => {
                self.handle.snapshot().await?;
                let path = jittered_path(
                    *from,
                    *to,
                    *steps,
                    *jitter_meters,
                    self.clock.now(),
                    secs_to_millis(*interval_secs),
                    &mut self.rng,
                );
                for fix in path {
                    self.handle.snapshot().await?;
                    self.clock.set(fix.timestamp);
                    self.handle.ingest_location_fix(fix);
                    self.report_crossings(&fix);
                }
            }
            ScriptStep::Snapshot => {
                let snapshot = self.handle.snapshot().await?;
                self.drain()?;
                let line = serde_json::json!({ "snapshot": snapshot });
                writeln!(self.out, "{line}")?;
            }
        }
        Ok(())
    }

    async fn register(
        &mut self,
        id: &str,
        latitude: Option<f64>,
        longitude: Option<f64>,
        radius_meters: Option<f64>,
        expires_in_secs: Option<u64>,
    ) -> Result<()> {
        let memory = self.memories.get(id);
        let center = match (latitude, longitude, memory) {
            (Some(lat), Some(lon), _) => Coordinate::new(lat, lon),
            (None, None, Some(m)) => m.coordinate,
            _ => bail!("register '{id}': give latitude and longitude or declare the memory"),
        };
        let radius = radius_meters
            .or(memory.map(|m| m.radius_meters))
            .unwrap_or(self.config.default_radius_meters);
        let expires_at = expires_in_secs.map(|s| self.clock.now() + secs_to_millis(s));

        match self
            .handle
            .register_region(RegionRequest::new(id, center, radius), expires_at)
            .await
        {
            Ok(()) => {
                self.regions.insert(
                    id.to_string(),
                    KnownRegion {
                        center,
                        radius_meters: radius,
                    },
                );
            }
            // a rejected registration is part of the replayed behavior
            Err(CommandError::Registry(e)) => {
                let line = serde_json::json!({ "register_failed": { "id": id, "error": e.to_string() } });
                writeln!(self.out, "{line}")?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn report_crossings(&mut self, fix: &LocationFix) {
        for (id, region) in &self.regions {
            let now_inside = region.center.distance_meters(&fix.coordinate) <= region.radius_meters;
            let was_inside = self.inside.contains(id);
            if now_inside != was_inside {
                self.handle.ingest_region_event(id.as_str(), now_inside);
                if now_inside {
                    self.inside.insert(id.clone());
                } else {
                    self.inside.remove(id);
                }
            }
        }
    }

    /// Wait for the engine to catch up, then print what it emitted.
    async fn flush(&mut self) -> Result<()> {
        if !self.handle.is_closed() {
            self.handle.snapshot().await?;
        }
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    writeln!(self.out, "{}", serde_json::to_string(&event)?)?;
                    self.printed += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("event printer lagged; {n} events lost");
                }
                Err(_) => return Ok(()),
            }
        }
    }
}
