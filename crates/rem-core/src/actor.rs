//! Engine actor: one task owns the `LocationEngine`; callbacks from any
//! thread are queued on an unbounded MPSC channel and applied in order.
//!
//! Ingest methods are fire-and-forget and never block the caller. Commands
//! that produce a value carry a oneshot reply.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::activity::ActivityMode;
use crate::authorization::AuthorizationState;
use crate::engine::{EngineSnapshot, LocationEngine};
use crate::error::{CommandError, PlatformFailure, RegistryError};
use crate::event::{EngineEvent, EventEmitter, LocationFix};
use crate::region::RegionRequest;
use crate::time::UnixMillis;

enum Command {
    Start,
    Stop,
    RequestAuthorization,
    RequestBackgroundAuthorization,
    Authorization(AuthorizationState),
    Fix(LocationFix),
    Region {
        id: String,
        entered: bool,
    },
    Failure(PlatformFailure),
    Activity(ActivityMode),
    Battery(bool),
    Register {
        request: RegionRequest,
        expires_at: Option<UnixMillis>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Unregister {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    DeleteMemory {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    ExpireRegions {
        reply: oneshot::Sender<usize>,
    },
    ClearRegions {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a running engine task.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    emitter: EventEmitter,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.emitter.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // --- Fire-and-forget ---

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn request_authorization(&self) {
        self.send(Command::RequestAuthorization);
    }

    pub fn request_background_authorization(&self) {
        self.send(Command::RequestBackgroundAuthorization);
    }

    pub fn ingest_authorization_change(&self, status: AuthorizationState) {
        self.send(Command::Authorization(status));
    }

    pub fn ingest_location_fix(&self, fix: LocationFix) {
        self.send(Command::Fix(fix));
    }

    pub fn ingest_region_event(&self, region_id: impl Into<String>, entered: bool) {
        self.send(Command::Region {
            id: region_id.into(),
            entered,
        });
    }

    pub fn ingest_failure(&self, failure: PlatformFailure) {
        self.send(Command::Failure(failure));
    }

    pub fn set_activity_mode(&self, mode: ActivityMode) {
        self.send(Command::Activity(mode));
    }

    pub fn set_battery_optimization(&self, enabled: bool) {
        self.send(Command::Battery(enabled));
    }

    /// Ask the task to exit after draining commands queued before this one.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    // --- Request/reply ---

    pub async fn register_region(
        &self,
        request: RegionRequest,
        expires_at: Option<UnixMillis>,
    ) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Register {
                request,
                expires_at,
                reply,
            },
            rx,
        )
        .await?
        .map_err(CommandError::from)
    }

    pub async fn unregister_region(&self, id: impl Into<String>) -> Result<bool, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Unregister {
                id: id.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn delete_memory(&self, id: impl Into<String>) -> Result<bool, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::DeleteMemory {
                id: id.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn expire_regions(&self) -> Result<usize, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ExpireRegions { reply }, rx).await
    }

    pub async fn clear_regions(&self) -> Result<usize, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ClearRegions { reply }, rx).await
    }

    /// Also a barrier: resolves after every command queued before it.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Snapshot { reply }, rx).await
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            tracing::debug!("engine task gone; command dropped");
        }
    }

    async fn request<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CommandError> {
        self.tx.send(cmd).map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)
    }
}

/// Spawn the engine onto the current tokio runtime. After `shutdown`, or once
/// every handle is dropped, the engine is stopped and handed back through the
/// join handle.
pub fn spawn(engine: LocationEngine) -> (EngineHandle, JoinHandle<LocationEngine>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = EngineHandle {
        tx,
        emitter: engine.emitter(),
    };
    let sweep_secs = engine.config().expiry_sweep_secs;
    let sweep = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));
    let join = tokio::spawn(run(engine, rx, sweep));
    (handle, join)
}

async fn run(
    mut engine: LocationEngine,
    mut rx: mpsc::UnboundedReceiver<Command>,
    sweep: Option<Duration>,
) -> LocationEngine {
    let mut sweep = sweep.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(Command::Shutdown) | None => break,
                Some(cmd) => apply(&mut engine, cmd),
            },
            _ = tick(&mut sweep) => {
                let expired = engine.expire_regions();
                if expired > 0 {
                    tracing::debug!("expiry sweep removed {expired} regions");
                }
            }
        }
    }

    tracing::debug!("engine task exiting");
    engine.stop();
    engine
}

async fn tick(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn apply(engine: &mut LocationEngine, cmd: Command) {
    match cmd {
        Command::Start => engine.start(),
        Command::Stop => engine.stop(),
        Command::RequestAuthorization => engine.request_authorization(),
        Command::RequestBackgroundAuthorization => engine.request_background_authorization(),
        Command::Authorization(status) => engine.ingest_authorization_change(status),
        Command::Fix(fix) => engine.ingest_location_fix(fix),
        Command::Region { id, entered } => engine.ingest_region_event(&id, entered),
        Command::Failure(failure) => engine.ingest_failure(failure),
        Command::Activity(mode) => engine.set_activity_mode(mode),
        Command::Battery(enabled) => engine.set_battery_optimization(enabled),
        Command::Register {
            request,
            expires_at,
            reply,
        } => {
            let _ = reply.send(engine.register_region(request, expires_at));
        }
        Command::Unregister { id, reply } => {
            let _ = reply.send(engine.unregister_region(&id));
        }
        Command::DeleteMemory { id, reply } => {
            let _ = reply.send(engine.delete_memory(&id));
        }
        Command::ExpireRegions { reply } => {
            let _ = reply.send(engine.expire_regions());
        }
        Command::ClearRegions { reply } => {
            let _ = reply.send(engine.clear_regions());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(engine.snapshot());
        }
        Command::Shutdown => {}
    }
}
