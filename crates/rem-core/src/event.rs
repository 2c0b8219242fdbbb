//! The engine's single outbound event stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::authorization::AuthorizationState;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::engine::EngineState;
use crate::error::ErrorKind;
use crate::geo::Coordinate;
use crate::time::UnixMillis;

/// One location sample from the platform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    pub timestamp: UnixMillis,
    pub horizontal_accuracy_meters: f64,
}

impl LocationFix {
    pub fn new(coordinate: Coordinate, timestamp: UnixMillis, horizontal_accuracy_meters: f64) -> Self {
        Self {
            coordinate,
            timestamp,
            horizontal_accuracy_meters,
        }
    }

    /// Negative accuracy is the platform's "invalid fix" marker.
    pub fn is_valid(&self) -> bool {
        self.coordinate.is_valid()
            && self.horizontal_accuracy_meters.is_finite()
            && self.horizontal_accuracy_meters >= 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    AuthorizationChanged {
        authorization: AuthorizationState,
        state: EngineState,
    },
    LocationChanged {
        fix: LocationFix,
        /// False when `fix` is the configured fallback.
        has_real_fix: bool,
    },
    MemoryNearby {
        memory_id: String,
    },
    EngineError {
        kind: ErrorKind,
        message: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::AuthorizationChanged { .. } => "authorization_changed",
            EngineEvent::LocationChanged { .. } => "location_changed",
            EngineEvent::MemoryNearby { .. } => "memory_nearby",
            EngineEvent::EngineError { .. } => "engine_error",
        }
    }
}

/// Broadcast-based emitter. `emit` never blocks; lagging receivers drop
/// events instead of stalling the engine.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
    emit_count: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the number of receivers reached (0 with no subscribers).
    pub fn emit(&self, event: EngineEvent) -> usize {
        tracing::debug!(kind = event.kind(), "emit");
        self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
