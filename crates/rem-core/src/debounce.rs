//! Per-region cool-down for "memory nearby" side effects.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::time::{UnixMillis, secs_to_millis};

/// Last time a region fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebounceEntry {
    pub region_id: String,
    pub last_fired_at: UnixMillis,
}

/// Suppresses repeated region entries inside a cool-down window.
///
/// The check-and-record in `should_fire` happens under one lock, so
/// concurrent callers for the same id see at most one `true`.
#[derive(Debug)]
pub struct NotificationDebouncer {
    cool_down: UnixMillis,
    entries: Mutex<HashMap<String, UnixMillis>>,
}

impl NotificationDebouncer {
    pub fn new(cool_down: UnixMillis) -> Self {
        Self {
            cool_down,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_secs(cool_down_secs: u64) -> Self {
        Self::new(secs_to_millis(cool_down_secs))
    }

    pub fn cool_down(&self) -> UnixMillis {
        self.cool_down
    }

    pub fn should_fire(&self, region_id: &str, now: UnixMillis) -> bool {
        let mut entries = self.lock();
        let cool_down = self.cool_down;
        entries.retain(|_, last| now.saturating_sub(*last) <= cool_down);

        match entries.get(region_id) {
            Some(last) if now.saturating_sub(*last) <= cool_down => false,
            _ => {
                entries.insert(region_id.to_string(), now);
                true
            }
        }
    }

    /// Drop the entry for a region that is no longer registered.
    pub fn forget(&self, region_id: &str) {
        self.lock().remove(region_id);
    }

    pub fn entry(&self, region_id: &str) -> Option<DebounceEntry> {
        self.lock().get(region_id).map(|&last_fired_at| DebounceEntry {
            region_id: region_id.to_string(),
            last_fired_at,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UnixMillis>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NotificationDebouncer {
    fn default() -> Self {
        Self::from_secs(crate::constants::DEFAULT_COOLDOWN_SECS)
    }
}
