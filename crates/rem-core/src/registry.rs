//! Geofence registry: memory id → monitored region.
//!
//! The registry is the engine's view of what the platform is watching. Every
//! insert is paired with a `start_monitoring` call and every removal with a
//! `stop_monitoring` call, so the registry's ids stay a subset of the
//! platform's. After a restart `restore` + `reconcile` re-establish that.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::platform::RegionMonitor;
use crate::region::{MonitoredRegion, RegionRequest};
use crate::time::UnixMillis;

/// What to do when a registration would exceed the platform cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    OldestCreated,
    LeastRecentlyVisited,
    Reject,
}

/// Why a region left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    Unregistered,
    Expired,
    Evicted,
    /// Dropped while restoring because the persisted set exceeded capacity.
    Overflow,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Removal {
    pub region: MonitoredRegion,
    pub cause: RemovalCause,
}

/// Outcome of a reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    /// Monitored by the platform but unknown to the registry; stopped.
    pub stopped: Vec<String>,
    /// Known to the registry but not confirmed by the platform; re-armed.
    pub rearmed: Vec<String>,
}

#[derive(Clone, Debug)]
struct Entry {
    region: MonitoredRegion,
    /// Insertion order, tie-breaker for equal timestamps.
    seq: u64,
}

#[derive(Debug)]
pub struct GeofenceRegistry {
    entries: HashMap<String, Entry>,
    capacity: usize,
    eviction: EvictionPolicy,
    next_seq: u64,
    removed: Vec<Removal>,
}

impl GeofenceRegistry {
    pub fn new(capacity: usize, eviction: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            eviction,
            next_seq: 0,
            removed: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn eviction(&self) -> EvictionPolicy {
        self.eviction
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&MonitoredRegion> {
        self.entries.get(id).map(|e| &e.region)
    }

    /// Sorted ids.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Regions in insertion order.
    pub fn regions(&self) -> Vec<&MonitoredRegion> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.region).collect()
    }

    /// Drain the removal journal.
    pub fn take_removed(&mut self) -> Vec<Removal> {
        std::mem::take(&mut self.removed)
    }

    pub fn register<M: RegionMonitor + ?Sized>(
        &mut self,
        request: RegionRequest,
        expires_at: Option<UnixMillis>,
        now: UnixMillis,
        monitor: &mut M,
    ) -> Result<(), RegistryError> {
        request.validate()?;
        if self.entries.contains_key(&request.id) {
            return Err(RegistryError::DuplicateId(request.id));
        }

        if self.entries.len() >= self.capacity {
            let expired = self.expire_older_than(now, monitor);
            if expired > 0 {
                tracing::debug!("freed {expired} expired regions while at capacity");
            }
        }

        if self.entries.len() >= self.capacity {
            let victim = match self.eviction {
                EvictionPolicy::Reject => None,
                EvictionPolicy::OldestCreated => self.oldest_by(|r| r.created_at),
                EvictionPolicy::LeastRecentlyVisited => self.oldest_by(|r| r.last_activity()),
            };
            let Some(victim) = victim else {
                return Err(RegistryError::CapacityExceeded {
                    capacity: self.capacity,
                });
            };
            tracing::info!(
                "evicting region '{victim}' ({:?}) to make room for '{}'",
                self.eviction,
                request.id
            );
            self.remove(&victim, RemovalCause::Evicted, monitor);
        }

        let region = request.into_region(now, expires_at);
        monitor.start_monitoring(&region);
        tracing::info!(
            "registered region '{}' at {} r={}m",
            region.id,
            region.center,
            region.radius_meters
        );
        self.insert(region);
        Ok(())
    }

    /// Idempotent. Returns whether a region was removed.
    pub fn unregister<M: RegionMonitor + ?Sized>(&mut self, id: &str, monitor: &mut M) -> bool {
        self.remove(id, RemovalCause::Unregistered, monitor)
    }

    /// Remove every region whose `expires_at <= now`. Returns the count.
    pub fn expire_older_than<M: RegionMonitor + ?Sized>(
        &mut self,
        now: UnixMillis,
        monitor: &mut M,
    ) -> usize {
        let mut expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.region.is_expired(now))
            .map(|e| e.region.id.clone())
            .collect();
        expired.sort();
        for id in &expired {
            tracing::info!("region '{id}' expired");
            self.remove(id, RemovalCause::Expired, monitor);
        }
        expired.len()
    }

    /// Stop monitoring everything.
    pub fn clear<M: RegionMonitor + ?Sized>(&mut self, monitor: &mut M) -> usize {
        let ids = self.ids();
        for id in &ids {
            self.remove(id, RemovalCause::Unregistered, monitor);
        }
        ids.len()
    }

    /// Record a visit for least-recently-visited eviction.
    pub fn touch(&mut self, id: &str, now: UnixMillis) -> Option<&MonitoredRegion> {
        let entry = self.entries.get_mut(id)?;
        entry.region.last_visited_at = Some(now);
        Some(&entry.region)
    }

    /// Load persisted regions without talking to the platform. Ids already
    /// present are skipped; beyond capacity the oldest-created are dropped
    /// and journaled as `Overflow`. Returns the number restored.
    pub fn restore(&mut self, mut regions: Vec<MonitoredRegion>) -> usize {
        regions.retain(|r| !self.entries.contains_key(&r.id));
        regions.sort_by_key(|r| r.created_at);

        let room = self.capacity.saturating_sub(self.entries.len());
        let overflow = regions.len().saturating_sub(room);
        for region in regions.drain(..overflow) {
            tracing::warn!("dropping persisted region '{}': over capacity", region.id);
            self.removed.push(Removal {
                region,
                cause: RemovalCause::Overflow,
            });
        }

        let restored = regions.len();
        for region in regions {
            self.insert(region);
        }
        restored
    }

    /// Align the platform with the registry.
    pub fn reconcile<M: RegionMonitor + ?Sized>(&self, monitor: &mut M) -> ReconcileReport {
        let platform: HashSet<String> = monitor.monitored_region_ids().into_iter().collect();
        let mut report = ReconcileReport::default();

        let mut unknown: Vec<&String> = platform
            .iter()
            .filter(|id| !self.entries.contains_key(*id))
            .collect();
        unknown.sort();
        for id in unknown {
            monitor.stop_monitoring(id);
            report.stopped.push(id.clone());
        }

        for region in self.regions() {
            if !platform.contains(&region.id) {
                monitor.start_monitoring(region);
                report.rearmed.push(region.id.clone());
            }
        }

        if !report.stopped.is_empty() || !report.rearmed.is_empty() {
            tracing::info!(
                "reconciled regions: stopped {}, re-armed {}",
                report.stopped.len(),
                report.rearmed.len()
            );
        }
        report
    }

    fn insert(&mut self, region: MonitoredRegion) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(region.id.clone(), Entry { region, seq });
    }

    fn remove<M: RegionMonitor + ?Sized>(
        &mut self,
        id: &str,
        cause: RemovalCause,
        monitor: &mut M,
    ) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                monitor.stop_monitoring(id);
                self.removed.push(Removal {
                    region: entry.region,
                    cause,
                });
                true
            }
            None => false,
        }
    }

    fn oldest_by(&self, key: impl Fn(&MonitoredRegion) -> UnixMillis) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|e| (key(&e.region), e.seq))
            .map(|e| e.region.id.clone())
    }
}
