//! Tracker statistics: atomic counters plus a cloneable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for tracker activity.
pub(crate) struct TrackerStats {
    snapshots_taken: AtomicU64,
    group_clear_batches: AtomicU64,
    group_clear_members: AtomicU64,
    solo_clears: AtomicU64,
    visibility_fast_hits: AtomicU64,
    visibility_slow_scans: AtomicU64,
    replay_added: AtomicU64,
    replay_removed: AtomicU64,
    replay_remove_misses: AtomicU64,
    replay_compressions: AtomicU64,
    replay_forced_compressions: AtomicU64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self {
            snapshots_taken: AtomicU64::new(0),
            group_clear_batches: AtomicU64::new(0),
            group_clear_members: AtomicU64::new(0),
            solo_clears: AtomicU64::new(0),
            visibility_fast_hits: AtomicU64::new(0),
            visibility_slow_scans: AtomicU64::new(0),
            replay_added: AtomicU64::new(0),
            replay_removed: AtomicU64::new(0),
            replay_remove_misses: AtomicU64::new(0),
            replay_compressions: AtomicU64::new(0),
            replay_forced_compressions: AtomicU64::new(0),
        }
    }

    pub fn record_snapshot(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_clear(&self, members: u64) {
        self.group_clear_batches.fetch_add(1, Ordering::Relaxed);
        self.group_clear_members.fetch_add(members, Ordering::Relaxed);
    }

    pub fn record_solo_clear(&self) {
        self.solo_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_visibility_fast_hit(&self) {
        self.visibility_fast_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_visibility_slow_scan(&self) {
        self.visibility_slow_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_added(&self, n: u64) {
        self.replay_added.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_replay_removed(&self) {
        self.replay_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_remove_miss(&self) {
        self.replay_remove_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_compression(&self, forced: bool) {
        self.replay_compressions.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.replay_forced_compressions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            snapshots_taken: self.snapshots_taken.load(Ordering::Relaxed),
            group_clear_batches: self.group_clear_batches.load(Ordering::Relaxed),
            group_clear_members: self.group_clear_members.load(Ordering::Relaxed),
            solo_clears: self.solo_clears.load(Ordering::Relaxed),
            visibility_fast_hits: self.visibility_fast_hits.load(Ordering::Relaxed),
            visibility_slow_scans: self.visibility_slow_scans.load(Ordering::Relaxed),
            replay_added: self.replay_added.load(Ordering::Relaxed),
            replay_removed: self.replay_removed.load(Ordering::Relaxed),
            replay_remove_misses: self.replay_remove_misses.load(Ordering::Relaxed),
            replay_compressions: self.replay_compressions.load(Ordering::Relaxed),
            replay_forced_compressions: self.replay_forced_compressions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the tracker counters, for observability surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStatsSnapshot {
    pub snapshots_taken: u64,
    pub group_clear_batches: u64,
    pub group_clear_members: u64,
    pub solo_clears: u64,
    pub visibility_fast_hits: u64,
    pub visibility_slow_scans: u64,
    pub replay_added: u64,
    pub replay_removed: u64,
    pub replay_remove_misses: u64,
    pub replay_compressions: u64,
    pub replay_forced_compressions: u64,
}
