//! Visibility queries over the registry (and replay set when replaying).
//!
//! `is_in_progress` is the hot path of tuple visibility: it runs tier by
//! tier, each tier cheaper than the next, and only takes the registry's
//! shared lock when every lock-free answer was inconclusive. The
//! commit-log recheck sits in front of the lock on purpose: the instant
//! the log flips to committed, visibility must agree, even if the owning
//! backend has not yet cleared its slot.

use kestrel_common::types::{Timestamp, TransactionId};

use crate::registry::TrackerShared;
use crate::slot::Slot;
use crate::snapshot::HorizonState;

const COMPLETED_CACHE_SIZE: usize = 8;

/// Small per-backend ring of ids recently proven finished; lets repeated
/// probes for the same dead xid skip the lock entirely.
pub(crate) struct CompletedCache {
    entries: [TransactionId; COMPLETED_CACHE_SIZE],
    next: usize,
}

impl CompletedCache {
    pub fn new() -> Self {
        Self {
            entries: [TransactionId::INVALID; COMPLETED_CACHE_SIZE],
            next: 0,
        }
    }

    pub fn contains(&self, xid: TransactionId) -> bool {
        self.entries.contains(&xid)
    }

    pub fn insert(&mut self, xid: TransactionId) {
        if self.contains(xid) {
            return;
        }
        self.entries[self.next] = xid;
        self.next = (self.next + 1) % COMPLETED_CACHE_SIZE;
    }
}

/// Is `xid` (top-level or sub) still running anywhere?
pub(crate) fn is_in_progress(
    shared: &TrackerShared,
    self_slot: &Slot,
    horizons: &HorizonState,
    completed_cache: &mut CompletedCache,
    xid: TransactionId,
    replaying: bool,
) -> bool {
    if !xid.is_normal() {
        // Invalid never ran; the reserved ids finished before time began.
        return false;
    }

    // Tier (a): anything before the recent snapshot's xmin is finished.
    if horizons.recent_xmin.is_valid() && xid.precedes(horizons.recent_xmin) {
        shared.stats.record_visibility_fast_hit();
        return false;
    }

    // Tier (b): recently proven finished.
    if completed_cache.contains(xid) {
        shared.stats.record_visibility_fast_hit();
        return false;
    }

    // Tier (c): the commit log is ground truth the moment it flips,
    // regardless of whether the slot has been cleared yet.
    if shared.commit_log.did_commit(xid) {
        completed_cache.insert(xid);
        shared.stats.record_visibility_fast_hit();
        return false;
    }

    // Tier (d): our own transaction tree.
    if self_slot.xid() == xid || self_slot.subxid_cached(xid) {
        shared.stats.record_visibility_fast_hit();
        return true;
    }

    // Tiers (e)-(g) need the shared lock.
    let mut overflow_candidates: Vec<TransactionId> = Vec::new();
    {
        let core = shared.registry.read();
        if xid.follows(core.latest_completed) {
            // Beyond the watermark: nothing this new can have finished.
            return true;
        }

        shared.stats.record_visibility_slow_scan();
        for &id in &core.occupied {
            let slot = shared.slot(id);
            if slot.id() == self_slot.id() {
                continue;
            }
            let top = slot.xid();
            if !top.is_normal() {
                continue;
            }
            if top == xid {
                return true;
            }
            if slot.subxid_cached(xid) {
                return true;
            }
            if slot.overflowed() {
                overflow_candidates.push(top);
            }
        }

        if replaying && shared.replay.lock().contains(xid) {
            return true;
        }
    }

    // Tier (h): no overflowed caches anywhere means the scan was
    // authoritative.
    if overflow_candidates.is_empty() {
        completed_cache.insert(xid);
        return false;
    }

    // Some cache overflowed: xid may be an uncached subtransaction of one
    // of the candidates. The parent table decides, unless the log already
    // recorded an abort.
    if shared.commit_log.did_abort(xid) {
        completed_cache.insert(xid);
        return false;
    }
    let topmost = shared.subtrans.get_topmost_parent(xid);
    if topmost == xid {
        // No parent recorded: a running top-level would have matched the
        // scan directly.
        completed_cache.insert(xid);
        return false;
    }
    if overflow_candidates.contains(&topmost) {
        return true;
    }
    completed_cache.insert(xid);
    false
}

/// Is `xid` the current top-level transaction of a live backend?
///
/// Narrower than [`is_in_progress`] by design: prepared placeholders and
/// replayed transactions do not own locks, so lock-ownership questions
/// ignore them.
pub(crate) fn is_active(shared: &TrackerShared, xid: TransactionId) -> bool {
    if !xid.is_normal() {
        return false;
    }
    let core = shared.registry.read();
    for &id in &core.occupied {
        let slot = shared.slot(id);
        if slot.pid().is_live() && slot.xid() == xid {
            return true;
        }
    }
    false
}

/// Has a two-phase prepare been durably recorded for `xid`? Returns the
/// prepare timestamp the distributed commit protocol should wait against.
pub(crate) fn prepared_timestamp(
    shared: &TrackerShared,
    self_slot: &Slot,
    horizons: &HorizonState,
    xid: TransactionId,
) -> Option<Timestamp> {
    if !xid.is_normal() {
        return None;
    }
    if horizons.recent_xmin.is_valid() && xid.precedes(horizons.recent_xmin) {
        return None;
    }
    // Our own transaction never waits on itself.
    if self_slot.xid() == xid {
        return None;
    }

    // Resolved placeholder slots are indexed by xid; live backends that
    // prepared without detaching yet are found by scanning.
    if let Some(entry) = shared.prepared_index.get(&xid) {
        let slot = shared.slot(*entry.value());
        let ts = slot.prepare_timestamp();
        if ts.is_set() && slot.xid() == xid {
            return Some(ts);
        }
    }

    let core = shared.registry.read();
    for &id in &core.occupied {
        let slot = shared.slot(id);
        if slot.xid() != xid {
            continue;
        }
        let ts = slot.prepare_timestamp();
        // Guard against the slot being cleared between the two reads.
        if ts.is_set() && slot.xid() == xid {
            return Some(ts);
        }
        return None;
    }
    drop(core);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_cache_ring() {
        let mut cache = CompletedCache::new();
        for i in 0..COMPLETED_CACHE_SIZE as u32 {
            cache.insert(TransactionId(100 + i));
        }
        assert!(cache.contains(TransactionId(100)));
        // One past capacity evicts the oldest entry.
        cache.insert(TransactionId(999));
        assert!(!cache.contains(TransactionId(100)));
        assert!(cache.contains(TransactionId(101)));
        assert!(cache.contains(TransactionId(999)));
    }

    #[test]
    fn test_completed_cache_dedups() {
        let mut cache = CompletedCache::new();
        cache.insert(TransactionId(5));
        cache.insert(TransactionId(5));
        cache.insert(TransactionId(6));
        assert!(cache.contains(TransactionId(5)));
        assert!(cache.contains(TransactionId(6)));
    }
}
