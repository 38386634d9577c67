//! Snapshot builder.
//!
//! A snapshot captures, at one instant under the registry's shared lock,
//! which transactions a reader must treat as still in progress. Everything
//! older than `xmin` is finished; everything at or after `xmax` has not
//! started as far as the reader is concerned; ids in between are running
//! exactly when listed (unless the subtransaction info overflowed, in
//! which case the listing is not exhaustive and readers fall back to the
//! parent-table slow path).
//!
//! Snapshot buffers are allocated once per backend and refilled on every
//! call; the fallible work (buffer sizing, distributed-timestamp fetch)
//! happens before the lock is taken, so nothing inside a critical section
//! can fail.

use kestrel_common::error::{KestrelResult, SnapshotError};
use kestrel_common::types::{DatabaseId, Timestamp, TransactionId, VacuumFlags};

use crate::registry::TrackerShared;
use crate::replay::StandbyState;
use crate::slot::Slot;

/// A consistent point-in-time view of the in-progress transaction set.
#[derive(Debug)]
pub struct Snapshot {
    xmin: TransactionId,
    xmax: TransactionId,
    in_progress: Vec<TransactionId>,
    sub_in_progress: Vec<TransactionId>,
    subxid_overflowed: bool,
    /// Prepared distributed transactions seen in the same pass, with their
    /// prepare timestamps.
    prepared: Vec<(TransactionId, Timestamp)>,
    /// Global start timestamp, when a distributed source is configured.
    global_timestamp: Option<Timestamp>,
    /// True when no distributed coordination was involved.
    local_only: bool,
    taken_during_replay: bool,
    active_count: u32,
    registered_count: u32,
    copied: bool,
}

impl Snapshot {
    /// Allocate the reusable buffers for one backend. Sizing failure is a
    /// resource error surfaced to the caller, not a panic.
    pub(crate) fn preallocate(slot_count: usize, subxid_slots: usize) -> KestrelResult<Self> {
        let mut in_progress = Vec::new();
        in_progress
            .try_reserve_exact(slot_count)
            .map_err(|_| SnapshotError::BufferExhausted { needed: slot_count })?;
        let mut sub_in_progress = Vec::new();
        sub_in_progress
            .try_reserve_exact(subxid_slots)
            .map_err(|_| SnapshotError::BufferExhausted {
                needed: subxid_slots,
            })?;
        let mut prepared = Vec::new();
        prepared
            .try_reserve_exact(slot_count)
            .map_err(|_| SnapshotError::BufferExhausted { needed: slot_count })?;
        Ok(Self {
            xmin: TransactionId::INVALID,
            xmax: TransactionId::INVALID,
            in_progress,
            sub_in_progress,
            subxid_overflowed: false,
            prepared,
            global_timestamp: None,
            local_only: true,
            taken_during_replay: false,
            active_count: 0,
            registered_count: 0,
            copied: false,
        })
    }

    pub fn xmin(&self) -> TransactionId {
        self.xmin
    }

    pub fn xmax(&self) -> TransactionId {
        self.xmax
    }

    /// Top-level ids running at snapshot time, sorted.
    pub fn in_progress(&self) -> &[TransactionId] {
        &self.in_progress
    }

    /// Cached subtransaction ids (or, during replay, the whole undivided
    /// running set), sorted. Not exhaustive when [`Self::subxid_overflowed`].
    pub fn sub_in_progress(&self) -> &[TransactionId] {
        &self.sub_in_progress
    }

    pub fn subxid_overflowed(&self) -> bool {
        self.subxid_overflowed
    }

    pub fn prepared(&self) -> &[(TransactionId, Timestamp)] {
        &self.prepared
    }

    pub fn global_timestamp(&self) -> Option<Timestamp> {
        self.global_timestamp
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    pub fn taken_during_replay(&self) -> bool {
        self.taken_during_replay
    }

    /// Whether this snapshot treats `xid` as still running.
    ///
    /// When the subtransaction info overflowed, a miss here is not
    /// conclusive for sub ids — callers combine this with the
    /// parent-table slow path in that case.
    pub fn considers_running(&self, xid: TransactionId) -> bool {
        if !xid.is_normal() || xid.precedes(self.xmin) {
            return false;
        }
        if !xid.precedes(self.xmax) {
            return true;
        }
        sorted_contains(&self.in_progress, xid) || sorted_contains(&self.sub_in_progress, xid)
    }

    // Consumer reference counting. The buffers are reused across
    // `take_snapshot` calls, which is only sound while no consumer still
    // holds the previous fill.
    pub fn register(&mut self) {
        self.registered_count += 1;
    }

    pub fn unregister(&mut self) {
        debug_assert!(self.registered_count > 0);
        self.registered_count -= 1;
    }

    pub fn registered_count(&self) -> u32 {
        self.registered_count
    }

    pub fn activate(&mut self) {
        self.active_count += 1;
    }

    pub fn deactivate(&mut self) {
        debug_assert!(self.active_count > 0);
        self.active_count -= 1;
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn mark_copied(&mut self) {
        self.copied = true;
    }

    pub fn is_copied(&self) -> bool {
        self.copied
    }

    fn reset(&mut self) {
        self.in_progress.clear();
        self.sub_in_progress.clear();
        self.prepared.clear();
        self.subxid_overflowed = false;
        self.global_timestamp = None;
        self.local_only = true;
        self.taken_during_replay = false;
        self.active_count = 0;
        self.registered_count = 0;
        self.copied = false;
    }
}

fn sorted_contains(ids: &[TransactionId], xid: TransactionId) -> bool {
    ids.binary_search_by(|probe| {
        if *probe == xid {
            std::cmp::Ordering::Equal
        } else if probe.precedes(xid) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    })
    .is_ok()
}

fn sort_by_precedes(ids: &mut [TransactionId]) {
    ids.sort_by(|a, b| {
        if a == b {
            std::cmp::Ordering::Equal
        } else if a.precedes(*b) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
}

/// Per-backend horizon bookkeeping refreshed by every snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HorizonState {
    /// xmin of the most recent snapshot; cheap lower bound for
    /// is-in-progress short circuits.
    pub recent_xmin: TransactionId,
    /// Oldest id whose effects may be vacuumed away, process-wide.
    pub recent_global_xmin: TransactionId,
    /// Catalog-only variant, additionally floored for logical decoding.
    pub recent_catalog_xmin: TransactionId,
}

impl HorizonState {
    pub fn new() -> Self {
        Self {
            recent_xmin: TransactionId::INVALID,
            recent_global_xmin: TransactionId::INVALID,
            recent_catalog_xmin: TransactionId::INVALID,
        }
    }
}

/// Subtract `age` ids from a horizon without sliding into the reserved
/// range.
fn retreat_by(xid: TransactionId, age: u32) -> TransactionId {
    if !xid.is_normal() || age == 0 {
        return xid;
    }
    if xid.0 >= TransactionId::FIRST_NORMAL.0.saturating_add(age) {
        TransactionId(xid.0 - age)
    } else {
        TransactionId::FIRST_NORMAL
    }
}

fn older(a: TransactionId, b: TransactionId) -> TransactionId {
    if b.is_normal() && (!a.is_normal() || b.precedes(a)) {
        b
    } else {
        a
    }
}

/// Fill `snap` with a consistent view of the running-transaction set.
pub(crate) fn take_snapshot(
    shared: &TrackerShared,
    self_slot: &Slot,
    snap: &mut Snapshot,
    horizons: &mut HorizonState,
    replaying: bool,
) -> KestrelResult<()> {
    if replaying && shared.standby.lock().state != StandbyState::Ready {
        return Err(SnapshotError::StandbyNotReady.into());
    }

    // All fallible work happens before the lock: the critical section
    // below only writes plain fields and copies into preallocated buffers.
    let global_timestamp = shared.source.start_timestamp()?;

    snap.reset();

    let sub_capacity = snap.sub_in_progress.capacity();
    let core = shared.registry.read();
    let xmax = core.latest_completed.advance();
    let mut xmin = xmax;
    let mut globalxmin = xmax;

    if !replaying {
        for &id in &core.occupied {
            let slot = shared.slot(id);
            let flags = slot.vacuum_flags();
            // Logical-decoding workers keep their own xmin bookkeeping and
            // maintenance workers never hold back cleanup horizons; both
            // stay out of the aggregation entirely.
            if flags.in_logical_decoding() || flags.in_vacuum() {
                continue;
            }

            let slot_xmin = slot.xmin();
            if slot_xmin.is_normal() {
                globalxmin = older(globalxmin, slot_xmin);
            }

            let xid = slot.xid();
            if !xid.is_normal() || !xid.precedes(xmax) {
                continue;
            }
            xmin = older(xmin, xid);
            if slot.id() == self_slot.id() {
                continue;
            }
            snap.in_progress.push(xid);
            if !snap.subxid_overflowed {
                if slot.read_subxids(&mut snap.sub_in_progress) {
                    snap.subxid_overflowed = true;
                }
            }

            let prepare_ts = slot.prepare_timestamp();
            // Re-read the xid after the timestamp: the owner's unlocked
            // end path may have cleared the slot between the two loads.
            if prepare_ts.is_set() && slot.xid() == xid {
                snap.prepared.push((xid, prepare_ts));
            }
        }
    } else {
        let replay = shared.replay.lock();
        let (replay_xmin, overflowed) =
            replay.collect_running(xmax, sub_capacity, &mut snap.sub_in_progress);
        if overflowed {
            snap.subxid_overflowed = true;
        }
        if replay_xmin.is_normal() {
            xmin = older(xmin, replay_xmin);
        }
    }

    // Publish our own xmin while still holding the lock, so exclusive-lock
    // holders computing horizons already see it.
    if self_slot.xmin().is_invalid() {
        self_slot.set_xmin(xmin);
    }
    drop(core);

    globalxmin = older(globalxmin, xmin);
    globalxmin = retreat_by(globalxmin, shared.config.defer_cleanup_age);

    let slot_floor = shared.replication_slot_xmin();
    if slot_floor.is_normal() {
        globalxmin = older(globalxmin, slot_floor);
    }
    let mut catalog_xmin = globalxmin;
    let catalog_floor = shared.replication_slot_catalog_xmin();
    if catalog_floor.is_normal() {
        catalog_xmin = older(catalog_xmin, catalog_floor);
    }

    horizons.recent_xmin = xmin;
    horizons.recent_global_xmin = globalxmin;
    horizons.recent_catalog_xmin = catalog_xmin;

    sort_by_precedes(&mut snap.in_progress);
    sort_by_precedes(&mut snap.sub_in_progress);
    snap.xmin = xmin;
    snap.xmax = xmax;
    snap.global_timestamp = global_timestamp;
    snap.local_only = shared.source.is_local();
    snap.taken_during_replay = replaying;

    shared.stats.record_snapshot();
    Ok(())
}

/// Which backends bound a horizon computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonScope {
    /// Consider every backend.
    AllDatabases,
    /// Consider only backends attached to one database (plus
    /// cross-database workers).
    Database(DatabaseId),
}

/// Compute the oldest id whose effects cleanup must still preserve:
/// nothing at or after the returned id may be vacuumed away. Slots whose
/// vacuum flags intersect `ignore` are left out of the computation.
pub(crate) fn oldest_xmin(
    shared: &TrackerShared,
    scope: HorizonScope,
    ignore: VacuumFlags,
) -> TransactionId {
    let core = shared.registry.read();
    let mut result = core.latest_completed.advance();
    for &id in &core.occupied {
        let slot = shared.slot(id);
        if slot.vacuum_flags().0 & ignore.0 != 0 {
            continue;
        }
        if let HorizonScope::Database(db) = scope {
            let slot_db = slot.database_id();
            if slot_db != db && slot_db != DatabaseId::SHARED {
                continue;
            }
        }
        let xid = slot.xid();
        if xid.is_normal() {
            result = older(result, xid);
        }
        let xmin = slot.xmin();
        if xmin.is_normal() {
            result = older(result, xmin);
        }
    }
    drop(core);

    // During replay the running set lives in the replay arena instead of
    // slots; factor its oldest entry in (it is empty otherwise).
    let replay_oldest = shared.replay.lock().oldest();
    if replay_oldest.is_normal() {
        result = older(result, replay_oldest);
    }

    result = retreat_by(result, shared.config.defer_cleanup_age);
    let slot_floor = shared.replication_slot_xmin();
    if slot_floor.is_normal() {
        result = older(result, slot_floor);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retreat_by_clamps_at_first_normal() {
        assert_eq!(retreat_by(TransactionId(100), 10), TransactionId(90));
        assert_eq!(retreat_by(TransactionId(10), 50), TransactionId::FIRST_NORMAL);
        assert_eq!(retreat_by(TransactionId::INVALID, 50), TransactionId::INVALID);
        assert_eq!(retreat_by(TransactionId(100), 0), TransactionId(100));
    }

    #[test]
    fn test_older_ignores_non_normal() {
        assert_eq!(older(TransactionId(50), TransactionId(40)), TransactionId(40));
        assert_eq!(older(TransactionId(50), TransactionId::INVALID), TransactionId(50));
        assert_eq!(older(TransactionId::INVALID, TransactionId(40)), TransactionId(40));
    }

    #[test]
    fn test_considers_running_bounds() {
        let mut snap = Snapshot::preallocate(4, 8).unwrap();
        snap.xmin = TransactionId(100);
        snap.xmax = TransactionId(110);
        snap.in_progress.push(TransactionId(103));
        snap.sub_in_progress.push(TransactionId(105));

        assert!(!snap.considers_running(TransactionId(99)));
        assert!(snap.considers_running(TransactionId(110)));
        assert!(snap.considers_running(TransactionId(200)));
        assert!(snap.considers_running(TransactionId(103)));
        assert!(snap.considers_running(TransactionId(105)));
        assert!(!snap.considers_running(TransactionId(104)));
        assert!(!snap.considers_running(TransactionId::INVALID));
    }

    #[test]
    fn test_refcounts_reset_on_refill() {
        let mut snap = Snapshot::preallocate(4, 8).unwrap();
        snap.register();
        snap.activate();
        snap.mark_copied();
        assert_eq!(snap.registered_count(), 1);
        snap.reset();
        assert_eq!(snap.registered_count(), 0);
        assert_eq!(snap.active_count(), 0);
        assert!(!snap.is_copied());
    }
}
