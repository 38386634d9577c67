//! Public tracker surface: the shared [`Tracker`] and the per-backend
//! [`BackendHandle`].
//!
//! A `Tracker` is one independent visibility domain; everything it owns
//! hangs off one shared allocation, so tests (and embedded uses) can run
//! several side by side. Each connected backend holds a `BackendHandle`,
//! which pins one registry slot from attach to disconnect and carries the
//! backend-local state the algorithms need: the reusable snapshot buffer,
//! the recent-xmin latch, and the known-completed probe cache.

use std::sync::Arc;

use kestrel_common::config::TrackerConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{
    DatabaseId, ProcessId, SlotId, Timestamp, TransactionId, VacuumFlags,
};

use crate::distributed::SnapshotSource;
use crate::external::{CommitLog, SubtransTable};
use crate::group_clear;
use crate::registry::{BackendCounts, TrackerShared};
use crate::replay::{self, RunningTransactions, StandbyState};
use crate::slot::{Slot, SUBXID_CACHE_SIZE};
use crate::snapshot::{self, HorizonScope, HorizonState, Snapshot};
use crate::stats::TrackerStatsSnapshot;
use crate::visibility::{self, CompletedCache};

/// Shared transaction-visibility tracker.
pub struct Tracker {
    shared: Arc<TrackerShared>,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        commit_log: Arc<dyn CommitLog>,
        subtrans: Arc<dyn SubtransTable>,
        source: SnapshotSource,
    ) -> KestrelResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: TrackerShared::new(config, commit_log, subtrans, source),
        })
    }

    /// Attach a backend: reserve a slot, publish it in the registry, and
    /// hand out the handle that owns the registration.
    ///
    /// Panics when the slot pool is exhausted — the pool is sized from
    /// `max_backends` at startup, so exhaustion means the connection limit
    /// and the tracker sizing disagree. Failure to allocate the snapshot
    /// workspace, by contrast, is an ordinary resource error.
    pub fn register_backend(
        &self,
        pid: ProcessId,
        database: DatabaseId,
    ) -> KestrelResult<BackendHandle> {
        // Allocate the fallible workspace before touching shared state.
        let subxid_slots = self.shared.config.max_backends * (SUBXID_CACHE_SIZE + 1)
            + self.shared.config.replay.slack_entries;
        let snapshot = Snapshot::preallocate(self.shared.slots.len(), subxid_slots)?;

        let id = self.shared.acquire_free_slot().unwrap_or_else(|| {
            panic!(
                "slot pool exhausted ({} slots); max_backends undersized",
                self.shared.slots.len()
            )
        });
        let slot = self.shared.slot(id).clone();
        slot.attach(pid, database);
        self.shared.add_slot(id);
        tracing::debug!("backend {} attached as {}", pid, id);
        Ok(BackendHandle {
            shared: self.shared.clone(),
            slot,
            snapshot,
            horizons: HorizonState::new(),
            completed_cache: CompletedCache::new(),
        })
    }

    /// Re-register an in-doubt two-phase transaction that has no live
    /// backend, e.g. when recovery finds prepared state on disk. The
    /// placeholder slot keeps the transaction visible as in progress until
    /// [`Tracker::remove_prepared`] resolves it.
    pub fn register_prepared(
        &self,
        xid: TransactionId,
        database: DatabaseId,
        label: &str,
        prepare_ts: Timestamp,
        subxids: &[TransactionId],
    ) -> KestrelResult<()> {
        debug_assert!(xid.is_normal());
        if self.shared.prepared_index.len() >= self.shared.config.max_prepared {
            return Err(KestrelError::PreparedLimit(self.shared.config.max_prepared));
        }
        let id = self
            .shared
            .acquire_free_slot()
            .ok_or(KestrelError::PreparedLimit(self.shared.config.max_prepared))?;
        let slot = self.shared.slot(id).clone();
        slot.attach(ProcessId::NONE, database);
        slot.set_xid(xid);
        for &sub in subxids {
            slot.cache_subxid(sub);
        }
        slot.set_global_xid_label(Some(label.to_owned()));
        slot.set_prepare_timestamp(prepare_ts);
        self.shared.add_slot(id);
        self.shared.prepared_index.insert(xid, id);
        tracing::debug!("prepared {} recovered into {}", xid, id);
        Ok(())
    }

    /// Resolve a prepared transaction: advance the watermark past its id
    /// and retire its placeholder slot, atomically.
    ///
    /// `commit_timestamp` is recorded for a committing resolution so that
    /// concurrent distributed readers observing the placeholder in its
    /// final moments see when it committed.
    pub fn remove_prepared(&self, xid: TransactionId, commit_timestamp: Option<Timestamp>) {
        let Some((_, id)) = self.shared.prepared_index.remove(&xid) else {
            tracing::warn!("remove_prepared: {} has no placeholder slot", xid);
            return;
        };
        let slot = self.shared.slot(id).clone();
        if let Some(ts) = commit_timestamp {
            slot.set_commit_timestamp(ts);
        }
        self.shared.remove_slot(id, xid);
        slot.clear_transaction_fields();
        slot.attach(ProcessId::NONE, DatabaseId::SHARED);
        self.shared.release_slot(id);
        tracing::debug!("prepared {} resolved, {} released", xid, id);
    }

    /// Seed the latest-completed watermark from the id authority's
    /// next-to-assign id, at startup or when recovery begins. Never moves
    /// the watermark backwards.
    pub fn initialize_watermark(&self, next_xid: TransactionId) {
        if !next_xid.is_normal() {
            return;
        }
        let mut core = self.shared.registry.write();
        core.advance_latest_completed(next_xid.retreat());
    }

    /// Top-level-of-a-live-backend check, for lock-ownership questions.
    pub fn is_active(&self, xid: TransactionId) -> bool {
        visibility::is_active(&self.shared, xid)
    }

    pub fn latest_completed(&self) -> TransactionId {
        self.shared.latest_completed()
    }

    /// Oldest id whose effects maintenance must preserve. `ignore` names
    /// the worker classes whose slots do not bound the horizon (vacuum
    /// scheduling typically passes both flags).
    pub fn oldest_xmin(&self, scope: HorizonScope, ignore: VacuumFlags) -> TransactionId {
        snapshot::oldest_xmin(&self.shared, scope, ignore)
    }

    /// Slots currently inside a commit-critical section that a checkpoint
    /// must wait out.
    pub fn backends_delaying_checkpoint(&self) -> Vec<SlotId> {
        let mut delaying = Vec::new();
        self.shared.for_each_slot(|slot| {
            if slot.delay_checkpoint() {
                delaying.push(slot.id());
            }
        });
        delaying
    }

    pub fn set_replication_slot_floors(&self, xmin: TransactionId, catalog_xmin: TransactionId) {
        self.shared.set_replication_slot_floors(xmin, catalog_xmin);
    }

    pub fn count_other_db_backends(&self, database: DatabaseId) -> BackendCounts {
        self.shared.count_other_db_backends(database, None)
    }

    /// Panics if any live xid/xmin precedes `horizon`. See
    /// `TrackerShared::verify_horizon_invariant`.
    pub fn verify_horizon_invariant(&self, horizon: TransactionId) {
        self.shared.verify_horizon_invariant(horizon);
    }

    pub fn stats_snapshot(&self) -> TrackerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    // ── Hot-standby replay entry points ──────────────────────────────────

    pub fn standby_state(&self) -> StandbyState {
        self.shared.standby.lock().state
    }

    /// Feed a periodic running-transactions record from the primary.
    pub fn apply_recovery_info(&self, running: &RunningTransactions) {
        replay::apply_recovery_info(&self.shared, running);
    }

    /// Note an id observed in the replay stream (gap-filling add).
    pub fn record_assigned(&self, xid: TransactionId) {
        replay::record_assigned(&self.shared, xid);
    }

    /// Apply a subtransaction-assignment record.
    pub fn record_assignment_batch(&self, top: TransactionId, subxids: &[TransactionId]) {
        replay::apply_assignment(&self.shared, top, subxids);
    }

    /// Apply a commit/abort record for a whole transaction tree.
    pub fn apply_completion_tree(
        &self,
        top: TransactionId,
        subxids: &[TransactionId],
        latest_xid: TransactionId,
    ) {
        replay::apply_completion_tree(&self.shared, top, subxids, latest_xid);
    }

    /// Prune replay entries the primary has finished with.
    pub fn expire_old(&self, horizon: TransactionId) {
        replay::expire_old(&self.shared, horizon);
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("slots", &self.shared.slots.len())
            .field("latest_completed", &self.latest_completed())
            .finish()
    }
}

/// One backend's registration in the tracker. Dropping it detaches the
/// backend, aborting any transaction still in flight.
pub struct BackendHandle {
    shared: Arc<TrackerShared>,
    slot: Arc<Slot>,
    snapshot: Snapshot,
    horizons: HorizonState,
    completed_cache: CompletedCache,
}

impl BackendHandle {
    pub fn slot_id(&self) -> SlotId {
        self.slot.id()
    }

    pub fn current_xid(&self) -> TransactionId {
        self.slot.xid()
    }

    pub fn slot_xmin(&self) -> TransactionId {
        self.slot.xmin()
    }

    /// Publish the id the generation authority assigned to this backend's
    /// transaction.
    pub fn assign_xid(&self, xid: TransactionId) {
        debug_assert!(xid.is_normal());
        debug_assert!(self.slot.xid().is_invalid(), "xid already assigned");
        self.slot.set_xid(xid);
    }

    /// Record a newly assigned subtransaction: parent linkage first, then
    /// the inline cache (which flips the sticky overflow flag when full).
    pub fn assign_subxid(&self, subxid: TransactionId) {
        let top = self.slot.xid();
        debug_assert!(top.is_normal(), "subtransaction without a top-level xid");
        self.shared.subtrans.set_parent(subxid, top);
        self.slot.cache_subxid(subxid);
    }

    /// Abort some of this backend's subtransactions: their ids leave the
    /// cache and the watermark advances past them, in one critical
    /// section.
    pub fn abort_subxids(&self, subxids: &[TransactionId], latest_xid: TransactionId) {
        let mut core = self.shared.registry.write();
        self.slot.uncache_subxids(subxids);
        core.advance_latest_completed(latest_xid);
    }

    /// End the current transaction (commit or abort). `latest_xid` is the
    /// newest id in the ended tree, invalid when the transaction never
    /// acquired one.
    pub fn end_transaction(&self, latest_xid: TransactionId) {
        group_clear::end_transaction(&self.shared, &self.slot, latest_xid);
    }

    pub fn set_vacuum_flags(&self, flags: VacuumFlags) {
        self.slot.set_vacuum_flags(flags);
    }

    pub fn set_delay_checkpoint(&self, delay: bool) {
        self.slot.set_delay_checkpoint(delay);
    }

    /// Record a durably-logged two-phase prepare on the live slot.
    pub fn mark_prepared(&self, label: &str, prepare_ts: Timestamp) {
        self.slot.set_global_xid_label(Some(label.to_owned()));
        self.slot.set_prepare_timestamp(prepare_ts);
    }

    /// Detach the prepared transaction from this backend: its state moves
    /// to a pid-less placeholder slot and this backend's slot is cleared,
    /// all under one exclusive-lock critical section so the transaction
    /// never appears absent (and the watermark deliberately does not
    /// advance — the transaction is still in progress, just disembodied).
    pub fn clear_for_prepared(&self) -> KestrelResult<()> {
        let xid = self.slot.xid();
        debug_assert!(xid.is_normal(), "clear_for_prepared without a transaction");

        if self.shared.prepared_index.len() >= self.shared.config.max_prepared {
            return Err(KestrelError::PreparedLimit(self.shared.config.max_prepared));
        }
        let placeholder_id = self
            .shared
            .acquire_free_slot()
            .ok_or(KestrelError::PreparedLimit(self.shared.config.max_prepared))?;
        let placeholder = self.shared.slot(placeholder_id).clone();
        placeholder.attach(ProcessId::NONE, self.slot.database_id());

        {
            let mut core = self.shared.registry.write();
            if core.occupied.len() == self.shared.slots.len() {
                drop(core);
                self.shared.release_slot(placeholder_id);
                return Err(KestrelError::PreparedLimit(self.shared.config.max_prepared));
            }
            placeholder.copy_prepared_from(&self.slot);
            match core.occupied.binary_search(&placeholder_id) {
                Ok(_) => unreachable!("free slot already occupied"),
                Err(pos) => core.occupied.insert(pos, placeholder_id),
            }
            self.slot.clear_transaction_fields();
        }
        self.shared.prepared_index.insert(xid, placeholder_id);
        tracing::debug!("prepared {} parked in {}", xid, placeholder_id);
        Ok(())
    }

    /// Compute a fresh snapshot into this backend's reusable buffer.
    pub fn take_snapshot(&mut self, replaying: bool) -> KestrelResult<&Snapshot> {
        snapshot::take_snapshot(
            &self.shared,
            &self.slot,
            &mut self.snapshot,
            &mut self.horizons,
            replaying,
        )?;
        Ok(&self.snapshot)
    }

    /// The last snapshot taken, for consumers that registered it.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }

    /// Tiered in-progress check; see the module docs of `visibility`.
    pub fn is_in_progress(&mut self, xid: TransactionId) -> bool {
        let replaying = self.shared.standby.lock().state != StandbyState::Uninitialized;
        visibility::is_in_progress(
            &self.shared,
            &self.slot,
            &self.horizons,
            &mut self.completed_cache,
            xid,
            replaying,
        )
    }

    /// Prepare-timestamp lookup for the distributed commit protocol.
    pub fn prepared_timestamp_of(&self, xid: TransactionId) -> Option<Timestamp> {
        visibility::prepared_timestamp(&self.shared, &self.slot, &self.horizons, xid)
    }

    pub fn recent_xmin(&self) -> TransactionId {
        self.horizons.recent_xmin
    }

    pub fn recent_global_xmin(&self) -> TransactionId {
        self.horizons.recent_global_xmin
    }

    pub fn recent_catalog_xmin(&self) -> TransactionId {
        self.horizons.recent_catalog_xmin
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        // Disconnect. A transaction still in flight counts as aborted; its
        // id must flow into the watermark as the slot leaves the registry.
        let xid = self.slot.xid();
        let id = self.slot.id();
        self.shared.remove_slot(id, xid);
        self.slot.clear_transaction_fields();
        self.shared.release_slot(id);
        tracing::debug!("backend detached from {}", id);
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("slot", &self.slot)
            .finish()
    }
}
