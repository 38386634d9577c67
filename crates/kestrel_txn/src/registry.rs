//! Shared tracker state and the process registry.
//!
//! `TrackerShared` is the one allocation every backend handle points at:
//! the slot pool, the registry of occupied slots behind a reader/writer
//! lock, the replay set, and the global watermark counters. It is passed
//! around explicitly (behind `Arc`) so tests can run any number of
//! independent tracker instances in one process.
//!
//! Locking discipline: the registry lock is held exclusive for slot
//! add/remove and for clearing an assigned xid, shared for the full-array
//! scans that snapshot building and visibility queries perform. The
//! watermark (`latest_completed`) lives inside the same lock so that no
//! reader can ever observe a slot's absence without also observing the
//! watermark advance that replaced it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use kestrel_common::config::TrackerConfig;
use kestrel_common::types::{DatabaseId, SlotId, TransactionId};

use crate::distributed::SnapshotSource;
use crate::external::{CommitLog, SubtransTable};
use crate::replay::{ReplaySet, StandbyMachine};
use crate::slot::{Slot, NO_SLOT};
use crate::stats::TrackerStats;

/// Registry state guarded by the reader/writer lock.
pub(crate) struct RegistryCore {
    /// Occupied slot ids, kept sorted for cache-friendly scans.
    pub occupied: Vec<SlotId>,
    /// Highest transaction id known to have finished. Snapshot xmax is
    /// derived from this; it only ever advances.
    pub latest_completed: TransactionId,
}

impl RegistryCore {
    /// Fold a finished transaction's id into the watermark.
    pub fn advance_latest_completed(&mut self, xid: TransactionId) {
        if xid.is_normal() {
            self.latest_completed = self.latest_completed.newer(xid);
        }
    }
}

/// Counts returned by [`TrackerShared::count_other_db_backends`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCounts {
    /// Live backends connected to the database.
    pub backends: usize,
    /// Prepared-transaction placeholder slots pinned to the database.
    pub prepared: usize,
}

impl BackendCounts {
    pub fn is_empty(&self) -> bool {
        self.backends == 0 && self.prepared == 0
    }
}

pub(crate) struct TrackerShared {
    pub config: TrackerConfig,
    /// Fixed slot pool, sized `max_backends + max_prepared` at startup.
    pub slots: Box<[Arc<Slot>]>,
    pub registry: RwLock<RegistryCore>,
    /// Unoccupied slot ids available for attach.
    pub freelist: Mutex<Vec<SlotId>>,
    /// Head of the lock-free pending-clear list (slot index, `NO_SLOT` =
    /// empty). Lives outside the registry lock by construction.
    pub group_first: AtomicU32,
    pub replay: Mutex<ReplaySet>,
    pub standby: Mutex<StandbyMachine>,
    /// xid → slot for in-doubt two-phase transactions. Used to shield them
    /// from replay-set pruning and to resolve them by id.
    pub prepared_index: DashMap<TransactionId, SlotId>,
    /// Cleanup floor imposed by replication slots (0 = none).
    pub repl_slot_xmin: AtomicU32,
    /// Catalog-only floor for logical-decoding consumers (0 = none).
    pub repl_slot_catalog_xmin: AtomicU32,
    pub commit_log: Arc<dyn CommitLog>,
    pub subtrans: Arc<dyn SubtransTable>,
    pub source: SnapshotSource,
    pub stats: TrackerStats,
}

impl TrackerShared {
    pub fn new(
        config: TrackerConfig,
        commit_log: Arc<dyn CommitLog>,
        subtrans: Arc<dyn SubtransTable>,
        source: SnapshotSource,
    ) -> Arc<Self> {
        let pool_size = config.max_backends + config.max_prepared;
        let slots: Box<[Arc<Slot>]> = (0..pool_size)
            .map(|i| Arc::new(Slot::new(SlotId(i as u32))))
            .collect();
        // Hand slots out lowest-id first.
        let freelist: Vec<SlotId> = (0..pool_size as u32).rev().map(SlotId).collect();
        let replay = ReplaySet::new(
            config.max_backends,
            &config.replay,
        );
        Arc::new(Self {
            slots,
            registry: RwLock::new(RegistryCore {
                occupied: Vec::with_capacity(pool_size),
                latest_completed: TransactionId::INVALID,
            }),
            freelist: Mutex::new(freelist),
            group_first: AtomicU32::new(NO_SLOT),
            replay: Mutex::new(replay),
            standby: Mutex::new(StandbyMachine::new()),
            prepared_index: DashMap::new(),
            repl_slot_xmin: AtomicU32::new(0),
            repl_slot_catalog_xmin: AtomicU32::new(0),
            commit_log,
            subtrans,
            source,
            stats: TrackerStats::new(),
            config,
        })
    }

    pub fn slot(&self, id: SlotId) -> &Arc<Slot> {
        &self.slots[id.0 as usize]
    }

    pub fn acquire_free_slot(&self) -> Option<SlotId> {
        self.freelist.lock().pop()
    }

    pub fn release_slot(&self, id: SlotId) {
        self.freelist.lock().push(id);
    }

    /// Publish a slot in the registry, in sorted position.
    ///
    /// Panics when the registry is full: the pool is sized from
    /// `max_backends + max_prepared` at startup, so running out means the
    /// installation allows more connections than it was sized for.
    pub fn add_slot(&self, id: SlotId) {
        let mut core = self.registry.write();
        if core.occupied.len() == self.slots.len() {
            panic!(
                "process registry full ({} slots); max_backends/max_prepared undersized",
                self.slots.len()
            );
        }
        match core.occupied.binary_search(&id) {
            Ok(_) => panic!("{} already present in process registry", id),
            Err(pos) => core.occupied.insert(pos, id),
        }
        tracing::debug!("registry add {} ({} occupied)", id, core.occupied.len());
    }

    /// Remove a slot, folding `latest_xid` into the watermark in the same
    /// critical section. When `latest_xid` is invalid the slot must not be
    /// carrying an assigned xid — otherwise the transaction would vanish
    /// without the watermark accounting for it.
    pub fn remove_slot(&self, id: SlotId, latest_xid: TransactionId) {
        let mut core = self.registry.write();
        if latest_xid.is_valid() {
            core.advance_latest_completed(latest_xid);
        } else {
            debug_assert!(
                self.slot(id).xid().is_invalid(),
                "removing {} with live xid but no watermark advance",
                id
            );
        }
        if let Ok(pos) = core.occupied.binary_search(&id) {
            core.occupied.remove(pos);
        } else {
            tracing::error!("registry remove: {} not present", id);
        }
        tracing::debug!("registry remove {} ({} occupied)", id, core.occupied.len());
    }

    /// Shared-lock iteration over occupied slots, for read-only queries.
    pub fn for_each_slot<F: FnMut(&Slot)>(&self, mut f: F) {
        let core = self.registry.read();
        for &id in &core.occupied {
            f(self.slot(id));
        }
    }

    pub fn latest_completed(&self) -> TransactionId {
        self.registry.read().latest_completed
    }

    pub fn replication_slot_xmin(&self) -> TransactionId {
        TransactionId(self.repl_slot_xmin.load(Ordering::Acquire))
    }

    pub fn replication_slot_catalog_xmin(&self) -> TransactionId {
        TransactionId(self.repl_slot_catalog_xmin.load(Ordering::Acquire))
    }

    pub fn set_replication_slot_floors(&self, xmin: TransactionId, catalog_xmin: TransactionId) {
        self.repl_slot_xmin.store(xmin.0, Ordering::Release);
        self.repl_slot_catalog_xmin
            .store(catalog_xmin.0, Ordering::Release);
    }

    /// Count live backends and prepared placeholders attached to
    /// `database`, excluding `self_slot`. Retries on a fixed cadence while
    /// any remain, so a caller dropping the database can wait for them to
    /// voluntarily exit. Returns the counts from the last attempt.
    pub fn count_other_db_backends(
        &self,
        database: DatabaseId,
        self_slot: Option<SlotId>,
    ) -> BackendCounts {
        let attempts = self.config.backend_wait.attempts.max(1);
        let delay = Duration::from_millis(self.config.backend_wait.delay_ms);
        let mut counts = BackendCounts {
            backends: 0,
            prepared: 0,
        };
        for attempt in 0..attempts {
            counts = BackendCounts {
                backends: 0,
                prepared: 0,
            };
            self.for_each_slot(|slot| {
                if Some(slot.id()) == self_slot || slot.database_id() != database {
                    return;
                }
                if slot.pid().is_live() {
                    counts.backends += 1;
                } else {
                    counts.prepared += 1;
                }
            });
            if counts.is_empty() {
                return counts;
            }
            if attempt + 1 < attempts {
                std::thread::sleep(delay);
            }
        }
        tracing::warn!(
            "{} still has {} backend(s) and {} prepared transaction(s) after {} checks",
            database,
            counts.backends,
            counts.prepared,
            attempts
        );
        counts
    }

    /// Cross-check used by monitoring: every live xid/xmin must be at or
    /// after a horizon the coordination layer claims is safe. A violation
    /// means cleanup may already have destroyed data some transaction can
    /// still see, which cannot be locally repaired.
    pub fn verify_horizon_invariant(&self, horizon: TransactionId) {
        if !horizon.is_normal() {
            return;
        }
        self.for_each_slot(|slot| {
            let xid = slot.xid();
            if xid.is_normal() && xid.precedes(horizon) {
                panic!(
                    "horizon invariant violated: {} carries {} preceding safe horizon {}",
                    slot.id(),
                    xid,
                    horizon
                );
            }
            let xmin = slot.xmin();
            if xmin.is_normal() && xmin.precedes(horizon) {
                panic!(
                    "horizon invariant violated: {} holds xmin {} preceding safe horizon {}",
                    slot.id(),
                    xmin,
                    horizon
                );
            }
        });
    }
}
