//! Per-backend transaction slot.
//!
//! One `Slot` exists per potential backend (plus a reserve for prepared
//! transactions), allocated once at startup and recycled through a free
//! list. Fields are atomics: the owning backend writes them on its own
//! fast paths, while snapshot takers read them under the registry's shared
//! lock. Mutations that other backends' correctness depends on (ending a
//! transaction with an assigned xid, removing cached subtransactions) go
//! through the registry's exclusive lock instead; see `group_clear`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use kestrel_common::types::{DatabaseId, ProcessId, SlotId, Timestamp, TransactionId, VacuumFlags};

/// Capacity of the inline subtransaction cache.
///
/// Deliberately a small compile-time constant: when a transaction creates
/// more subtransactions than fit here, the slot's overflow flag sticks and
/// visibility queries fall back to the subtransaction-parent table. The
/// bounded cache is the design; it must not grow.
pub const SUBXID_CACHE_SIZE: usize = 64;

/// Sentinel for "no slot" in the group-clear linked list (index-based
/// links avoid the ABA hazard of tagged pointers).
pub(crate) const NO_SLOT: u32 = u32::MAX;

pub struct Slot {
    id: SlotId,
    pid: AtomicU32,
    database_id: AtomicU32,
    xid: AtomicU32,
    xmin: AtomicU32,
    subxids: [AtomicU32; SUBXID_CACHE_SIZE],
    subxid_count: AtomicUsize,
    overflowed: AtomicBool,
    vacuum_flags: AtomicU8,
    delay_checkpoint: AtomicBool,

    // Distributed-transaction extension.
    global_xid_label: Mutex<Option<String>>,
    prepare_timestamp: AtomicU64,
    commit_timestamp: AtomicU64,

    // Group-clear linkage. `group_next` is the slot index of the next
    // pending member, `group_pending_xid` the latest-completed xid this
    // member wants folded into the watermark.
    pub(crate) group_next: AtomicU32,
    pub(crate) group_pending_xid: AtomicU32,
    pub(crate) group_done: Mutex<bool>,
    pub(crate) group_wake: Condvar,
}

impl Slot {
    pub(crate) fn new(id: SlotId) -> Self {
        Self {
            id,
            pid: AtomicU32::new(0),
            database_id: AtomicU32::new(0),
            xid: AtomicU32::new(0),
            xmin: AtomicU32::new(0),
            subxids: std::array::from_fn(|_| AtomicU32::new(0)),
            subxid_count: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
            vacuum_flags: AtomicU8::new(0),
            delay_checkpoint: AtomicBool::new(false),
            global_xid_label: Mutex::new(None),
            prepare_timestamp: AtomicU64::new(0),
            commit_timestamp: AtomicU64::new(0),
            group_next: AtomicU32::new(NO_SLOT),
            group_pending_xid: AtomicU32::new(0),
            group_done: Mutex::new(false),
            group_wake: Condvar::new(),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn pid(&self) -> ProcessId {
        ProcessId(self.pid.load(Ordering::Acquire))
    }

    pub fn database_id(&self) -> DatabaseId {
        DatabaseId(self.database_id.load(Ordering::Acquire))
    }

    /// Bind this slot to a backend (or to no process for a prepared
    /// placeholder). Called before the slot is published in the registry.
    pub(crate) fn attach(&self, pid: ProcessId, database: DatabaseId) {
        self.pid.store(pid.0, Ordering::Release);
        self.database_id.store(database.0, Ordering::Release);
    }

    pub fn xid(&self) -> TransactionId {
        TransactionId(self.xid.load(Ordering::Acquire))
    }

    /// Publish the top-level xid. Owner-only.
    pub(crate) fn set_xid(&self, xid: TransactionId) {
        self.xid.store(xid.0, Ordering::Release);
    }

    pub fn xmin(&self) -> TransactionId {
        TransactionId(self.xmin.load(Ordering::Acquire))
    }

    pub(crate) fn set_xmin(&self, xmin: TransactionId) {
        self.xmin.store(xmin.0, Ordering::Release);
    }

    pub fn vacuum_flags(&self) -> VacuumFlags {
        VacuumFlags(self.vacuum_flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_vacuum_flags(&self, flags: VacuumFlags) {
        self.vacuum_flags.store(flags.0, Ordering::Release);
    }

    pub fn delay_checkpoint(&self) -> bool {
        self.delay_checkpoint.load(Ordering::Acquire)
    }

    /// Marks the owner as inside a commit-critical section that a
    /// checkpoint must not interrupt.
    pub(crate) fn set_delay_checkpoint(&self, delay: bool) {
        self.delay_checkpoint.store(delay, Ordering::Release);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn subxid_count(&self) -> usize {
        self.subxid_count.load(Ordering::Acquire)
    }

    /// Append a subtransaction id to the inline cache. Owner-only.
    ///
    /// Returns false once the cache has overflowed; the flag sticks until
    /// the top-level transaction ends and queries use the slow path.
    pub(crate) fn cache_subxid(&self, subxid: TransactionId) -> bool {
        debug_assert!(subxid.is_normal());
        if self.overflowed.load(Ordering::Relaxed) {
            return false;
        }
        let count = self.subxid_count.load(Ordering::Relaxed);
        if count == SUBXID_CACHE_SIZE {
            self.overflowed.store(true, Ordering::Release);
            return false;
        }
        self.subxids[count].store(subxid.0, Ordering::Relaxed);
        // Publish the entry before the count that makes it visible.
        self.subxid_count.store(count + 1, Ordering::Release);
        true
    }

    /// Remove aborted subtransaction ids from the cache. Caller holds the
    /// registry's exclusive lock.
    ///
    /// A missing id is expected after the cache overflowed (the id never
    /// made it in); otherwise it indicates the caller and the cache have
    /// diverged.
    pub(crate) fn uncache_subxids(&self, subxids: &[TransactionId]) {
        for &sub in subxids {
            let count = self.subxid_count.load(Ordering::Relaxed);
            let mut found = false;
            for i in 0..count {
                if self.subxids[i].load(Ordering::Relaxed) == sub.0 {
                    let last = self.subxids[count - 1].load(Ordering::Relaxed);
                    self.subxids[i].store(last, Ordering::Relaxed);
                    self.subxid_count.store(count - 1, Ordering::Release);
                    found = true;
                    break;
                }
            }
            if !found {
                if self.overflowed.load(Ordering::Relaxed) {
                    tracing::trace!("subxid {} not cached in {} (cache overflowed)", sub, self.id);
                } else {
                    tracing::warn!("subxid {} missing from non-overflowed cache in {}", sub, self.id);
                }
            }
        }
    }

    /// Copy the current subtransaction cache into `out`, returning whether
    /// the cache had overflowed (in which case the copy is not exhaustive).
    pub(crate) fn read_subxids(&self, out: &mut Vec<TransactionId>) -> bool {
        let count = self.subxid_count.load(Ordering::Acquire);
        for i in 0..count {
            out.push(TransactionId(self.subxids[i].load(Ordering::Relaxed)));
        }
        self.overflowed()
    }

    /// True if `subxid` is present in the inline cache.
    pub(crate) fn subxid_cached(&self, subxid: TransactionId) -> bool {
        let count = self.subxid_count.load(Ordering::Acquire);
        (0..count).any(|i| self.subxids[i].load(Ordering::Relaxed) == subxid.0)
    }

    /// Reset every per-transaction field. The caller decides the locking
    /// discipline: exclusive registry lock when an assigned xid's
    /// disappearance must be atomic with the watermark advance, lock-free
    /// when the transaction never had an xid.
    pub(crate) fn clear_transaction_fields(&self) {
        self.xid.store(0, Ordering::Release);
        self.xmin.store(0, Ordering::Release);
        self.subxid_count.store(0, Ordering::Release);
        self.overflowed.store(false, Ordering::Release);
        self.vacuum_flags.store(0, Ordering::Release);
        self.delay_checkpoint.store(false, Ordering::Release);
        self.prepare_timestamp.store(0, Ordering::Release);
        self.commit_timestamp.store(0, Ordering::Release);
        *self.global_xid_label.lock() = None;
    }

    /// Load this slot with the transaction state of `source`, turning it
    /// into a prepared-transaction placeholder. Caller holds the
    /// registry's exclusive lock and has already attached the slot with
    /// `pid == 0`.
    pub(crate) fn copy_prepared_from(&self, source: &Slot) {
        self.xid.store(source.xid.load(Ordering::Acquire), Ordering::Release);
        let count = source.subxid_count.load(Ordering::Acquire);
        for i in 0..count {
            self.subxids[i].store(source.subxids[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.subxid_count.store(count, Ordering::Release);
        self.overflowed
            .store(source.overflowed.load(Ordering::Acquire), Ordering::Release);
        self.prepare_timestamp.store(
            source.prepare_timestamp.load(Ordering::Acquire),
            Ordering::Release,
        );
        *self.global_xid_label.lock() = source.global_xid_label.lock().clone();
    }

    pub fn prepare_timestamp(&self) -> Timestamp {
        Timestamp(self.prepare_timestamp.load(Ordering::Acquire))
    }

    /// Record that a two-phase prepare for this slot's transaction has been
    /// durably logged.
    pub(crate) fn set_prepare_timestamp(&self, ts: Timestamp) {
        self.prepare_timestamp.store(ts.0, Ordering::Release);
    }

    pub fn commit_timestamp(&self) -> Timestamp {
        Timestamp(self.commit_timestamp.load(Ordering::Acquire))
    }

    pub(crate) fn set_commit_timestamp(&self, ts: Timestamp) {
        self.commit_timestamp.store(ts.0, Ordering::Release);
    }

    pub fn global_xid_label(&self) -> Option<String> {
        self.global_xid_label.lock().clone()
    }

    pub(crate) fn set_global_xid_label(&self, label: Option<String>) {
        *self.global_xid_label.lock() = label;
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("xid", &self.xid())
            .field("xmin", &self.xmin())
            .field("subxid_count", &self.subxid_count())
            .field("overflowed", &self.overflowed())
            .finish()
    }
}
