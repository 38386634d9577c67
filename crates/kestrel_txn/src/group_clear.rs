//! Transaction-end clearing, including the group-clear optimization.
//!
//! Ending a transaction that holds an assigned xid must clear the slot's
//! per-transaction fields and advance the latest-completed watermark inside
//! one exclusive-lock critical section; a concurrent snapshot must never
//! see the xid gone from the registry while the watermark still precedes
//! it. Under high commit rates the exclusive lock becomes the bottleneck,
//! so a backend that cannot take it immediately instead pushes itself onto
//! a lock-free pending list and sleeps; whichever backend pushed onto an
//! empty list becomes the leader, performs every queued clear under a
//! single lock acquisition, and wakes the rest. The lock is then taken
//! roughly once per batch of concurrently committing transactions instead
//! of once per transaction.
//!
//! The list links are slot indices, not pointers: a slot index re-pushed
//! after reuse still names the same `Slot`, so the classic compare-and-swap
//! ABA hazard has no harmful interleaving here.

use std::sync::atomic::Ordering;

use kestrel_common::types::TransactionId;

use crate::registry::{RegistryCore, TrackerShared};
use crate::slot::{Slot, NO_SLOT};

/// Clear `slot`'s transaction state, folding `latest_xid` into the
/// watermark. Caller holds the registry's exclusive lock.
fn clear_locked(core: &mut RegistryCore, slot: &Slot, latest_xid: TransactionId) {
    slot.clear_transaction_fields();
    core.advance_latest_completed(latest_xid);
}

/// End the calling backend's transaction.
///
/// With a valid `latest_xid` the clear and the watermark advance happen
/// atomically under the exclusive lock, via the group path when the lock
/// is contended. With an invalid `latest_xid` the transaction never had an
/// id, nobody else's view depends on it, and the fields are reset
/// lock-free.
pub(crate) fn end_transaction(shared: &TrackerShared, slot: &Slot, latest_xid: TransactionId) {
    if latest_xid.is_invalid() {
        debug_assert!(slot.xid().is_invalid());
        slot.clear_transaction_fields();
        return;
    }

    if let Some(mut core) = shared.registry.try_write() {
        clear_locked(&mut core, slot, latest_xid);
        drop(core);
        shared.stats.record_solo_clear();
        return;
    }

    group_clear(shared, slot, latest_xid);
}

/// Contended path: enqueue on the pending-clear list; lead or follow.
fn group_clear(shared: &TrackerShared, slot: &Slot, latest_xid: TransactionId) {
    slot.group_pending_xid.store(latest_xid.0, Ordering::Relaxed);
    // Arm the wakeup flag before publishing ourselves on the list, so the
    // leader cannot signal completion we then overwrite.
    *slot.group_done.lock() = false;

    let my_index = slot.id().0;
    let mut observed_head;
    loop {
        observed_head = shared.group_first.load(Ordering::Acquire);
        slot.group_next.store(observed_head, Ordering::Relaxed);
        if shared
            .group_first
            .compare_exchange_weak(
                observed_head,
                my_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            break;
        }
    }

    if observed_head != NO_SLOT {
        // Follower: someone ahead of us owns the batch. Sleep until the
        // leader has cleared our slot.
        let mut done = slot.group_done.lock();
        while !*done {
            slot.group_wake.wait(&mut done);
        }
        return;
    }

    // Leader: block for the lock on behalf of the whole list.
    let mut core = shared.registry.write();
    // Claim every member that queued up while we waited. Later arrivals
    // start a fresh batch and block on the lock we now hold.
    let head = shared.group_first.swap(NO_SLOT, Ordering::AcqRel);

    let mut members = 0u64;
    let mut wake_list: Vec<u32> = Vec::new();
    let mut index = head;
    while index != NO_SLOT {
        let member = shared.slot(kestrel_common::types::SlotId(index));
        let next = member.group_next.load(Ordering::Relaxed);
        let pending = TransactionId(member.group_pending_xid.load(Ordering::Relaxed));
        clear_locked(&mut core, member, pending);
        member.group_next.store(NO_SLOT, Ordering::Relaxed);
        members += 1;
        if index != my_index {
            wake_list.push(index);
        }
        index = next;
    }
    drop(core);

    shared.stats.record_group_clear(members);
    tracing::debug!("group clear batch of {} member(s)", members);

    for index in wake_list {
        let member = shared.slot(kestrel_common::types::SlotId(index));
        let mut done = member.group_done.lock();
        *done = true;
        member.group_wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kestrel_common::config::TrackerConfig;
    use kestrel_common::types::{SlotId, TransactionId};

    use crate::distributed::SnapshotSource;
    use crate::external::testing::{InMemoryCommitLog, InMemorySubtrans};
    use crate::registry::TrackerShared;

    use super::end_transaction;

    fn shared(max_backends: usize) -> Arc<TrackerShared> {
        TrackerShared::new(
            TrackerConfig {
                max_backends,
                max_prepared: 0,
                ..Default::default()
            },
            Arc::new(InMemoryCommitLog::default()),
            Arc::new(InMemorySubtrans::default()),
            SnapshotSource::Local,
        )
    }

    #[test]
    fn test_solo_end_clears_and_advances() {
        let s = shared(4);
        let slot = s.slot(SlotId(0)).clone();
        slot.set_xid(TransactionId(100));
        s.add_slot(SlotId(0));

        end_transaction(&s, &slot, TransactionId(100));
        assert!(slot.xid().is_invalid());
        assert_eq!(s.latest_completed(), TransactionId(100));
    }

    #[test]
    fn test_end_without_xid_needs_no_lock() {
        let s = shared(4);
        let slot = s.slot(SlotId(0)).clone();
        slot.set_xmin(TransactionId(90));
        s.add_slot(SlotId(0));

        // Hold the write lock across the call: the no-xid path must not
        // touch it.
        let guard = s.registry.write();
        end_transaction(&s, &slot, TransactionId::INVALID);
        assert!(slot.xmin().is_invalid());
        drop(guard);
        assert_eq!(s.latest_completed(), TransactionId::INVALID);
    }

    #[test]
    fn test_concurrent_ends_batch_equivalently() {
        let n = 16;
        let s = shared(n);
        for i in 0..n as u32 {
            let slot = s.slot(SlotId(i));
            slot.set_xid(TransactionId(1000 + i));
            s.add_slot(SlotId(i));
        }

        // A reader parked on the shared lock forces writers onto the
        // group path.
        let blocker = s.registry.read();
        let threads: Vec<_> = (0..n as u32)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || {
                    let slot = s.slot(SlotId(i)).clone();
                    super::end_transaction(&s, &slot, TransactionId(1000 + i));
                })
            })
            .collect();
        // Give the writers a moment to pile onto the pending list.
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(blocker);
        for t in threads {
            t.join().unwrap();
        }

        // Externally equivalent to some serial order of the N clears.
        assert_eq!(s.latest_completed(), TransactionId(1000 + n as u32 - 1));
        for i in 0..n as u32 {
            assert!(s.slot(SlotId(i)).xid().is_invalid());
        }
        let stats = s.stats.snapshot();
        assert_eq!(stats.group_clear_members + stats.solo_clears, n as u64);
    }
}
