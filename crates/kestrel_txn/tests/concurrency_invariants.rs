//! Concurrency & replay invariant suite.
//!
//! Exercises the tracker under real thread contention and long replay
//! streams:
//! - SNAP-1: snapshot containment — in-progress ids lie in [xmin, xmax)
//!   and are sorted
//! - SNAP-2: monotonic watermark — xmax never retreats across snapshots
//! - SNAP-3: no phantom gap — a transaction fully ended before a snapshot
//!   began is never reported running
//! - GRP-1: group-clear equivalence — N concurrent ends leave the same
//!   final state as some serial order
//! - RPL-1: replay sortedness and exact tree expiry over a long stream

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use kestrel_common::config::TrackerConfig;
use kestrel_common::types::{DatabaseId, ProcessId, TransactionId};
use kestrel_txn::external::testing::{InMemoryCommitLog, InMemorySubtrans};
use kestrel_txn::{RunningTransactions, SnapshotSource, Tracker};

fn tracker(max_backends: usize) -> (Arc<InMemoryCommitLog>, Arc<Tracker>) {
    let clog = Arc::new(InMemoryCommitLog::default());
    let tracker = Tracker::new(
        TrackerConfig {
            max_backends,
            max_prepared: 4,
            ..Default::default()
        },
        clog.clone(),
        Arc::new(InMemorySubtrans::default()),
        SnapshotSource::Local,
    )
    .unwrap();
    tracker.initialize_watermark(TransactionId(1000));
    (clog, Arc::new(tracker))
}

#[test]
fn test_commit_storm_upholds_snapshot_invariants() {
    const WRITERS: usize = 8;
    const TXNS_PER_WRITER: usize = 200;

    let (_clog, tracker) = tracker(WRITERS + 1);
    let next_xid = Arc::new(AtomicU32::new(1000));
    let done: Arc<Mutex<Vec<TransactionId>>> = Arc::new(Mutex::new(Vec::new()));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let tracker = tracker.clone();
            let next_xid = next_xid.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let handle = tracker
                    .register_backend(ProcessId(100 + w as u32), DatabaseId(1))
                    .unwrap();
                for _ in 0..TXNS_PER_WRITER {
                    let top = TransactionId(next_xid.fetch_add(2, Ordering::SeqCst));
                    let sub = top.advance();
                    handle.assign_xid(top);
                    handle.assign_subxid(sub);
                    handle.end_transaction(sub);
                    let mut done = done.lock();
                    done.push(top);
                    done.push(sub);
                }
            })
        })
        .collect();

    // Observer: snapshots interleave with the commit storm.
    let mut observer = tracker
        .register_backend(ProcessId(1), DatabaseId(1))
        .unwrap();
    let mut last_xmax = TransactionId::INVALID;
    for _ in 0..200 {
        let already_done: Vec<TransactionId> = done.lock().clone();
        let snap = observer.take_snapshot(false).unwrap();

        // SNAP-2
        assert!(snap.xmax().follows_or_equals(last_xmax));
        last_xmax = snap.xmax();

        // SNAP-1
        let ids = snap.in_progress();
        for pair in ids.windows(2) {
            assert!(pair[0].precedes(pair[1]), "in-progress list unsorted");
        }
        for &xid in ids {
            assert!(snap.xmin().precedes_or_equals(xid));
            assert!(xid.precedes(snap.xmax()));
        }

        // SNAP-3
        for xid in already_done {
            assert!(
                !snap.considers_running(xid),
                "{} ended before this snapshot began",
                xid
            );
        }
    }

    for t in writers {
        t.join().unwrap();
    }

    // GRP-1: whatever mix of solo and batched clears happened, the final
    // state matches the serial outcome.
    let total = (WRITERS * TXNS_PER_WRITER) as u32;
    let highest = TransactionId(1000 + total * 2 - 1);
    assert_eq!(tracker.latest_completed(), highest);
    let snap = observer.take_snapshot(false).unwrap();
    assert!(snap.in_progress().is_empty());
    assert!(snap.sub_in_progress().is_empty());

    let stats = tracker.stats_snapshot();
    assert_eq!(
        stats.solo_clears + stats.group_clear_members,
        (WRITERS * TXNS_PER_WRITER) as u64
    );
}

#[test]
fn test_randomized_lifecycle_against_model() {
    let (clog, tracker) = tracker(16);
    let mut rng = rand::thread_rng();

    let mut handles = Vec::new();
    for i in 0..8u32 {
        handles.push(
            tracker
                .register_backend(ProcessId(10 + i), DatabaseId(1))
                .unwrap(),
        );
    }
    let mut observer = tracker
        .register_backend(ProcessId(99), DatabaseId(1))
        .unwrap();

    let mut next = 1000u32;
    let mut running: HashSet<TransactionId> = HashSet::new();
    let mut finished: Vec<TransactionId> = Vec::new();

    for _ in 0..500 {
        let i = rng.gen_range(0..handles.len());
        let handle = &handles[i];
        if handle.current_xid().is_invalid() {
            let xid = TransactionId(next);
            next += 1;
            handle.assign_xid(xid);
            running.insert(xid);
        } else if rng.gen_bool(0.6) {
            let xid = handle.current_xid();
            if rng.gen_bool(0.5) {
                clog.mark_committed(xid);
            } else {
                clog.mark_aborted(xid);
            }
            handle.end_transaction(xid);
            running.remove(&xid);
            finished.push(xid);
        }

        if rng.gen_bool(0.2) {
            let snap = observer.take_snapshot(false).unwrap();
            for &xid in &running {
                assert!(snap.considers_running(xid), "{} should be running", xid);
            }
            for &xid in &finished {
                assert!(!snap.considers_running(xid), "{} already finished", xid);
            }
        }
    }
}

#[test]
fn test_long_replay_stream_stays_sorted_and_bounded() {
    // Small pool keeps the replay arena tight so the stream forces
    // compactions.
    let (_clog, tracker) = tracker(4);
    tracker.apply_recovery_info(&RunningTransactions {
        next_xid: TransactionId(1000),
        oldest_running_xid: TransactionId(1000),
        latest_completed_xid: TransactionId(999),
        xids: vec![],
        subxid_overflowed: false,
    });

    let mut rng = rand::thread_rng();
    let mut observer = tracker
        .register_backend(ProcessId(1), DatabaseId(1))
        .unwrap();

    // One transaction stays open the whole run, pinning the arena tail
    // while the head keeps growing.
    let long_runner = TransactionId(1000);
    tracker.record_assigned(long_runner);

    let mut open: Vec<TransactionId> = Vec::new();
    let mut completed: Vec<TransactionId> = Vec::new();
    for i in 1..1000u32 {
        let xid = TransactionId(1000 + i);
        tracker.record_assigned(xid);
        open.push(xid);

        if open.len() > 8 {
            // Complete a random member, not necessarily the oldest.
            let victim = open.swap_remove(rng.gen_range(0..open.len()));
            tracker.apply_completion_tree(victim, &[], victim);
            completed.push(victim);
        }

        if i % 100 == 0 {
            let snap = observer.take_snapshot(true).unwrap();
            let ids = snap.sub_in_progress();
            // RPL-1: sorted, and never reports a completed tree.
            for pair in ids.windows(2) {
                assert!(pair[0].precedes(pair[1]), "replay snapshot unsorted");
            }
            for &xid in &completed {
                assert!(!snap.considers_running(xid));
            }
            assert!(snap.considers_running(long_runner));
            for &xid in &open {
                assert!(snap.considers_running(xid));
            }
        }
    }

    // Drain everything, long runner last.
    for xid in open.drain(..) {
        tracker.apply_completion_tree(xid, &[], xid);
    }
    tracker.apply_completion_tree(long_runner, &[], TransactionId(1999));

    let snap = observer.take_snapshot(true).unwrap();
    assert!(snap.sub_in_progress().is_empty());
    assert_eq!(tracker.latest_completed(), TransactionId(1999));

    let stats = tracker.stats_snapshot();
    assert_eq!(stats.replay_added, 1000);
    assert!(
        stats.replay_compressions > 0,
        "a 1000-id stream over a {}-entry arena must compact",
        4 * kestrel_txn::SUBXID_CACHE_SIZE
    );
}
