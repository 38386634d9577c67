//! Known-assigned transaction set for hot-standby replay.
//!
//! While replaying a primary's write-ahead log, there are no live local
//! backends to scan: the set of running transactions is reconstructed
//! here instead. Ids arrive from the log in non-decreasing order, which is
//! what makes the structure cheap — an append-at-head sorted arena with
//! tombstone removal and an explicit O(span) compaction, never a
//! self-balancing tree. The arena mutex plays the spinlock role from the
//! shared-memory original: it orders head/tail publication against the
//! entries behind them and is only ever held for short, bounded sections.
//!
//! Lock order: registry lock (when held at all) strictly before the arena
//! mutex. Tree-completion expiry holds the registry lock exclusively
//! around both the tombstoning and the watermark advance so that replay
//! snapshots never observe a transaction as neither running nor completed.

use kestrel_common::config::ReplaySetConfig;
use kestrel_common::types::TransactionId;

use crate::registry::TrackerShared;
use crate::slot::SUBXID_CACHE_SIZE;

/// Sorted, gap-tolerant arena of transactions known to be running on the
/// primary.
pub(crate) struct ReplaySet {
    entries: Box<[u32]>,
    valid: Box<[bool]>,
    /// First element that may be valid.
    tail: usize,
    /// One past the last element in use.
    head: usize,
    num_valid: usize,
    max_backends: usize,
    compress_min_density_pct: u32,
    compress_span_factor: usize,
}

impl ReplaySet {
    pub fn new(max_backends: usize, config: &ReplaySetConfig) -> Self {
        // Worst case: every backend's top-level id plus a full subxid
        // cache, all unassigned to slots yet, plus configured slack.
        let capacity = max_backends * (SUBXID_CACHE_SIZE + 1) + config.slack_entries;
        Self {
            entries: vec![0u32; capacity].into_boxed_slice(),
            valid: vec![false; capacity].into_boxed_slice(),
            tail: 0,
            head: 0,
            num_valid: 0,
            max_backends,
            compress_min_density_pct: config.compress_min_density_pct,
            compress_span_factor: config.compress_span_factor,
        }
    }

    pub fn len(&self) -> usize {
        self.num_valid
    }

    pub fn is_empty(&self) -> bool {
        self.num_valid == 0
    }

    /// Append the contiguous inclusive range `from..=to`.
    ///
    /// Panics when the range does not follow every existing entry (the log
    /// is replayed in order; an out-of-order insertion means the replay
    /// stream is corrupted) and when the arena cannot hold the range even
    /// after a forced compaction (sizing covers the worst case, so this
    /// too indicates corruption). The caller may or may not hold the
    /// registry lock; the arena itself is protected by its own mutex.
    pub fn add(&mut self, from: TransactionId, to: TransactionId) -> usize {
        debug_assert!(from.is_normal() && to.is_normal());
        debug_assert!(from.precedes_or_equals(to));

        let mut count = 0usize;
        let mut xid = from;
        loop {
            count += 1;
            if xid == to {
                break;
            }
            xid = xid.advance();
        }

        if self.head > self.tail {
            let last = TransactionId(self.entries[self.head - 1]);
            if from.precedes_or_equals(last) {
                panic!(
                    "out-of-order replay-set insertion: {} not after {}",
                    from, last
                );
            }
        }

        if self.head + count > self.entries.len() {
            self.compress_inner();
            if self.head + count > self.entries.len() {
                panic!(
                    "replay set exhausted: {} entries in use, {} more needed, capacity {}",
                    self.head - self.tail,
                    count,
                    self.entries.len()
                );
            }
        }

        let mut xid = from;
        for _ in 0..count {
            self.entries[self.head] = xid.0;
            self.valid[self.head] = true;
            self.head += 1;
            xid = xid.advance();
        }
        self.num_valid += count;
        count
    }

    /// Binary search over the (sorted) used span. Returns the index even
    /// for a tombstoned entry; callers check validity.
    fn search(&self, xid: TransactionId) -> Option<usize> {
        let mut lo = self.tail;
        let mut hi = self.head;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = TransactionId(self.entries[mid]);
            if entry == xid {
                return Some(mid);
            }
            if entry.precedes(xid) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    pub fn contains(&self, xid: TransactionId) -> bool {
        matches!(self.search(xid), Some(i) if self.valid[i])
    }

    /// Tombstone one id. Returns false when it was not present (expected
    /// after an overflow-avoidance removal already took it out).
    pub fn remove(&mut self, xid: TransactionId) -> bool {
        match self.search(xid) {
            Some(i) if self.valid[i] => {
                self.valid[i] = false;
                self.num_valid -= 1;
                if i == self.tail {
                    self.advance_tail();
                }
                true
            }
            _ => false,
        }
    }

    /// Tombstone every entry strictly preceding `horizon` (every entry at
    /// all when `horizon` is invalid), except ids `protected` says must
    /// survive — in-doubt two-phase transactions look old but stay until
    /// explicitly resolved.
    pub fn prune_preceding<P: Fn(TransactionId) -> bool>(
        &mut self,
        horizon: TransactionId,
        protected: P,
    ) -> usize {
        let mut pruned = 0;
        for i in self.tail..self.head {
            if !self.valid[i] {
                continue;
            }
            let entry = TransactionId(self.entries[i]);
            if horizon.is_valid() && !entry.precedes(horizon) {
                break;
            }
            if protected(entry) {
                continue;
            }
            self.valid[i] = false;
            self.num_valid -= 1;
            pruned += 1;
        }
        self.advance_tail();
        pruned
    }

    fn advance_tail(&mut self) {
        while self.tail < self.head && !self.valid[self.tail] {
            self.tail += 1;
        }
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    /// Heuristic compaction: worthwhile only when the used span has grown
    /// well past the live population (span at least
    /// `compress_span_factor * max_backends` and density below
    /// `compress_min_density_pct`). A forced run skips the heuristic.
    /// Returns whether compaction ran.
    pub fn compress(&mut self, force: bool) -> bool {
        if !force {
            let span = self.head - self.tail;
            if span < self.compress_span_factor * self.max_backends {
                return false;
            }
            if self.num_valid as u64 * 100 >= span as u64 * self.compress_min_density_pct as u64 {
                return false;
            }
        }
        self.compress_inner();
        true
    }

    fn compress_inner(&mut self) {
        let mut write = 0;
        for read in self.tail..self.head {
            if self.valid[read] {
                self.entries[write] = self.entries[read];
                self.valid[write] = true;
                write += 1;
            }
        }
        for i in write..self.head {
            self.valid[i] = false;
        }
        self.tail = 0;
        self.head = write;
        debug_assert_eq!(self.num_valid, write);
    }

    /// First valid entry from the tail, or invalid if empty.
    pub fn oldest(&self) -> TransactionId {
        for i in self.tail..self.head {
            if self.valid[i] {
                return TransactionId(self.entries[i]);
            }
        }
        TransactionId::INVALID
    }

    /// Walk tail→head appending every valid id preceding `xmax` into
    /// `out`, up to `limit` entries. Returns the smallest valid id seen
    /// (the replay-side xmin candidate) and whether `limit` cut the walk
    /// short. Top-level and sub ids are deliberately not distinguished
    /// here; for visibility purposes the union is what matters.
    pub fn collect_running(
        &self,
        xmax: TransactionId,
        limit: usize,
        out: &mut Vec<TransactionId>,
    ) -> (TransactionId, bool) {
        let mut xmin = TransactionId::INVALID;
        for i in self.tail..self.head {
            if !self.valid[i] {
                continue;
            }
            let entry = TransactionId(self.entries[i]);
            if xmin.is_invalid() {
                xmin = entry;
            }
            if !entry.precedes(xmax) {
                continue;
            }
            if out.len() == limit {
                return (xmin, true);
            }
            out.push(entry);
        }
        (xmin, false)
    }

    /// Valid entries tail→head, for assertions and tests.
    #[cfg(test)]
    pub fn valid_entries(&self) -> Vec<TransactionId> {
        (self.tail..self.head)
            .filter(|&i| self.valid[i])
            .map(|i| TransactionId(self.entries[i]))
            .collect()
    }
}

/// Standby replay readiness.
///
/// `Pending` covers the window after an initial snapshot whose
/// subtransaction info had overflowed on the primary: the set is not yet
/// authoritative, and snapshots must not be served until the primary's
/// oldest running id catches up with the snapshot-time next id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyState {
    Uninitialized,
    Pending,
    Ready,
}

/// Replay-side bookkeeping outside the arena proper.
pub(crate) struct StandbyMachine {
    pub state: StandbyState,
    /// Highest id observed in the replay stream; ids between this and a
    /// newly observed id are implicitly assigned and get gap-filled.
    pub latest_observed: TransactionId,
    /// `Pending` resolves once the oldest running id reaches this.
    pub pending_until: TransactionId,
}

impl StandbyMachine {
    pub fn new() -> Self {
        Self {
            state: StandbyState::Uninitialized,
            latest_observed: TransactionId::INVALID,
            pending_until: TransactionId::INVALID,
        }
    }
}

/// A running-transactions snapshot logged periodically by the primary.
#[derive(Debug, Clone)]
pub struct RunningTransactions {
    /// Next id the primary would assign.
    pub next_xid: TransactionId,
    /// Oldest id still running on the primary.
    pub oldest_running_xid: TransactionId,
    /// Primary's latest-completed watermark.
    pub latest_completed_xid: TransactionId,
    /// Running ids (top-level and sub, mixed), in no particular order.
    pub xids: Vec<TransactionId>,
    /// True when the primary's subtransaction caches had overflowed and
    /// `xids` is therefore not exhaustive.
    pub subxid_overflowed: bool,
}

/// Initialize (or advance) standby state from a running-transactions
/// record.
pub(crate) fn apply_recovery_info(shared: &TrackerShared, running: &RunningTransactions) {
    let mut standby = shared.standby.lock();

    if standby.state == StandbyState::Ready {
        // Already initialized: the record only serves to prune entries the
        // primary has finished with.
        drop(standby);
        expire_old(shared, running.oldest_running_xid);
        return;
    }

    if standby.state == StandbyState::Pending {
        if running.oldest_running_xid.follows_or_equals(standby.pending_until) {
            standby.state = StandbyState::Ready;
            tracing::debug!(
                "standby snapshots ready: oldest running {} reached {}",
                running.oldest_running_xid,
                standby.pending_until
            );
        }
        return;
    }

    // Uninitialized: build the set from scratch.
    let mut xids = running.xids.clone();
    xids.retain(|x| x.is_normal() && x.precedes(running.next_xid));
    xids.sort_by(|a, b| {
        if a == b {
            std::cmp::Ordering::Equal
        } else if a.precedes(*b) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
    xids.dedup();

    {
        let mut core = shared.registry.write();
        let mut replay = shared.replay.lock();
        replay.prune_preceding(TransactionId::INVALID, |_| false);
        for &xid in &xids {
            replay.add(xid, xid);
        }
        shared.stats.record_replay_added(xids.len() as u64);
        core.advance_latest_completed(running.latest_completed_xid);
    }

    standby.latest_observed = if running.next_xid.is_normal() {
        running.next_xid.retreat()
    } else {
        TransactionId::INVALID
    };

    if running.subxid_overflowed {
        standby.state = StandbyState::Pending;
        standby.pending_until = running.next_xid;
        tracing::warn!(
            "standby snapshot pending: primary subxid info overflowed, waiting for {}",
            running.next_xid
        );
    } else {
        standby.state = StandbyState::Ready;
        tracing::debug!("standby snapshots ready with {} running xid(s)", xids.len());
    }
}

/// Note that `xid` appeared in the replay stream. Any ids between the
/// previously observed maximum and `xid` were assigned on the primary
/// without leaving their own trace yet, so the whole gap is recorded as
/// running.
pub(crate) fn record_assigned(shared: &TrackerShared, xid: TransactionId) {
    if !xid.is_normal() {
        return;
    }
    let mut standby = shared.standby.lock();
    if standby.state == StandbyState::Uninitialized {
        tracing::trace!("ignoring assigned {} before recovery info", xid);
        return;
    }
    if standby.latest_observed.is_valid() && !standby.latest_observed.precedes(xid) {
        return;
    }

    let from = if standby.latest_observed.is_valid() {
        standby.latest_observed.advance()
    } else {
        xid
    };
    {
        let mut replay = shared.replay.lock();
        // Make room ahead of the append when the lazy heuristic says the
        // arena is mostly tombstones.
        if replay.compress(false) {
            shared.stats.record_replay_compression(false);
        }
        let added = replay.add(from, xid);
        shared.stats.record_replay_added(added as u64);
    }
    standby.latest_observed = xid;
}

/// Apply an assignment record: `subxids` now have `top` durably recorded
/// as their parent, so they no longer need individual replay-set entries.
/// Dropping them bounds the arena during long transactions with deep
/// subtransaction trees; visibility falls back to the parent table.
pub(crate) fn apply_assignment(
    shared: &TrackerShared,
    top: TransactionId,
    subxids: &[TransactionId],
) {
    for &sub in subxids {
        shared.subtrans.set_parent(sub, top);
    }
    let mut replay = shared.replay.lock();
    for &sub in subxids {
        if replay.remove(sub) {
            shared.stats.record_replay_removed();
        } else {
            shared.stats.record_replay_remove_miss();
            tracing::trace!("assignment: {} already absent from replay set", sub);
        }
    }
}

/// Apply a commit/abort record for a transaction tree: tombstone exactly
/// the tree's ids and advance the watermark, atomically with respect to
/// snapshot takers.
pub(crate) fn apply_completion_tree(
    shared: &TrackerShared,
    top: TransactionId,
    subxids: &[TransactionId],
    latest_xid: TransactionId,
) {
    let mut core = shared.registry.write();
    {
        let mut replay = shared.replay.lock();
        for &xid in std::iter::once(&top).chain(subxids) {
            if replay.remove(xid) {
                shared.stats.record_replay_removed();
            } else {
                shared.stats.record_replay_remove_miss();
                tracing::trace!("completion: {} already absent from replay set", xid);
            }
        }
    }
    core.advance_latest_completed(latest_xid);
}

/// Drop entries for transactions the primary has finished with.
/// In-doubt prepared transactions survive regardless of age.
pub(crate) fn expire_old(shared: &TrackerShared, horizon: TransactionId) {
    let mut replay = shared.replay.lock();
    let pruned = replay.prune_preceding(horizon, |xid| shared.prepared_index.contains_key(&xid));
    if pruned > 0 {
        tracing::trace!("pruned {} replay entries before {}", pruned, horizon);
    }
    if replay.compress(false) {
        shared.stats.record_replay_compression(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::ReplaySetConfig;

    fn set() -> ReplaySet {
        ReplaySet::new(
            4,
            &ReplaySetConfig {
                compress_min_density_pct: 50,
                compress_span_factor: 4,
                slack_entries: 8,
            },
        )
    }

    fn assert_sorted(s: &ReplaySet) {
        let entries = s.valid_entries();
        for pair in entries.windows(2) {
            assert!(
                pair[0].precedes(pair[1]),
                "replay set out of order: {} before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_add_range_and_search() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(104));
        assert_eq!(s.len(), 5);
        assert!(s.contains(TransactionId(102)));
        assert!(!s.contains(TransactionId(105)));
        assert_sorted(&s);
    }

    #[test]
    #[should_panic(expected = "out-of-order replay-set insertion")]
    fn test_out_of_order_add_panics() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(104));
        s.add(TransactionId(104), TransactionId(106));
    }

    #[test]
    fn test_remove_is_tolerant_of_absent() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(102));
        assert!(s.remove(TransactionId(101)));
        assert!(!s.remove(TransactionId(101)));
        assert!(!s.remove(TransactionId(999)));
        assert_eq!(s.len(), 2);
        assert_sorted(&s);
    }

    #[test]
    fn test_oldest_skips_tombstones() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(103));
        s.remove(TransactionId(100));
        s.remove(TransactionId(101));
        assert_eq!(s.oldest(), TransactionId(102));
    }

    #[test]
    fn test_prune_respects_protected() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(105));
        let pruned = s.prune_preceding(TransactionId(104), |x| x == TransactionId(102));
        assert_eq!(pruned, 3); // 100, 101, 103
        assert_eq!(
            s.valid_entries(),
            vec![TransactionId(102), TransactionId(104), TransactionId(105)]
        );
        assert_sorted(&s);
    }

    #[test]
    fn test_prune_invalid_horizon_clears_all() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(105));
        s.prune_preceding(TransactionId::INVALID, |_| false);
        assert!(s.is_empty());
    }

    #[test]
    fn test_compress_heuristic_gates() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(109));
        // Span 10 < 4 * max_backends(4): heuristic declines.
        assert!(!s.compress(false));

        for i in 100..=107 {
            s.remove(TransactionId(i));
        }
        // tail advanced past the removals; span shrinks accordingly.
        assert!(!s.compress(false));
        assert_eq!(s.valid_entries(), vec![TransactionId(108), TransactionId(109)]);
    }

    #[test]
    fn test_forced_compress_closes_gaps() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(109));
        s.remove(TransactionId(103));
        s.remove(TransactionId(105));
        s.remove(TransactionId(107));
        assert!(s.compress(true));
        assert_eq!(s.len(), 7);
        assert_sorted(&s);
        assert!(s.contains(TransactionId(109)));
        assert!(!s.contains(TransactionId(105)));
    }

    #[test]
    fn test_add_forces_compress_when_full() {
        let mut s = ReplaySet::new(
            1,
            &ReplaySetConfig {
                compress_min_density_pct: 50,
                compress_span_factor: 4,
                slack_entries: 0,
            },
        );
        let capacity = SUBXID_CACHE_SIZE + 1;
        s.add(TransactionId(100), TransactionId(100 + capacity as u32 - 1));
        for i in 0..capacity as u32 - 1 {
            s.remove(TransactionId(100 + i));
        }
        // One valid entry left but the arena is at head==capacity before
        // tail adjustment; the next add squeezes via forced compress.
        s.add(
            TransactionId(100 + capacity as u32),
            TransactionId(100 + capacity as u32 + 3),
        );
        assert_sorted(&s);
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_collect_running_filters_xmax_and_reports_xmin() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(105));
        s.remove(TransactionId(100));
        let mut out = Vec::new();
        let (xmin, overflowed) = s.collect_running(TransactionId(104), 64, &mut out);
        assert_eq!(xmin, TransactionId(101));
        assert!(!overflowed);
        assert_eq!(
            out,
            vec![TransactionId(101), TransactionId(102), TransactionId(103)]
        );
    }

    #[test]
    fn test_collect_running_limit_overflow() {
        let mut s = set();
        s.add(TransactionId(100), TransactionId(110));
        let mut out = Vec::new();
        let (_, overflowed) = s.collect_running(TransactionId(200), 4, &mut out);
        assert!(overflowed);
        assert_eq!(out.len(), 4);
    }
}
