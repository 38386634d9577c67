use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier.
///
/// The 32-bit id space is circular: ordering between two normal ids is
/// decided by signed distance around a moving horizon, so comparisons stay
/// correct across wraparound as long as no two live ids are more than 2^31
/// apart. Three low values are reserved and never assigned to ordinary
/// transactions: [`TransactionId::INVALID`], [`TransactionId::BOOTSTRAP`]
/// and [`TransactionId::FROZEN`]. The two reserved non-invalid ids compare
/// older than every normal id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// Never a real transaction; used as the "no xid" marker.
    pub const INVALID: TransactionId = TransactionId(0);
    /// Bootstrap pseudo-transaction; precedes every normal id.
    pub const BOOTSTRAP: TransactionId = TransactionId(1);
    /// Frozen pseudo-transaction; precedes every normal id.
    pub const FROZEN: TransactionId = TransactionId(2);
    /// First id handed out by the id-generation authority.
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// True for ids outside the reserved range.
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Circular "older than" relation.
    ///
    /// Reserved ids sort by raw value (they are fixed points that never
    /// wrap); two normal ids compare by signed distance.
    pub fn precedes(self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn precedes_or_equals(self, other: TransactionId) -> bool {
        self == other || self.precedes(other)
    }

    pub fn follows(self, other: TransactionId) -> bool {
        other.precedes(self)
    }

    pub fn follows_or_equals(self, other: TransactionId) -> bool {
        self == other || self.follows(other)
    }

    /// Next id in assignment order, skipping the reserved range on wrap.
    pub fn advance(self) -> TransactionId {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            TransactionId(next)
        }
    }

    /// Previous id in assignment order, skipping the reserved range.
    pub fn retreat(self) -> TransactionId {
        debug_assert!(self.is_normal());
        let prev = self.0.wrapping_sub(1);
        if prev < Self::FIRST_NORMAL.0 {
            TransactionId(u32::MAX)
        } else {
            TransactionId(prev)
        }
    }

    /// The newer of two ids under the circular relation, treating an
    /// invalid id as older than anything.
    pub fn newer(self, other: TransactionId) -> TransactionId {
        if self.is_invalid() {
            return other;
        }
        if other.is_invalid() || other.precedes(self) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// Logical timestamp handed out by the distributed timestamp authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

/// Index of a backend slot in the shared slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// OS process id of a live backend. Zero marks a prepared-transaction
/// placeholder slot with no live process behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const NONE: ProcessId = ProcessId(0);

    pub const fn is_live(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Database a backend is connected to. Zero means cross-database work
/// (replication senders and similar auxiliaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    pub const SHARED: DatabaseId = DatabaseId(0);
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db:{}", self.0)
    }
}

/// Per-backend maintenance flags. A flagged backend is excluded from the
/// cleanup-horizon aggregation that ordinary backends participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VacuumFlags(pub u8);

impl VacuumFlags {
    /// Backend is running table maintenance and holds no data snapshot.
    pub const IN_VACUUM: u8 = 1 << 0;
    /// Backend is a logical-decoding worker with separate xmin bookkeeping.
    pub const IN_LOGICAL_DECODING: u8 = 1 << 1;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn in_vacuum(self) -> bool {
        self.0 & Self::IN_VACUUM != 0
    }

    pub const fn in_logical_decoding(self) -> bool {
        self.0 & Self::IN_LOGICAL_DECODING != 0
    }

    pub const fn with_vacuum(self) -> Self {
        Self(self.0 | Self::IN_VACUUM)
    }

    pub const fn with_logical_decoding(self) -> Self {
        Self(self.0 | Self::IN_LOGICAL_DECODING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(TransactionId::INVALID.is_invalid());
        assert!(!TransactionId::INVALID.is_normal());
        assert!(!TransactionId::BOOTSTRAP.is_normal());
        assert!(!TransactionId::FROZEN.is_normal());
        assert!(TransactionId::FIRST_NORMAL.is_normal());
    }

    #[test]
    fn test_precedes_simple() {
        assert!(TransactionId(100).precedes(TransactionId(101)));
        assert!(!TransactionId(101).precedes(TransactionId(100)));
        assert!(!TransactionId(100).precedes(TransactionId(100)));
        assert!(TransactionId(100).precedes_or_equals(TransactionId(100)));
    }

    #[test]
    fn test_reserved_precede_all_normal() {
        assert!(TransactionId::BOOTSTRAP.precedes(TransactionId(3)));
        assert!(TransactionId::FROZEN.precedes(TransactionId(u32::MAX)));
        // Even an id that would look "old" by signed distance follows FROZEN.
        assert!(TransactionId(u32::MAX).follows(TransactionId::FROZEN));
    }

    #[test]
    fn test_precedes_across_wrap() {
        let old = TransactionId(u32::MAX - 10);
        let new = TransactionId(100);
        assert!(old.precedes(new));
        assert!(new.follows(old));
    }

    #[test]
    fn test_advance_skips_reserved() {
        assert_eq!(TransactionId(u32::MAX).advance(), TransactionId::FIRST_NORMAL);
        assert_eq!(TransactionId(100).advance(), TransactionId(101));
        assert_eq!(TransactionId::FIRST_NORMAL.retreat(), TransactionId(u32::MAX));
        assert_eq!(TransactionId(101).retreat(), TransactionId(100));
    }

    #[test]
    fn test_newer() {
        let a = TransactionId(100);
        let b = TransactionId(200);
        assert_eq!(a.newer(b), b);
        assert_eq!(b.newer(a), b);
        assert_eq!(TransactionId::INVALID.newer(a), a);
        assert_eq!(a.newer(TransactionId::INVALID), a);
    }

    #[test]
    fn test_vacuum_flags() {
        let f = VacuumFlags::empty();
        assert!(!f.in_vacuum());
        let f = f.with_vacuum();
        assert!(f.in_vacuum());
        assert!(!f.in_logical_decoding());
        let f = f.with_logical_decoding();
        assert!(f.in_logical_decoding());
    }

    #[test]
    fn test_process_id_placeholder() {
        assert!(!ProcessId::NONE.is_live());
        assert!(ProcessId(4242).is_live());
    }
}
