//! Transaction visibility tracker for KestrelDB.
//!
//! This crate owns the shared registry of all active transactions and
//! everything derived from it:
//! - per-backend transaction slots with a bounded subtransaction cache,
//! - the densely packed process registry and its reader/writer lock,
//! - consistent MVCC snapshots (`xmin` / `xmax` / in-progress list),
//! - tiered visibility queries (`is_in_progress` and friends),
//! - the known-assigned replay set that reconstructs primary-server
//!   transaction state during hot-standby replay,
//! - the lock-free group-clear path that keeps commit throughput from
//!   collapsing under exclusive-lock contention.
//!
//! The commit log, the subtransaction-parent table, and the distributed
//! timestamp authority are external collaborators reached through the
//! narrow traits in [`external`] and [`distributed`].

pub mod backend;
pub mod distributed;
pub mod external;
pub mod group_clear;
pub mod registry;
pub mod replay;
pub mod slot;
pub mod snapshot;
pub mod stats;
pub mod visibility;


pub use backend::{BackendHandle, Tracker};
pub use distributed::{SnapshotSource, TimestampAuthority};
pub use external::{CommitLog, SubtransTable};
pub use registry::BackendCounts;
pub use replay::{RunningTransactions, StandbyState};
pub use slot::SUBXID_CACHE_SIZE;
pub use snapshot::{HorizonScope, Snapshot};
pub use stats::TrackerStatsSnapshot;
