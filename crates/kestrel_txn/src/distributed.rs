//! Distributed-snapshot capability.
//!
//! Single-node deployments never coordinate with anything: snapshots are
//! derived purely from local state and marked `local_only`. Clustered
//! deployments stamp each snapshot with a global timestamp fetched from
//! either the coordinator node or a dedicated timestamp authority. The
//! snapshot builder depends only on this capability, selected once at
//! startup, never on deployment-mode conditionals.

use std::sync::Arc;

use kestrel_common::error::DistributedError;
use kestrel_common::types::Timestamp;

/// Source of distributed start timestamps.
pub trait TimestampAuthority: Send + Sync {
    /// Fetch the current global timestamp. A connection failure is a
    /// query-level error: the requesting transaction fails and retries.
    fn fetch_global_timestamp(&self) -> Result<Timestamp, DistributedError>;
}

/// How snapshots obtain their distributed start timestamp.
#[derive(Clone)]
pub enum SnapshotSource {
    /// No distributed coordination; snapshots are local-only.
    Local,
    /// Timestamps relayed through the coordinator node.
    FromCoordinator(Arc<dyn TimestampAuthority>),
    /// Timestamps fetched directly from the timestamp authority.
    FromAuthority(Arc<dyn TimestampAuthority>),
}

impl SnapshotSource {
    /// The global timestamp for a new snapshot, or `None` in local mode.
    pub fn start_timestamp(&self) -> Result<Option<Timestamp>, DistributedError> {
        match self {
            SnapshotSource::Local => Ok(None),
            SnapshotSource::FromCoordinator(authority)
            | SnapshotSource::FromAuthority(authority) => {
                authority.fetch_global_timestamp().map(Some)
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SnapshotSource::Local)
    }
}

impl std::fmt::Debug for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSource::Local => write!(f, "Local"),
            SnapshotSource::FromCoordinator(_) => write!(f, "FromCoordinator"),
            SnapshotSource::FromAuthority(_) => write!(f, "FromAuthority"),
        }
    }
}

/// Test authority handing out a fixed sequence of timestamps, optionally
/// failing to connect.
pub mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use super::TimestampAuthority;
    use kestrel_common::error::DistributedError;
    use kestrel_common::types::Timestamp;

    #[derive(Default)]
    pub struct MonotonicAuthority {
        counter: AtomicU64,
        unreachable: AtomicBool,
    }

    impl MonotonicAuthority {
        pub fn set_unreachable(&self, down: bool) {
            self.unreachable.store(down, Ordering::SeqCst);
        }
    }

    impl TimestampAuthority for MonotonicAuthority {
        fn fetch_global_timestamp(&self) -> Result<Timestamp, DistributedError> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(DistributedError::ConnectionFailure(
                    "timestamp authority unreachable".into(),
                ));
            }
            Ok(Timestamp(self.counter.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MonotonicAuthority;
    use super::*;

    #[test]
    fn test_local_source_never_fetches() {
        assert_eq!(SnapshotSource::Local.start_timestamp().unwrap(), None);
    }

    #[test]
    fn test_authority_source_fetches_monotonic() {
        let authority = Arc::new(MonotonicAuthority::default());
        let source = SnapshotSource::FromAuthority(authority);
        let a = source.start_timestamp().unwrap().unwrap();
        let b = source.start_timestamp().unwrap().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_connection_failure_propagates() {
        let authority = Arc::new(MonotonicAuthority::default());
        authority.set_unreachable(true);
        let source = SnapshotSource::FromCoordinator(authority);
        assert!(source.start_timestamp().is_err());
    }
}
