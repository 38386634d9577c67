//! Contracts for the external collaborators the tracker consults.
//!
//! The tracker never writes the commit log and never generates ids; it
//! only asks narrow questions on the visibility slow paths. Production
//! wires the real subsystems in here; tests use the in-memory doubles
//! from [`testing`].

use kestrel_common::types::TransactionId;

/// The on-disk commit-log ("clog") subsystem, reduced to the two
/// questions visibility needs answered.
pub trait CommitLog: Send + Sync {
    fn did_commit(&self, xid: TransactionId) -> bool;
    fn did_abort(&self, xid: TransactionId) -> bool;
}

/// The subtransaction-parent lookup table.
pub trait SubtransTable: Send + Sync {
    /// Walk the parent chain to the topmost ancestor. An id with no
    /// recorded parent is its own topmost ancestor.
    fn get_topmost_parent(&self, xid: TransactionId) -> TransactionId;

    fn set_parent(&self, sub_xid: TransactionId, parent_xid: TransactionId);
}

/// In-memory collaborator doubles for tests.
pub mod testing {
    use std::collections::{HashMap, HashSet};

    use parking_lot::Mutex;

    use super::{CommitLog, SubtransTable};
    use kestrel_common::types::TransactionId;

    #[derive(Default)]
    pub struct InMemoryCommitLog {
        committed: Mutex<HashSet<TransactionId>>,
        aborted: Mutex<HashSet<TransactionId>>,
    }

    impl InMemoryCommitLog {
        pub fn mark_committed(&self, xid: TransactionId) {
            self.committed.lock().insert(xid);
        }

        pub fn mark_aborted(&self, xid: TransactionId) {
            self.aborted.lock().insert(xid);
        }
    }

    impl CommitLog for InMemoryCommitLog {
        fn did_commit(&self, xid: TransactionId) -> bool {
            self.committed.lock().contains(&xid)
        }

        fn did_abort(&self, xid: TransactionId) -> bool {
            self.aborted.lock().contains(&xid)
        }
    }

    #[derive(Default)]
    pub struct InMemorySubtrans {
        parents: Mutex<HashMap<TransactionId, TransactionId>>,
    }

    impl SubtransTable for InMemorySubtrans {
        fn get_topmost_parent(&self, xid: TransactionId) -> TransactionId {
            let parents = self.parents.lock();
            let mut current = xid;
            while let Some(&parent) = parents.get(&current) {
                current = parent;
            }
            current
        }

        fn set_parent(&self, sub_xid: TransactionId, parent_xid: TransactionId) {
            self.parents.lock().insert(sub_xid, parent_xid);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_topmost_parent_walks_chain() {
            let st = InMemorySubtrans::default();
            st.set_parent(TransactionId(102), TransactionId(101));
            st.set_parent(TransactionId(101), TransactionId(100));
            assert_eq!(st.get_topmost_parent(TransactionId(102)), TransactionId(100));
            assert_eq!(st.get_topmost_parent(TransactionId(100)), TransactionId(100));
            // No entry: id is its own topmost ancestor.
            assert_eq!(st.get_topmost_parent(TransactionId(999)), TransactionId(999));
        }
    }
}
