// Tracks the snapshot LSNs held by open reader transactions.
//
// A reader's snapshot is just the durable LSN it captured at begin; there is
// no active-transaction-set bookkeeping to do since there is at most one
// writer and it never mutates the shared page cache until commit. The
// registry exists so the engine can answer "what is the oldest LSN a reader
// still needs" -- useful for bounding how aggressively old WAL regions can
// be reclaimed.

use crate::common::{LogSequenceNumber, TransactionId};
use std::collections::BTreeMap;

#[derive(Default)]
pub struct SnapshotRegistry {
    open: BTreeMap<TransactionId, LogSequenceNumber>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self { open: BTreeMap::new() }
    }

    pub fn register(&mut self, txn_id: TransactionId, snapshot_lsn: LogSequenceNumber) {
        self.open.insert(txn_id, snapshot_lsn);
    }

    pub fn release(&mut self, txn_id: TransactionId) {
        self.open.remove(&txn_id);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// The oldest snapshot LSN still held open, if any readers are active.
    pub fn oldest_snapshot_lsn(&self) -> Option<LogSequenceNumber> {
        self.open.values().copied().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_oldest_open_snapshot() {
        let mut reg = SnapshotRegistry::new();
        reg.register(1, 100);
        reg.register(2, 40);
        reg.register(3, 70);
        assert_eq!(reg.oldest_snapshot_lsn(), Some(40));
        reg.release(2);
        assert_eq!(reg.oldest_snapshot_lsn(), Some(70));
    }

    #[test]
    fn empty_registry_has_no_oldest() {
        let reg = SnapshotRegistry::new();
        assert_eq!(reg.oldest_snapshot_lsn(), None);
    }
}
