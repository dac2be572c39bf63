// Transaction domain types for the single-writer/many-reader model: a writer
// holds the process-wide write lock for its whole lifetime; a reader just
// carries the snapshot LSN it was given at begin.

use crate::common::{LogSequenceNumber, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Reader,
    Writer,
}

/// A transaction handle. Readers observe the page state as of `snapshot_lsn`
/// and never block writers; the single writer holds the write lock from
/// `begin` until commit or abort.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub snapshot_lsn: LogSequenceNumber,
    pub start_lsn: LogSequenceNumber,
    pub last_lsn: LogSequenceNumber,
}

impl Transaction {
    pub fn new_writer(id: TransactionId, start_lsn: LogSequenceNumber) -> Self {
        Self {
            id,
            kind: TransactionKind::Writer,
            state: TransactionState::Active,
            snapshot_lsn: start_lsn,
            start_lsn,
            last_lsn: start_lsn,
        }
    }

    pub fn new_reader(id: TransactionId, snapshot_lsn: LogSequenceNumber) -> Self {
        Self {
            id,
            kind: TransactionKind::Reader,
            state: TransactionState::Active,
            snapshot_lsn,
            start_lsn: snapshot_lsn,
            last_lsn: snapshot_lsn,
        }
    }

    pub fn is_writer(&self) -> bool {
        self.kind == TransactionKind::Writer
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn record_lsn(&mut self, lsn: LogSequenceNumber) {
        if lsn > self.last_lsn {
            self.last_lsn = lsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_tracks_its_own_lsn_progress() {
        let mut txn = Transaction::new_writer(1, 10);
        txn.record_lsn(15);
        txn.record_lsn(12);
        assert_eq!(txn.last_lsn, 15);
    }

    #[test]
    fn reader_snapshot_is_fixed_at_begin() {
        let txn = Transaction::new_reader(2, 42);
        assert_eq!(txn.snapshot_lsn, 42);
        assert!(!txn.is_writer());
    }
}
