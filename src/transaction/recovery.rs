// Crash recovery: analysis then redo, no undo.
//
// A page is never written back to the container before its WAL record is
// fsynced, so a transaction that never committed has no on-disk effects to
// revert -- there is nothing for an undo pass to do. Recovery only needs to
// replay the committed transactions the previous process didn't get to flush
// before it stopped.

use crate::common::TransactionId;
use crate::container::ContainerFile;
use crate::error::Result;
use std::collections::HashSet;

use super::wal_manager::{WalEntryKind, WalManager};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub entries_scanned: usize,
    pub committed_transactions: usize,
    pub loser_transactions: usize,
    pub pages_redone: usize,
    pub new_checkpoint_lsn: u64,
}

/// Scans the WAL from the last checkpoint, replays every committed
/// transaction's page writes into `container`, and records a fresh
/// checkpoint past the replayed range.
pub fn recover(wal: &mut WalManager, container: &mut ContainerFile) -> Result<RecoveryReport> {
    tracing::info!(from_slot = wal.head_slot(), "starting recovery scan");
    let scanned = wal.scan_from(wal.head_slot())?;

    // Analysis: a transaction only gets redone if its commit record made it
    // into the durable tail. Anything still open, or explicitly aborted, is
    // a loser and is skipped.
    let mut committed: HashSet<TransactionId> = HashSet::new();
    for (_, entry) in &scanned {
        if matches!(entry.kind, WalEntryKind::TxnCommit) {
            committed.insert(entry.txn_id);
        }
    }

    let mut all_txns: HashSet<TransactionId> = HashSet::new();
    let mut pages_redone = 0usize;
    let mut last_lsn = wal.last_checkpoint_lsn();

    // Redo, in the LSN order the scan already preserves.
    for (_, entry) in &scanned {
        all_txns.insert(entry.txn_id);
        last_lsn = last_lsn.max(entry.lsn);
        if !committed.contains(&entry.txn_id) {
            continue;
        }
        match &entry.kind {
            WalEntryKind::PageWrite { page_id, after, .. } => {
                container.write_page(*page_id, after)?;
                pages_redone += 1;
            }
            WalEntryKind::BlobWrite { .. } => {
                // Blob bytes are written to the external blob file ahead of
                // this record; nothing to replay against the container.
            }
            WalEntryKind::AllocPages { .. } | WalEntryKind::FreePages { .. } => {
                // The free-space map is rebuilt from the container's file
                // length on open rather than persisted, so these are
                // audit-only here.
            }
            WalEntryKind::TxnBegin | WalEntryKind::TxnCommit | WalEntryKind::TxnAbort => {}
            WalEntryKind::Checkpoint { .. } | WalEntryKind::Pad => {}
        }
    }

    container.sync()?;

    let checkpoint_txn = 0;
    wal.append(checkpoint_txn, WalEntryKind::Checkpoint { checkpoint_lsn: last_lsn })?;
    wal.flush()?;
    wal.advance_checkpoint(last_lsn, wal.tail_slot())?;

    let loser_transactions = all_txns.difference(&committed).count();

    tracing::info!(
        committed = committed.len(),
        loser_transactions,
        pages_redone,
        new_checkpoint_lsn = last_lsn,
        "recovery complete"
    );

    Ok(RecoveryReport {
        entries_scanned: scanned.len(),
        committed_transactions: committed.len(),
        loser_transactions,
        pages_redone,
        new_checkpoint_lsn: last_lsn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalDurability;
    use tempfile::NamedTempFile;

    fn new_wal() -> WalManager {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).ok();
        WalManager::create(&path, 64 * 1024, 256, WalDurability::FullSync).unwrap()
    }

    fn new_container() -> ContainerFile {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        ContainerFile::create(&path, 4096, 0).unwrap()
    }

    fn finalized_page(fill: u8, page_size: u32) -> Vec<u8> {
        let mut buf = vec![fill; page_size as usize];
        let footer_at = buf.len() - 4;
        let crc = crate::storage::checksum::hardware_crc32c(&buf[..footer_at]);
        buf[footer_at..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn redoes_committed_transaction_pages() {
        let mut wal = new_wal();
        let mut container = new_container();
        let page_id = container.allocate_pages(1);
        let page = finalized_page(7, container.page_size());

        wal.append(1, WalEntryKind::TxnBegin).unwrap();
        wal.append(1, WalEntryKind::PageWrite { page_id, before: None, after: page.clone() }).unwrap();
        wal.commit(1).unwrap();

        let report = recover(&mut wal, &mut container).unwrap();
        assert_eq!(report.committed_transactions, 1);
        assert_eq!(report.pages_redone, 1);

        let on_disk = container.read_page(page_id).unwrap();
        assert_eq!(on_disk, page);
    }

    #[test]
    fn skips_pages_from_uncommitted_transaction() {
        let mut wal = new_wal();
        let mut container = new_container();
        let page_id = container.allocate_pages(1);
        let page = finalized_page(9, container.page_size());

        wal.append(2, WalEntryKind::TxnBegin).unwrap();
        wal.append(2, WalEntryKind::PageWrite { page_id, before: None, after: page }).unwrap();
        // no commit: transaction 2 is a loser.

        let report = recover(&mut wal, &mut container).unwrap();
        assert_eq!(report.committed_transactions, 0);
        assert_eq!(report.loser_transactions, 1);
        assert_eq!(report.pages_redone, 0);
    }

    #[test]
    fn recovery_is_idempotent_once_checkpointed() {
        let mut wal = new_wal();
        let mut container = new_container();
        wal.append(1, WalEntryKind::TxnBegin).unwrap();
        wal.commit(1).unwrap();

        let first = recover(&mut wal, &mut container).unwrap();
        assert_eq!(first.committed_transactions, 1);

        let second = recover(&mut wal, &mut container).unwrap();
        assert_eq!(second.committed_transactions, 0);
        assert_eq!(second.entries_scanned, 0);
    }
}
