// Transaction lifecycle: begin/commit/abort for the single-writer /
// many-reader model.
//
// A writer's page writes are buffered in a private overlay keyed by
// `PageKey`, not applied to the shared cache, until commit -- this is what
// lets concurrent readers keep seeing a consistent snapshot without any
// per-page versioning. Commit flushes the overlay's WAL records, fsyncs per
// the configured durability policy, then applies the overlay to the shared
// cache and releases the write lock.

use crate::buffer::{PageCache, PageKey, PageSource};
use crate::common::{LogSequenceNumber, TransactionId};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::snapshot::SnapshotRegistry;
use super::types::{Transaction, TransactionState};
use super::wal_manager::{WalEntryKind, WalManager};
use super::write_lock::{CancellationToken, WriteLock, WriteLockGuard};

struct WriterSession {
    txn: Transaction,
    guard: WriteLockGuard,
    overlay: HashMap<PageKey, Vec<u8>>,
}

pub struct TransactionManager {
    next_txn_id: Mutex<TransactionId>,
    write_lock: Arc<WriteLock>,
    snapshots: Mutex<SnapshotRegistry>,
    wal: Mutex<WalManager>,
    writer: Mutex<Option<WriterSession>>,
    write_lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(wal: WalManager, write_lock_timeout: Duration) -> Self {
        Self {
            next_txn_id: Mutex::new(1),
            write_lock: Arc::new(WriteLock::new()),
            snapshots: Mutex::new(SnapshotRegistry::new()),
            wal: Mutex::new(wal),
            writer: Mutex::new(None),
            write_lock_timeout,
        }
    }

    fn next_id(&self) -> TransactionId {
        let mut next = self.next_txn_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    pub fn current_lsn(&self) -> LogSequenceNumber {
        self.wal.lock().current_lsn()
    }

    /// Captures a reader's snapshot at the current durable LSN.
    pub fn begin_reader(&self) -> Transaction {
        let id = self.next_id();
        let snapshot_lsn = self.wal.lock().current_lsn().saturating_sub(1);
        let txn = Transaction::new_reader(id, snapshot_lsn);
        self.snapshots.lock().register(id, snapshot_lsn);
        txn
    }

    pub fn end_reader(&self, txn: &Transaction) {
        self.snapshots.lock().release(txn.id);
    }

    pub fn open_reader_count(&self) -> usize {
        self.snapshots.lock().open_count()
    }

    /// Blocks until the write lock is free (FIFO, bounded by the configured
    /// timeout or an explicit cancellation), then writes `TxnBegin`.
    pub fn begin_writer(&self, cancel: &CancellationToken) -> Result<Transaction> {
        let guard = self.write_lock.acquire(self.write_lock_timeout, cancel)?;
        let id = self.next_id();
        let start_lsn = self.wal.lock().append(id, WalEntryKind::TxnBegin)?;
        let txn = Transaction::new_writer(id, start_lsn);
        *self.writer.lock() = Some(WriterSession { txn: txn.clone(), guard, overlay: HashMap::new() });
        tracing::debug!(txn_id = id, start_lsn, "writer transaction began");
        Ok(txn)
    }

    /// Buffers a page write against the active writer's overlay. Invisible
    /// to the shared cache and to readers until commit.
    pub fn buffer_write(&self, txn_id: TransactionId, key: PageKey, data: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock();
        let session = writer
            .as_mut()
            .filter(|s| s.txn.id == txn_id)
            .ok_or_else(|| DbError::Internal(format!("no active writer session for txn {txn_id}")))?;
        session.overlay.insert(key, data);
        Ok(())
    }

    /// Reads a page as the given writer would see it: its own buffered
    /// overlay first, `None` if it hasn't touched that page (caller falls
    /// back to the shared cache).
    pub fn overlay_read(&self, txn_id: TransactionId, key: PageKey) -> Option<Vec<u8>> {
        self.writer
            .lock()
            .as_ref()
            .filter(|s| s.txn.id == txn_id)
            .and_then(|s| s.overlay.get(&key))
            .cloned()
    }

    /// Commits the active writer: flushes its buffered pages' WAL records,
    /// fsyncs per policy, applies the overlay to the shared cache, and
    /// releases the write lock.
    pub fn commit_writer(
        &self,
        txn_id: TransactionId,
        source: &mut dyn PageSource,
        cache: &mut PageCache,
    ) -> Result<LogSequenceNumber> {
        let mut session = self.take_writer_session(txn_id)?;

        {
            let mut wal = self.wal.lock();
            for (key, bytes) in &session.overlay {
                let lsn = wal.append(
                    txn_id,
                    WalEntryKind::PageWrite { page_id: key.page_id, before: None, after: bytes.clone() },
                )?;
                session.txn.record_lsn(lsn);
            }
            let commit_lsn = wal.commit(txn_id)?;
            session.txn.record_lsn(commit_lsn);
            cache.advance_durable_lsn(commit_lsn);
        }

        for (key, bytes) in session.overlay.drain() {
            cache.pin(source, key)?;
            if let Some(slot) = cache.write(key, session.txn.last_lsn) {
                slot.copy_from_slice(&bytes);
            }
            cache.unpin(key, true)?;
        }

        session.txn.state = TransactionState::Committed;
        tracing::info!(txn_id, commit_lsn = session.txn.last_lsn, "writer transaction committed");
        Ok(session.txn.last_lsn)
    }

    /// Aborts the active writer: drops its buffered pages and records an
    /// audit-only `TxnAbort`.
    pub fn abort_writer(&self, txn_id: TransactionId) -> Result<()> {
        let mut session = self.take_writer_session(txn_id)?;
        session.overlay.clear();
        session.txn.state = TransactionState::Aborted;
        self.wal.lock().append(txn_id, WalEntryKind::TxnAbort)?;
        tracing::warn!(txn_id, "writer transaction aborted");
        Ok(())
    }

    fn take_writer_session(&self, txn_id: TransactionId) -> Result<WriterSession> {
        let mut slot = self.writer.lock();
        match slot.take() {
            Some(session) if session.txn.id == txn_id => Ok(session),
            Some(other) => {
                let found = other.txn.id;
                *slot = Some(other);
                Err(DbError::Internal(format!("txn {txn_id} is not the active writer (active: {found})")))
            }
            None => Err(DbError::Internal(format!("no active writer session for txn {txn_id}"))),
        }
    }

    pub fn active_writer_id(&self) -> Option<TransactionId> {
        self.writer.lock().as_ref().map(|s| s.txn.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;
    use crate::config::WalDurability;
    use std::collections::HashMap as StdMap;
    use tempfile::NamedTempFile;

    struct FakeSource {
        pages: StdMap<(u64, PageId), Vec<u8>>,
    }

    fn blank_page() -> Vec<u8> {
        vec![0u8; 64]
    }

    impl PageSource for FakeSource {
        fn fetch_page(&mut self, block: u64, page_id: PageId) -> Result<Vec<u8>> {
            Ok(self.pages.get(&(block, page_id)).cloned().unwrap_or_else(blank_page))
        }
        fn write_page(&mut self, block: u64, page_id: PageId, data: &[u8]) -> Result<()> {
            self.pages.insert((block, page_id), data.to_vec());
            Ok(())
        }
    }

    fn new_manager() -> TransactionManager {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).ok();
        let wal = WalManager::create(&path, 64 * 1024, 256, WalDurability::FullSync).unwrap();
        TransactionManager::new(wal, Duration::from_millis(200))
    }

    #[test]
    fn writer_overlay_is_invisible_until_commit() {
        let tm = new_manager();
        let token = CancellationToken::new();
        let txn = tm.begin_writer(&token).unwrap();
        let key = PageKey::new(0, 1);
        tm.buffer_write(txn.id, key, vec![9u8; 64]).unwrap();

        assert_eq!(tm.overlay_read(txn.id, key), Some(vec![9u8; 64]));

        let mut cache = PageCache::new(4);
        let mut source = FakeSource { pages: StdMap::new() };
        assert!(cache.read(key).is_none());

        tm.commit_writer(txn.id, &mut source, &mut cache).unwrap();
        assert_eq!(cache.read(key).unwrap(), &[9u8; 64][..]);
    }

    #[test]
    fn second_writer_blocks_until_first_commits() {
        let tm = new_manager();
        let token = CancellationToken::new();
        let txn1 = tm.begin_writer(&token).unwrap();

        let err = tm.begin_writer(&token).unwrap_err();
        assert!(matches!(err, DbError::WriteLockTimeout { .. }));

        let mut cache = PageCache::new(4);
        let mut source = FakeSource { pages: StdMap::new() };
        tm.commit_writer(txn1.id, &mut source, &mut cache).unwrap();

        let txn2 = tm.begin_writer(&token).unwrap();
        assert_ne!(txn1.id, txn2.id);
    }

    #[test]
    fn abort_discards_overlay() {
        let tm = new_manager();
        let token = CancellationToken::new();
        let txn = tm.begin_writer(&token).unwrap();
        let key = PageKey::new(0, 1);
        tm.buffer_write(txn.id, key, vec![1u8; 64]).unwrap();
        tm.abort_writer(txn.id).unwrap();

        let token2 = CancellationToken::new();
        let txn2 = tm.begin_writer(&token2).unwrap();
        assert_eq!(tm.overlay_read(txn2.id, key), None);
    }

    #[test]
    fn reader_snapshot_matches_durable_lsn() {
        let tm = new_manager();
        let reader = tm.begin_reader();
        assert_eq!(tm.open_reader_count(), 1);
        tm.end_reader(&reader);
        assert_eq!(tm.open_reader_count(), 0);
    }
}
