// Write-ahead log: a fixed-capacity circular buffer of slot-aligned entries.
//
// ```text
// byte 0  ┌── WAL file header (64 B) ──┐
//         │ magic │ version │ slot_size │ capacity_slots │ lsn │ head │ tail │ ckpt_lsn │ crc │
//         ├── slot 0 ── slot 1 ── ... ── slot (capacity_slots-1) ──┤
// ```
//
// Each entry occupies one or more whole slots: a 64-byte entry header
// {type, length, txn_id, lsn, crc32c} followed by its bincode-encoded
// payload, zero-padded up to a slot boundary. An entry whose slots would
// wrap past the end of the buffer is never split mid-entry: the remaining
// slots before the end are marked `Pad` and the entry restarts at slot 0.

use crate::common::{LogSequenceNumber, PageId, TransactionId};
pub use crate::config::WalDurability;
use crate::error::{CorruptionDetail, DbError, Result};
use crate::storage::checksum::hardware_crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use uuid::Uuid;

pub const WAL_FILE_HEADER_LEN: usize = 64;
pub const ENTRY_HEADER_LEN: usize = 64;
pub const DEFAULT_SLOT_SIZE: u32 = 4096;
const MAGIC: &[u8; 4] = b"WLOG";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalEntryKind {
    TxnBegin,
    TxnCommit,
    TxnAbort,
    PageWrite { page_id: PageId, before: Option<Vec<u8>>, after: Vec<u8> },
    AllocPages { start: PageId, count: u32 },
    FreePages { start: PageId, count: u32 },
    BlobWrite { blob_id: Uuid, size: u64, digest: [u8; 32] },
    Checkpoint { checkpoint_lsn: LogSequenceNumber },
    Pad,
}

fn type_tag(kind: &WalEntryKind) -> u8 {
    match kind {
        WalEntryKind::TxnBegin => 0,
        WalEntryKind::TxnCommit => 1,
        WalEntryKind::TxnAbort => 2,
        WalEntryKind::PageWrite { .. } => 3,
        WalEntryKind::AllocPages { .. } => 4,
        WalEntryKind::FreePages { .. } => 5,
        WalEntryKind::BlobWrite { .. } => 6,
        WalEntryKind::Checkpoint { .. } => 7,
        WalEntryKind::Pad => 255,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub txn_id: TransactionId,
    pub lsn: LogSequenceNumber,
    pub kind: WalEntryKind,
}

struct WalFileHeader {
    slot_size: u32,
    capacity_slots: u64,
    lsn: LogSequenceNumber,
    head_slot: u64,
    tail_slot: u64,
    last_checkpoint_lsn: LogSequenceNumber,
}

impl WalFileHeader {
    fn encode(&self) -> [u8; WAL_FILE_HEADER_LEN] {
        let mut buf = [0u8; WAL_FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[8..12].copy_from_slice(&self.slot_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity_slots.to_le_bytes());
        buf[20..28].copy_from_slice(&self.lsn.to_le_bytes());
        buf[28..36].copy_from_slice(&self.head_slot.to_le_bytes());
        buf[36..44].copy_from_slice(&self.tail_slot.to_le_bytes());
        buf[44..52].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        let crc = hardware_crc32c(&buf[..52]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_FILE_HEADER_LEN || &buf[0..4] != MAGIC {
            return Err(DbError::WalCorrupt(CorruptionDetail::new("bad wal magic")));
        }
        if buf[4] != VERSION {
            return Err(DbError::UnsupportedVersion(format!("wal version {}", buf[4])));
        }
        let stored = u32::from_le_bytes(buf[52..56].try_into().unwrap());
        let actual = hardware_crc32c(&buf[..52]);
        if stored != actual {
            return Err(DbError::WalCorrupt(
                CorruptionDetail::new("wal file header").with_checksums(stored, actual),
            ));
        }
        Ok(Self {
            slot_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            capacity_slots: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            lsn: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            head_slot: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            tail_slot: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            last_checkpoint_lsn: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
        })
    }
}

pub struct WalManager {
    file: File,
    header: WalFileHeader,
    durability: WalDurability,
    pending_commits: u32,
    group_commit_batch: u32,
}

impl WalManager {
    pub fn create(path: &Path, capacity_bytes: u64, slot_size: u32, durability: WalDurability) -> Result<Self> {
        let file = OpenOptions::new().create(true).truncate(true).read(true).write(true).open(path)?;
        let capacity_slots = (capacity_bytes.saturating_sub(WAL_FILE_HEADER_LEN as u64)) / slot_size as u64;
        let header = WalFileHeader {
            slot_size,
            capacity_slots: capacity_slots.max(1),
            lsn: 1,
            head_slot: 0,
            tail_slot: 0,
            last_checkpoint_lsn: 0,
        };
        let mut manager = Self { file, header, durability, pending_commits: 0, group_commit_batch: 8 };
        manager.persist_header()?;
        let total_len = WAL_FILE_HEADER_LEN as u64 + manager.header.capacity_slots * slot_size as u64;
        manager.file.set_len(total_len)?;
        Ok(manager)
    }

    pub fn open(path: &Path, durability: WalDurability) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; WAL_FILE_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = WalFileHeader::decode(&buf)?;
        Ok(Self { file, header, durability, pending_commits: 0, group_commit_batch: 8 })
    }

    fn persist_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        Ok(())
    }

    pub fn current_lsn(&self) -> LogSequenceNumber {
        self.header.lsn
    }

    pub fn last_checkpoint_lsn(&self) -> LogSequenceNumber {
        self.header.last_checkpoint_lsn
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        WAL_FILE_HEADER_LEN as u64 + slot * self.header.slot_size as u64
    }

    fn slots_needed(&self, total_len: usize) -> u64 {
        let slot = self.header.slot_size as usize;
        ((total_len + slot - 1) / slot) as u64
    }

    /// Appends an entry, returning its assigned LSN. Does not fsync; call
    /// `flush` (directly, or via `commit`) for durability.
    pub fn append(&mut self, txn_id: TransactionId, kind: WalEntryKind) -> Result<LogSequenceNumber> {
        let lsn = self.header.lsn;
        self.header.lsn += 1;
        self.write_entry(&WalEntry { txn_id, lsn, kind })?;
        Ok(lsn)
    }

    fn write_entry(&mut self, entry: &WalEntry) -> Result<()> {
        let payload = bincode::serde::encode_to_vec(&entry.kind, bincode::config::standard())?;
        let total_len = ENTRY_HEADER_LEN + payload.len();
        let needed = self.slots_needed(total_len);
        if needed > self.header.capacity_slots {
            return Err(DbError::NoSpace { requested: total_len as u32 });
        }

        if self.header.tail_slot + needed > self.header.capacity_slots {
            self.write_pad(self.header.capacity_slots - self.header.tail_slot)?;
            self.header.tail_slot = 0;
        }
        self.check_not_overwriting_unckeckpointed(needed)?;

        let mut buf = vec![0u8; (needed * self.header.slot_size as u64) as usize];
        buf[0] = type_tag(&entry.kind);
        buf[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[5..13].copy_from_slice(&entry.txn_id.to_le_bytes());
        buf[13..21].copy_from_slice(&entry.lsn.to_le_bytes());
        buf[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + payload.len()].copy_from_slice(&payload);
        // crc covers the header (minus its own crc field) plus the payload; any
        // trailing slot padding beyond the payload is not covered, matching
        // what the reader reconstructs in `scan_from`.
        let mut crc_input = Vec::with_capacity(21 + (ENTRY_HEADER_LEN - 25) + payload.len());
        crc_input.extend_from_slice(&buf[0..21]);
        crc_input.extend_from_slice(&buf[25..ENTRY_HEADER_LEN]);
        crc_input.extend_from_slice(&payload);
        let crc = hardware_crc32c(&crc_input);
        buf[21..25].copy_from_slice(&crc.to_le_bytes());

        let offset = self.slot_offset(self.header.tail_slot);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.header.tail_slot += needed;
        self.persist_header()?;
        Ok(())
    }

    fn write_pad(&mut self, slots: u64) -> Result<()> {
        if slots == 0 {
            return Ok(());
        }
        let buf = vec![0u8; (slots * self.header.slot_size as u64) as usize];
        let offset = self.slot_offset(self.header.tail_slot);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn check_not_overwriting_unckeckpointed(&self, needed: u64) -> Result<()> {
        let head = self.header.head_slot;
        let tail = self.header.tail_slot;
        if tail < head && tail + needed > head {
            return Err(DbError::NoSpace { requested: (needed * self.header.slot_size as u64) as u32 });
        }
        Ok(())
    }

    /// Fsyncs the WAL file; entries appended before this call are durable
    /// past their LSN once this returns.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.pending_commits = 0;
        Ok(())
    }

    /// Appends a `TxnCommit` entry and applies the configured durability
    /// mode's fsync policy. Returns the commit's LSN once it's safe to
    /// report the transaction durable (or immediately, under `Async`).
    pub fn commit(&mut self, txn_id: TransactionId) -> Result<LogSequenceNumber> {
        let lsn = self.append(txn_id, WalEntryKind::TxnCommit)?;
        match self.durability {
            WalDurability::FullSync => self.flush()?,
            WalDurability::GroupCommit => {
                self.pending_commits += 1;
                if self.pending_commits >= self.group_commit_batch {
                    self.flush()?;
                } else {
                    self.file.sync_all()?;
                    self.pending_commits = 0;
                }
            }
            WalDurability::Async => {}
        }
        Ok(lsn)
    }

    pub fn advance_checkpoint(&mut self, lsn: LogSequenceNumber, head_slot: u64) -> Result<()> {
        self.header.last_checkpoint_lsn = lsn;
        self.header.head_slot = head_slot;
        self.persist_header()
    }

    /// Reads entries from `from_slot` forward to the current tail, stopping
    /// at the first checksum failure (the rest of the tail is treated as an
    /// uncommitted, partially-written crash tail).
    pub fn scan_from(&mut self, from_slot: u64) -> Result<Vec<(u64, WalEntry)>> {
        let mut out = Vec::new();
        let mut slot = from_slot;
        while slot < self.header.tail_slot {
            let offset = self.slot_offset(slot);
            self.file.seek(SeekFrom::Start(offset))?;
            let mut header_buf = [0u8; ENTRY_HEADER_LEN];
            self.file.read_exact(&mut header_buf)?;
            let tag = header_buf[0];
            let length = u32::from_le_bytes(header_buf[1..5].try_into().unwrap()) as usize;
            if tag == 255 {
                slot = self.header.capacity_slots;
                continue;
            }
            let txn_id = u64::from_le_bytes(header_buf[5..13].try_into().unwrap());
            let lsn = u64::from_le_bytes(header_buf[13..21].try_into().unwrap());
            let stored_crc = u32::from_le_bytes(header_buf[21..25].try_into().unwrap());

            let needed = self.slots_needed(ENTRY_HEADER_LEN + length);
            let mut payload = vec![0u8; length];
            self.file.read_exact(&mut payload)?;

            let mut crc_input = Vec::with_capacity(ENTRY_HEADER_LEN - 4 + length);
            crc_input.extend_from_slice(&header_buf[0..21]);
            crc_input.extend_from_slice(&header_buf[25..]);
            crc_input.extend_from_slice(&payload);
            let actual_crc = hardware_crc32c(&crc_input);
            if actual_crc != stored_crc {
                tracing::warn!(slot, "wal checksum mismatch, truncating scan at first torn write");
                break;
            }

            let kind: WalEntryKind = match bincode::serde::decode_from_slice(&payload, bincode::config::standard()) {
                Ok((kind, _)) => kind,
                Err(_) => {
                    tracing::warn!(slot, "wal entry failed to decode, truncating scan");
                    break;
                }
            };
            out.push((slot, WalEntry { txn_id, lsn, kind }));
            slot += needed;
        }
        Ok(out)
    }

    pub fn tail_slot(&self) -> u64 {
        self.header.tail_slot
    }

    pub fn head_slot(&self) -> u64 {
        self.header.head_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_manager(durability: WalDurability) -> WalManager {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).ok();
        WalManager::create(&path, 64 * 1024, 256, durability).unwrap()
    }

    #[test]
    fn append_and_scan_round_trips() {
        let mut wal = new_manager(WalDurability::FullSync);
        wal.append(1, WalEntryKind::TxnBegin).unwrap();
        wal.append(1, WalEntryKind::PageWrite { page_id: 5, before: None, after: vec![1, 2, 3] }).unwrap();
        wal.commit(1).unwrap();

        let entries = wal.scan_from(0).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0].1.kind, WalEntryKind::TxnBegin));
        assert!(matches!(entries[2].1.kind, WalEntryKind::TxnCommit));
    }

    #[test]
    fn corrupted_entry_truncates_scan() {
        let mut wal = new_manager(WalDurability::FullSync);
        wal.append(1, WalEntryKind::TxnBegin).unwrap();
        wal.append(1, WalEntryKind::TxnCommit).unwrap();
        wal.flush().unwrap();

        let offset = WAL_FILE_HEADER_LEN as u64 + 256;
        wal.file.seek(SeekFrom::Start(offset + 30)).unwrap();
        wal.file.write_all(&[0xFFu8; 4]).unwrap();

        let entries = wal.scan_from(0).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn group_commit_flushes_after_batch_size() {
        let mut wal = new_manager(WalDurability::GroupCommit);
        wal.group_commit_batch = 2;
        for _ in 0..3 {
            wal.append(1, WalEntryKind::TxnBegin).unwrap();
            wal.commit(1).unwrap();
        }
        assert_eq!(wal.pending_commits, 1);
    }

    #[test]
    fn async_mode_never_blocks_on_fsync() {
        let mut wal = new_manager(WalDurability::Async);
        wal.append(1, WalEntryKind::TxnBegin).unwrap();
        wal.commit(1).unwrap();
    }
}
