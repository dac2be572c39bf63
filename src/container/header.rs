// Fixed-size file header at offset 0 of every container file.

use crate::error::{DbError, Result};
use crate::storage::checksum::hardware_crc32c;

pub const MAGIC: &[u8; 4] = b"SCDB";
pub const CURRENT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 96;

/// Pages in this container are AES-256-GCM sealed; see `container::crypto`.
pub const FLAG_ENCRYPTED: u32 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub registry_offset: u64,
    pub registry_length: u64,
    pub created_at_unix: i64,
    pub wal_head: u64,
    pub wal_tail: u64,
    pub last_checkpoint_lsn: u64,
}

impl FileHeader {
    pub fn new(page_size: u32, created_at_unix: i64) -> Self {
        Self {
            version: CURRENT_VERSION,
            page_size,
            flags: 0,
            registry_offset: 0,
            registry_length: 0,
            created_at_unix,
            wal_head: 0,
            wal_tail: 0,
            last_checkpoint_lsn: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        if encrypted {
            self.flags |= FLAG_ENCRYPTED;
        } else {
            self.flags &= !FLAG_ENCRYPTED;
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.registry_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.registry_length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.created_at_unix.to_le_bytes());
        buf[40..48].copy_from_slice(&self.wal_head.to_le_bytes());
        buf[48..56].copy_from_slice(&self.wal_tail.to_le_bytes());
        buf[56..64].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        let crc = hardware_crc32c(&buf[0..64]);
        buf[64..68].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DbError::CorruptHeader("truncated header".into()));
        }
        if &buf[0..4] != MAGIC {
            return Err(DbError::CorruptHeader("bad magic bytes".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != CURRENT_VERSION {
            return Err(DbError::UnsupportedVersion(format!(
                "container version {version}, this build supports {CURRENT_VERSION}"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[64..68].try_into().unwrap());
        let actual_crc = hardware_crc32c(&buf[0..64]);
        if stored_crc != actual_crc {
            return Err(DbError::CorruptHeader(format!(
                "header checksum mismatch: expected {stored_crc:#010x}, found {actual_crc:#010x}"
            )));
        }
        let page_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let registry_offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let registry_length = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let created_at_unix = i64::from_le_bytes(buf[32..40].try_into().unwrap());
        let wal_head = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let wal_tail = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let last_checkpoint_lsn = u64::from_le_bytes(buf[56..64].try_into().unwrap());
        Ok(Self {
            version,
            page_size,
            flags,
            registry_offset,
            registry_length,
            created_at_unix,
            wal_head,
            wal_tail,
            last_checkpoint_lsn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut h = FileHeader::new(4096, 1_700_000_000);
        h.wal_head = 10;
        h.wal_tail = 9000;
        h.last_checkpoint_lsn = 500;
        let encoded = h.encode();
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(b"NOPE");
        assert!(FileHeader::decode(&buf).is_err());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let h = FileHeader::new(4096, 0);
        let mut encoded = h.encode();
        encoded[10] ^= 0xFF;
        assert!(matches!(FileHeader::decode(&encoded), Err(DbError::CorruptHeader(_))));
    }
}
