// Slotted page layout.
//
// ```text
// byte 0  ┌─────────────── header (24 bytes) ───────────────┐
//         │ page_id:u64 │ lsn:u64 │ type:u8 │ slots:u16 │ free:u16 │ pad │
//         ├─────────────── slot directory (grows →) ─────────┤
//         │ (offset:u16, length:u16) × slot_count             │
//         │                     ...free space...               │
//         ├─────────────── row bytes (grows ←) ───────────────┤
//         └─────────── CRC-32C footer (4 bytes) ──────────────┘
// ```
//
// Slot directory entries never shrink: a deleted row becomes a
// `(0, 0)` tombstone so existing row ids stay stable until the page is
// compacted.

use crate::common::PageId;
use crate::error::{CorruptionDetail, DbError, Result};
use crate::storage::checksum::hardware_crc32c;

pub const HEADER_SIZE: usize = 24;
pub const FOOTER_SIZE: usize = 4;
pub const SLOT_ENTRY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    TableHeap = 0,
    BTreeInternal = 1,
    BTreeLeaf = 2,
    HashBucket = 3,
    Overflow = 4,
}

impl PageType {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageType::TableHeap,
            1 => PageType::BTreeInternal,
            2 => PageType::BTreeLeaf,
            3 => PageType::HashBucket,
            4 => PageType::Overflow,
            other => return Err(DbError::PageCorrupt(CorruptionDetail::new(format!(
                "unknown page type tag {other}"
            )))),
        })
    }
}

pub struct SlottedPage {
    buf: Vec<u8>,
}

impl SlottedPage {
    pub fn new(page_id: PageId, page_size: usize, page_type: PageType) -> Self {
        let mut buf = vec![0u8; page_size];
        buf[0..8].copy_from_slice(&page_id.to_le_bytes());
        buf[8..16].copy_from_slice(&0u64.to_le_bytes()); // lsn
        buf[16] = page_type as u8;
        let free_space_offset = (page_size - FOOTER_SIZE) as u16;
        buf[18..20].copy_from_slice(&0u16.to_le_bytes()); // slot_count
        buf[20..22].copy_from_slice(&free_space_offset.to_le_bytes());
        Self { buf }
    }

    pub fn from_bytes(buf: Vec<u8>, expect_page_id: PageId) -> Result<Self> {
        if buf.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(DbError::PageCorrupt(CorruptionDetail::new("page shorter than header+footer")));
        }
        let footer_at = buf.len() - FOOTER_SIZE;
        let stored_crc = u32::from_le_bytes(buf[footer_at..].try_into().unwrap());
        let actual_crc = hardware_crc32c(&buf[..footer_at]);
        if stored_crc != actual_crc {
            return Err(DbError::PageCorrupt(
                CorruptionDetail::new(format!("page {expect_page_id}"))
                    .with_checksums(stored_crc, actual_crc),
            ));
        }
        let page = Self { buf };
        if page.page_id() != expect_page_id {
            return Err(DbError::PageCorrupt(CorruptionDetail::new(format!(
                "page id mismatch: on-disk {} but expected {}",
                page.page_id(),
                expect_page_id
            ))));
        }
        PageType::from_u8(page.buf[16])?;
        Ok(page)
    }

    pub fn page_id(&self) -> PageId {
        u64::from_le_bytes(self.buf[0..8].try_into().unwrap())
    }

    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.buf[8..16].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.buf[8..16].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.buf[16]).expect("validated at construction")
    }

    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes(self.buf[18..20].try_into().unwrap())
    }

    fn set_slot_count(&mut self, n: u16) {
        self.buf[18..20].copy_from_slice(&n.to_le_bytes());
    }

    fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes(self.buf[20..22].try_into().unwrap())
    }

    fn set_free_space_offset(&mut self, offset: u16) {
        self.buf[20..22].copy_from_slice(&offset.to_le_bytes());
    }

    fn slot_entry_at(&self, index: u16) -> (u16, u16) {
        let start = HEADER_SIZE + index as usize * SLOT_ENTRY_SIZE;
        let offset = u16::from_le_bytes(self.buf[start..start + 2].try_into().unwrap());
        let length = u16::from_le_bytes(self.buf[start + 2..start + 4].try_into().unwrap());
        (offset, length)
    }

    fn write_slot_entry(&mut self, index: u16, offset: u16, length: u16) {
        let start = HEADER_SIZE + index as usize * SLOT_ENTRY_SIZE;
        self.buf[start..start + 2].copy_from_slice(&offset.to_le_bytes());
        self.buf[start + 2..start + 4].copy_from_slice(&length.to_le_bytes());
    }

    pub fn free_space(&self) -> usize {
        let directory_end = HEADER_SIZE + self.slot_count() as usize * SLOT_ENTRY_SIZE;
        (self.free_space_offset() as usize).saturating_sub(directory_end)
    }

    /// Insert row bytes, returning the new slot index, or `None` if the page
    /// lacks room for both the row bytes and a new directory entry.
    pub fn insert(&mut self, row: &[u8]) -> Option<u16> {
        let needed = row.len() + SLOT_ENTRY_SIZE;
        if self.free_space() < needed {
            return None;
        }
        let new_data_offset = self.free_space_offset() as usize - row.len();
        self.buf[new_data_offset..new_data_offset + row.len()].copy_from_slice(row);
        let slot_index = self.slot_count();
        self.write_slot_entry(slot_index, new_data_offset as u16, row.len() as u16);
        self.set_slot_count(slot_index + 1);
        self.set_free_space_offset(new_data_offset as u16);
        Some(slot_index)
    }

    pub fn get(&self, slot: u16) -> Option<&[u8]> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, length) = self.slot_entry_at(slot);
        if length == 0 {
            return None; // tombstoned
        }
        Some(&self.buf[offset as usize..offset as usize + length as usize])
    }

    /// Tombstone a slot. The directory entry stays so row ids already handed
    /// out elsewhere (indexes, overflow pointers) don't dangle into a
    /// different row after compaction.
    pub fn delete(&mut self, slot: u16) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        self.write_slot_entry(slot, 0, 0);
        true
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.slot_count()).filter_map(move |i| self.get(i).map(|d| (i, d)))
    }

    /// Write the CRC-32C footer and return the finished page bytes.
    pub fn finalize(mut self) -> Vec<u8> {
        let footer_at = self.buf.len() - FOOTER_SIZE;
        let crc = hardware_crc32c(&self.buf[..footer_at]);
        self.buf[footer_at..].copy_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_back() {
        let mut p = SlottedPage::new(1, 256, PageType::TableHeap);
        let slot = p.insert(b"hello").unwrap();
        assert_eq!(p.get(slot), Some(&b"hello"[..]));
    }

    #[test]
    fn delete_tombstones_without_renumbering() {
        let mut p = SlottedPage::new(1, 256, PageType::TableHeap);
        let a = p.insert(b"aaa").unwrap();
        let b = p.insert(b"bbb").unwrap();
        p.delete(a);
        assert!(p.get(a).is_none());
        assert_eq!(p.get(b), Some(&b"bbb"[..]));
        assert_eq!(p.slot_count(), 2);
    }

    #[test]
    fn insert_fails_when_full() {
        let mut p = SlottedPage::new(1, HEADER_SIZE + FOOTER_SIZE + 10, PageType::TableHeap);
        assert!(p.insert(&[0u8; 20]).is_none());
    }

    #[test]
    fn finalize_then_reload_validates_checksum() {
        let mut p = SlottedPage::new(7, 256, PageType::TableHeap);
        p.insert(b"row").unwrap();
        let bytes = p.finalize();
        let reloaded = SlottedPage::from_bytes(bytes, 7).unwrap();
        assert_eq!(reloaded.get(0), Some(&b"row"[..]));
    }

    #[test]
    fn reload_detects_corruption() {
        let p = SlottedPage::new(1, 256, PageType::TableHeap);
        let mut bytes = p.finalize();
        bytes[5] ^= 0xFF;
        assert!(SlottedPage::from_bytes(bytes, 1).is_err());
    }

    #[test]
    fn reload_detects_page_id_mismatch() {
        let p = SlottedPage::new(1, 256, PageType::TableHeap);
        let bytes = p.finalize();
        assert!(SlottedPage::from_bytes(bytes, 2).is_err());
    }
}
