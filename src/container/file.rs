// Top-level container file: header + block registry + page region.
//
// The header lives at byte 0 and points at the registry's extent directly
// (not through the registry itself, which would be circular). Everything
// else a caller wants -- the WAL circular buffer, table/index page ranges,
// the optional blob subtree -- is a named block whose extent is looked up
// through the registry.

use super::crypto;
use super::fsm::{FitStrategy, FreeSpaceMap};
use super::header::{FileHeader, HEADER_LEN};
use super::registry::{BlockRegistry, Extent};
use crate::buffer::PageSource;
use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::checksum::hardware_crc32c;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct ContainerFile {
    file: File,
    header: FileHeader,
    registry: BlockRegistry,
    fsm: FreeSpaceMap,
    page_size: u32,
    encryption_key: Option<[u8; 32]>,
}

impl ContainerFile {
    pub fn create(path: impl AsRef<Path>, page_size: u32, created_at_unix: i64) -> Result<Self> {
        Self::create_with_key(path, page_size, created_at_unix, None)
    }

    /// Same as `create`, but seals every page on disk with AES-256-GCM under
    /// `encryption_key` when given. The on-disk stride per page grows by
    /// `crypto::OVERHEAD` bytes; callers above this layer still only ever
    /// see `page_size`-length plaintext.
    pub fn create_with_key(
        path: impl AsRef<Path>,
        page_size: u32,
        created_at_unix: i64,
        encryption_key: Option<[u8; 32]>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut header = FileHeader::new(page_size, created_at_unix);
        header.set_encrypted(encryption_key.is_some());
        let mut container = Self {
            file,
            header,
            registry: BlockRegistry::new(),
            fsm: FreeSpaceMap::new(0),
            page_size,
            encryption_key,
        };
        container.write_header()?;
        container.flush_registry()?;
        container.file.sync_all()?;
        Ok(container)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_key(path, None)
    }

    /// Opens a container that may have been created with an encryption key.
    /// `encryption_key` must be `Some` iff the stored header's encrypted
    /// flag is set; a mismatch is an error rather than a silent fallback to
    /// reading sealed bytes as plaintext.
    pub fn open_with_key(path: impl AsRef<Path>, encryption_key: Option<[u8; 32]>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_buf = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;

        if header.is_encrypted() != encryption_key.is_some() {
            return Err(DbError::Encryption(
                "encryption key presence does not match the container's encrypted flag".into(),
            ));
        }

        let registry = if header.registry_length == 0 {
            BlockRegistry::new()
        } else {
            let mut buf = vec![0u8; header.registry_length as usize];
            file.seek(SeekFrom::Start(header.registry_offset))?;
            file.read_exact(&mut buf)?;
            BlockRegistry::decode(&buf)?
        };

        let file_len = file.metadata()?.len();
        let stride = Self::page_stride(header.page_size, encryption_key.is_some());
        let page_region_start = HEADER_LEN as u64 + header.registry_length.max(4096);
        let total_pages = if file_len > page_region_start {
            (file_len - page_region_start) / stride
        } else {
            0
        };

        Ok(Self {
            file,
            header,
            registry,
            fsm: FreeSpaceMap::new(total_pages),
            page_size: header.page_size,
            encryption_key,
        })
    }

    fn page_stride(page_size: u32, encrypted: bool) -> u64 {
        page_size as u64 + if encrypted { crypto::OVERHEAD as u64 } else { 0 }
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        Ok(())
    }

    fn page_region_start(&self) -> u64 {
        HEADER_LEN as u64 + self.header.registry_length.max(4096)
    }

    pub fn flush_registry(&mut self) -> Result<()> {
        let bytes = self.registry.encode()?;
        let offset = HEADER_LEN as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        self.header.registry_offset = offset;
        self.header.registry_length = bytes.len() as u64;
        self.write_header()?;
        Ok(())
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut BlockRegistry {
        &mut self.registry
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn allocate_pages(&mut self, count: u64) -> crate::common::PageId {
        self.fsm.allocate(count, FitStrategy::Best)
    }

    pub fn free_pages(&mut self, start: crate::common::PageId, count: u64) {
        self.fsm.free(start, count);
    }

    pub fn free_page_count(&self) -> u64 {
        self.fsm.free_page_count()
    }

    pub fn read_page(&mut self, page_id: crate::common::PageId) -> Result<Vec<u8>> {
        let stride = Self::page_stride(self.page_size, self.encryption_key.is_some());
        let offset = self.page_region_start() + page_id * stride;
        let mut buf = vec![0u8; stride as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        match &self.encryption_key {
            Some(key) => crypto::decrypt_page(key, page_id, &buf),
            None => Ok(buf),
        }
    }

    pub fn write_page(&mut self, page_id: crate::common::PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size as usize {
            return Err(DbError::Internal(format!(
                "write_page: expected {} bytes, got {}",
                self.page_size,
                data.len()
            )));
        }
        let stride = Self::page_stride(self.page_size, self.encryption_key.is_some());
        let on_disk = match &self.encryption_key {
            Some(key) => crypto::encrypt_page(key, page_id, data)?,
            None => data.to_vec(),
        };
        let offset = self.page_region_start() + page_id * stride;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&on_disk)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn set_wal_bounds(&mut self, head: u64, tail: u64) {
        self.header.wal_head = head;
        self.header.wal_tail = tail;
    }

    pub fn set_last_checkpoint_lsn(&mut self, lsn: u64) {
        self.header.last_checkpoint_lsn = lsn;
    }

    pub fn persist_header(&mut self) -> Result<()> {
        self.write_header()
    }

    pub fn checksum_page(data: &[u8]) -> u32 {
        hardware_crc32c(data)
    }
}

/// A container only ever backs one block of pages, so `block` is ignored;
/// the parameter exists on the trait for sources that multiplex several
/// page spaces over one cache.
impl PageSource for ContainerFile {
    fn fetch_page(&mut self, _block: u64, page_id: PageId) -> Result<Vec<u8>> {
        self.read_page(page_id)
    }

    fn write_page(&mut self, _block: u64, page_id: PageId, data: &[u8]) -> Result<()> {
        self.write_page(page_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_then_reopen_preserves_registry() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap(); // create_new requires it not exist

        {
            let mut c = ContainerFile::create(&path, 4096, 1700000000).unwrap();
            c.registry_mut()
                .reserve("table:users", Extent { offset: 0, length: 4096, checksum: 0, flags: 0 })
                .unwrap();
            c.flush_registry().unwrap();
            c.sync().unwrap();
        }

        let reopened = ContainerFile::open(&path).unwrap();
        assert!(reopened.registry().lookup("table:users").is_some());
        assert_eq!(reopened.page_size(), 4096);
    }

    #[test]
    fn allocate_and_round_trip_a_page() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();

        let mut c = ContainerFile::create(&path, 4096, 0).unwrap();
        let page_id = c.allocate_pages(1);
        let mut data = vec![0u8; 4096];
        data[0] = 42;
        c.write_page(page_id, &data).unwrap();
        let read_back = c.read_page(page_id).unwrap();
        assert_eq!(read_back[0], 42);
    }

    #[test]
    fn encrypted_container_round_trips_pages_transparently() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        let key = [5u8; 32];

        {
            let mut c = ContainerFile::create_with_key(&path, 4096, 0, Some(key)).unwrap();
            let page_id = c.allocate_pages(1);
            let mut data = vec![0u8; 4096];
            data[10] = 7;
            c.write_page(page_id, &data).unwrap();
            c.sync().unwrap();
        }

        let mut reopened = ContainerFile::open_with_key(&path, Some(key)).unwrap();
        assert!(reopened.header().is_encrypted());
        let read_back = reopened.read_page(0).unwrap();
        assert_eq!(read_back.len(), 4096);
        assert_eq!(read_back[10], 7);
    }

    #[test]
    fn opening_encrypted_container_without_key_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        ContainerFile::create_with_key(&path, 4096, 0, Some([5u8; 32])).unwrap();

        assert!(ContainerFile::open(&path).is_err());
    }
}
