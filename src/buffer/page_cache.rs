// Bounded LRU page cache keyed by (block-id, page-id).
//
// The cache enforces the write-ahead invariant: a dirty page can only be
// written back once the WAL has been durably flushed past that page's LSN.
// Eviction picks the least-recently-used unpinned page; dirty victims are
// flushed first, which can fail with `Internal` if the caller's watermark
// hasn't advanced far enough yet.

use crate::common::PageId;
use crate::error::{CorruptionDetail, DbError, Result};
use crate::storage::checksum::hardware_crc32c;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub block: u64,
    pub page_id: PageId,
}

impl PageKey {
    pub fn new(block: u64, page_id: PageId) -> Self {
        Self { block, page_id }
    }
}

struct Frame {
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
    lsn: u64,
    clock: u64,
}

/// Fetches/writes a page's bytes for a given block; implemented by whatever
/// owns the container file for that block.
pub trait PageSource {
    fn fetch_page(&mut self, block: u64, page_id: PageId) -> Result<Vec<u8>>;
    fn write_page(&mut self, block: u64, page_id: PageId, data: &[u8]) -> Result<()>;
}

pub struct PageCache {
    capacity: usize,
    frames: HashMap<PageKey, Frame>,
    clock_tick: u64,
    durable_lsn: u64,
}

/// Selects which dirty pages `flush` writes back.
pub enum FlushPredicate {
    All,
    Block(u64),
    UpToLsn(u64),
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: HashMap::new(),
            clock_tick: 0,
            durable_lsn: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Records the highest LSN the WAL has fsynced. Writeback of any page
    /// whose LSN exceeds this watermark is refused.
    pub fn advance_durable_lsn(&mut self, lsn: u64) {
        if lsn > self.durable_lsn {
            self.durable_lsn = lsn;
        }
    }

    pub fn durable_lsn(&self) -> u64 {
        self.durable_lsn
    }

    /// Pin a page, fetching it from `source` on a cache miss and validating
    /// its CRC-32C footer.
    pub fn pin(&mut self, source: &mut dyn PageSource, key: PageKey) -> Result<()> {
        if !self.frames.contains_key(&key) {
            if self.frames.len() >= self.capacity {
                self.evict_one(source)?;
            }
            let data = source.fetch_page(key.block, key.page_id)?;
            validate_checksum(&data, key.page_id)?;
            self.clock_tick += 1;
            self.frames.insert(
                key,
                Frame {
                    data,
                    dirty: false,
                    pin_count: 0,
                    lsn: 0,
                    clock: self.clock_tick,
                },
            );
        }
        self.clock_tick += 1;
        let tick = self.clock_tick;
        let frame = self.frames.get_mut(&key).expect("just inserted or present");
        frame.pin_count += 1;
        frame.clock = tick;
        Ok(())
    }

    pub fn read(&self, key: PageKey) -> Option<&[u8]> {
        self.frames.get(&key).map(|f| f.data.as_slice())
    }

    pub fn write(&mut self, key: PageKey, lsn: u64) -> Option<&mut [u8]> {
        let frame = self.frames.get_mut(&key)?;
        frame.dirty = true;
        frame.lsn = lsn;
        Some(frame.data.as_mut_slice())
    }

    /// Unpin a page. `made_dirty` ORs into the frame's existing dirty bit.
    pub fn unpin(&mut self, key: PageKey, made_dirty: bool) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&key)
            .ok_or_else(|| DbError::Internal(format!("unpin of untracked page {}/{}", key.block, key.page_id)))?;
        if frame.pin_count == 0 {
            return Err(DbError::Internal(format!(
                "pin count underflow for page {}/{}",
                key.block, key.page_id
            )));
        }
        frame.pin_count -= 1;
        frame.dirty |= made_dirty;
        Ok(())
    }

    pub fn is_pinned(&self, key: PageKey) -> bool {
        self.frames.get(&key).map(|f| f.pin_count > 0).unwrap_or(false)
    }

    /// Write back dirty pages matching `predicate`. A page whose LSN has not
    /// yet been fsynced to the WAL is skipped, not an error: the caller flushes
    /// the WAL first and retries.
    pub fn flush(&mut self, source: &mut dyn PageSource, predicate: &FlushPredicate) -> Result<usize> {
        let durable = self.durable_lsn;
        let mut flushed = 0;
        let keys: Vec<PageKey> = self.frames.keys().copied().collect();
        for key in keys {
            let frame = self.frames.get(&key).expect("key from frames");
            if !frame.dirty {
                continue;
            }
            let matches = match predicate {
                FlushPredicate::All => true,
                FlushPredicate::Block(b) => key.block == *b,
                FlushPredicate::UpToLsn(lsn) => frame.lsn <= *lsn,
            };
            if !matches || frame.lsn > durable {
                continue;
            }
            let bytes = frame.data.clone();
            source.write_page(key.block, key.page_id, &bytes)?;
            self.frames.get_mut(&key).unwrap().dirty = false;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn evict_one(&mut self, source: &mut dyn PageSource) -> Result<()> {
        let victim = self
            .frames
            .iter()
            .filter(|(_, f)| f.pin_count == 0)
            .min_by_key(|(_, f)| f.clock)
            .map(|(k, _)| *k);
        let Some(key) = victim else {
            return Err(DbError::CacheExhausted("all frames pinned".to_string()));
        };
        let frame = self.frames.get(&key).expect("victim key present");
        if frame.dirty {
            if frame.lsn > self.durable_lsn {
                return Err(DbError::Internal(format!(
                    "cannot evict page {}/{}: its LSN {} exceeds durable watermark {}",
                    key.block, key.page_id, frame.lsn, self.durable_lsn
                )));
            }
            let bytes = frame.data.clone();
            source.write_page(key.block, key.page_id, &bytes)?;
        }
        self.frames.remove(&key);
        Ok(())
    }
}

fn validate_checksum(data: &[u8], page_id: PageId) -> Result<()> {
    if data.len() < 4 {
        return Err(DbError::PageCorrupt(CorruptionDetail::new(format!(
            "page {page_id} shorter than footer"
        ))));
    }
    let footer_at = data.len() - 4;
    let stored = u32::from_le_bytes(data[footer_at..].try_into().unwrap());
    let actual = hardware_crc32c(&data[..footer_at]);
    if stored != actual {
        tracing::warn!(page_id, stored, actual, "page checksum mismatch, quarantining page");
        return Err(DbError::PageCorrupt(
            CorruptionDetail::new(format!("page {page_id}")).with_checksums(stored, actual),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdMap;

    struct FakeSource {
        pages: StdMap<(u64, PageId), Vec<u8>>,
    }

    fn finalized_page(page_id: PageId) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(&page_id.to_le_bytes());
        let footer_at = buf.len() - 4;
        let crc = hardware_crc32c(&buf[..footer_at]);
        buf[footer_at..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    impl PageSource for FakeSource {
        fn fetch_page(&mut self, block: u64, page_id: PageId) -> Result<Vec<u8>> {
            Ok(self.pages.get(&(block, page_id)).cloned().unwrap_or_else(|| finalized_page(page_id)))
        }
        fn write_page(&mut self, block: u64, page_id: PageId, data: &[u8]) -> Result<()> {
            self.pages.insert((block, page_id), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn pin_miss_then_hit() {
        let mut cache = PageCache::new(4);
        let mut source = FakeSource { pages: StdMap::new() };
        let key = PageKey::new(0, 1);
        cache.pin(&mut source, key).unwrap();
        assert!(cache.read(key).is_some());
        cache.unpin(key, false).unwrap();
    }

    #[test]
    fn evicts_least_recently_used_unpinned_page() {
        let mut cache = PageCache::new(2);
        let mut source = FakeSource { pages: StdMap::new() };
        let k1 = PageKey::new(0, 1);
        let k2 = PageKey::new(0, 2);
        let k3 = PageKey::new(0, 3);
        cache.pin(&mut source, k1).unwrap();
        cache.unpin(k1, false).unwrap();
        cache.pin(&mut source, k2).unwrap();
        cache.unpin(k2, false).unwrap();
        cache.pin(&mut source, k3).unwrap();
        cache.unpin(k3, false).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.read(k1).is_none());
    }

    #[test]
    fn refuses_to_evict_pinned_page() {
        let mut cache = PageCache::new(1);
        let mut source = FakeSource { pages: StdMap::new() };
        let k1 = PageKey::new(0, 1);
        let k2 = PageKey::new(0, 2);
        cache.pin(&mut source, k1).unwrap();
        let err = cache.pin(&mut source, k2).unwrap_err();
        assert!(matches!(err, DbError::CacheExhausted(_)));
    }

    #[test]
    fn flush_skips_pages_past_durable_watermark() {
        let mut cache = PageCache::new(4);
        let mut source = FakeSource { pages: StdMap::new() };
        let key = PageKey::new(0, 1);
        cache.pin(&mut source, key).unwrap();
        cache.write(key, 100).unwrap()[0] = 9;
        cache.unpin(key, true).unwrap();
        cache.advance_durable_lsn(50);
        let flushed = cache.flush(&mut source, &FlushPredicate::All).unwrap();
        assert_eq!(flushed, 0);
        cache.advance_durable_lsn(100);
        let flushed = cache.flush(&mut source, &FlushPredicate::All).unwrap();
        assert_eq!(flushed, 1);
    }

    #[test]
    fn detects_checksum_corruption_on_fetch() {
        let mut cache = PageCache::new(4);
        let mut page = finalized_page(1);
        page[10] ^= 0xFF;
        let mut source = FakeSource { pages: StdMap::from([((0u64, 1u64), page)]) };
        let err = cache.pin(&mut source, PageKey::new(0, 1)).unwrap_err();
        assert!(matches!(err, DbError::PageCorrupt(_)));
    }
}
