// Overflow Manager: medium rows spill into a chain of overflow pages inside
// the container; large rows spill into an external blob file referenced by
// uuid.

use crate::common::PageId;
use crate::container::file::ContainerFile;
use crate::error::{CorruptionDetail, DbError, Result};
use crate::storage::checksum::hardware_crc32c;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const CHAIN_HEADER_LEN: usize = 12; // next_page:u64 + chunk_len:u32
const FOOTER_LEN: usize = 4;
const NONE_PAGE: u64 = u64::MAX;
/// Bounds chain traversal so a corrupted cyclic chain fails fast with
/// `ChainCorrupt` instead of looping forever.
const MAX_CHAIN_PAGES: usize = 1_000_000;

fn chunk_capacity(page_size: u32) -> usize {
    page_size as usize - CHAIN_HEADER_LEN - FOOTER_LEN
}

fn encode_overflow_page(next_page: u64, chunk: &[u8], page_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; page_size as usize];
    buf[0..8].copy_from_slice(&next_page.to_le_bytes());
    buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    buf[12..12 + chunk.len()].copy_from_slice(chunk);
    let footer_at = buf.len() - FOOTER_LEN;
    let crc = hardware_crc32c(&buf[..footer_at]);
    buf[footer_at..].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_overflow_page(buf: &[u8], page_id: PageId) -> Result<(u64, &[u8])> {
    let footer_at = buf.len() - FOOTER_LEN;
    let stored = u32::from_le_bytes(buf[footer_at..].try_into().unwrap());
    let actual = hardware_crc32c(&buf[..footer_at]);
    if stored != actual {
        return Err(DbError::ChainCorrupt(
            CorruptionDetail::new(format!("overflow page {page_id}")).with_checksums(stored, actual),
        ));
    }
    let next_page = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let chunk_len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    if 12 + chunk_len > footer_at {
        return Err(DbError::ChainCorrupt(CorruptionDetail::new(format!(
            "overflow page {page_id} declares a chunk longer than the page"
        ))));
    }
    Ok((next_page, &buf[12..12 + chunk_len]))
}

/// Write `data` across a freshly allocated chain of overflow pages, returning
/// the id of the first page.
pub fn write_chain(container: &mut ContainerFile, data: &[u8]) -> Result<PageId> {
    let page_size = container.page_size();
    let cap = chunk_capacity(page_size);
    let chunks: Vec<&[u8]> = data.chunks(cap.max(1)).collect();
    if chunks.is_empty() {
        let page_id = container.allocate_pages(1);
        let bytes = encode_overflow_page(NONE_PAGE, &[], page_size);
        container.write_page(page_id, &bytes)?;
        return Ok(page_id);
    }

    let page_ids: Vec<PageId> = (0..chunks.len()).map(|_| container.allocate_pages(1)).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let next_page = if i + 1 < page_ids.len() { page_ids[i + 1] } else { NONE_PAGE };
        let bytes = encode_overflow_page(next_page, chunk, page_size);
        container.write_page(page_ids[i], &bytes)?;
    }
    Ok(page_ids[0])
}

/// Read and concatenate an overflow chain, bounded so a cyclic chain can
/// never hang the reader.
pub fn read_chain(container: &mut ContainerFile, first_page: PageId) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut current = Some(first_page);
    let mut visited = 0usize;
    while let Some(page_id) = current {
        visited += 1;
        if visited > MAX_CHAIN_PAGES {
            return Err(DbError::ChainCorrupt(CorruptionDetail::new(
                "overflow chain exceeded the maximum bounded length; likely cyclic",
            )));
        }
        let bytes = container.read_page(page_id)?;
        let (next_page, chunk) = decode_overflow_page(&bytes, page_id)?;
        out.extend_from_slice(chunk);
        current = if next_page == NONE_PAGE { None } else { Some(next_page) };
    }
    Ok(out)
}

/// Free every page in a chain. Bounded identically to `read_chain`.
pub fn free_chain(container: &mut ContainerFile, first_page: PageId) -> Result<()> {
    let mut current = Some(first_page);
    let mut visited = 0usize;
    while let Some(page_id) = current {
        visited += 1;
        if visited > MAX_CHAIN_PAGES {
            return Err(DbError::ChainCorrupt(CorruptionDetail::new(
                "overflow chain exceeded the maximum bounded length; likely cyclic",
            )));
        }
        let bytes = container.read_page(page_id)?;
        let (next_page, _) = decode_overflow_page(&bytes, page_id)?;
        container.free_pages(page_id, 1);
        current = if next_page == NONE_PAGE { None } else { Some(next_page) };
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// External blob files
// ---------------------------------------------------------------------------

fn blob_path(root: &Path, id: Uuid) -> PathBuf {
    let hex = id.simple().to_string();
    root.join(&hex[0..2]).join(&hex[2..4]).join(format!("{hex}.bin"))
}

fn meta_path(root: &Path, id: Uuid) -> PathBuf {
    let hex = id.simple().to_string();
    root.join(&hex[0..2]).join(&hex[2..4]).join(format!("{hex}.meta"))
}

/// Write `data` to a new blob file, returning its id, size, and SHA-256
/// digest. Uses temp-file + fsync + atomic rename so a crash mid-write never
/// leaves a partially-written blob visible under its final name.
pub fn write_blob(root: &Path, data: &[u8]) -> Result<(Uuid, u64, [u8; 32])> {
    let id = Uuid::new_v4();
    let final_path = blob_path(root, id);
    let meta = meta_path(root, id);
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let digest: [u8; 32] = Sha256::digest(data).into();

    let tmp_path = final_path.with_extension("bin.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(data)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;

    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let meta_json = serde_json::json!({
        "size": data.len() as u64,
        "digest": hex::encode(digest),
        "created_at_unix": created_at,
    });
    let meta_tmp = meta.with_extension("meta.tmp");
    {
        let mut f = fs::File::create(&meta_tmp)?;
        f.write_all(meta_json.to_string().as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&meta_tmp, &meta)?;

    tracing::debug!(blob_id = %id, bytes = data.len(), "blob written");
    Ok((id, data.len() as u64, digest))
}

pub fn read_blob(root: &Path, id: Uuid, expected_digest: &[u8; 32]) -> Result<Vec<u8>> {
    let path = blob_path(root, id);
    let data = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DbError::BlobMissing(id.to_string())
        } else {
            DbError::IoError(e)
        }
    })?;
    let actual: [u8; 32] = Sha256::digest(&data).into();
    if &actual != expected_digest {
        tracing::warn!(blob_id = %id, "blob digest mismatch on read");
        return Err(DbError::BlobCorrupt(format!(
            "blob {id} digest mismatch: expected {}, found {}",
            hex::encode(expected_digest),
            hex::encode(actual)
        )));
    }
    Ok(data)
}

pub fn delete_blob(root: &Path, id: Uuid) -> Result<()> {
    let _ = fs::remove_file(blob_path(root, id));
    let _ = fs::remove_file(meta_path(root, id));
    Ok(())
}

/// Remove blob files older than `retention` whose id is not present in
/// `referenced`. Run opportunistically by `vacuum`.
pub fn sweep_orphans(root: &Path, retention: Duration, referenced: &std::collections::HashSet<Uuid>) -> Result<usize> {
    let mut removed = 0;
    let now = SystemTime::now();
    if !root.exists() {
        return Ok(0);
    }
    for l1 in fs::read_dir(root)? {
        let l1 = l1?;
        if !l1.file_type()?.is_dir() {
            continue;
        }
        for l2 in fs::read_dir(l1.path())? {
            let l2 = l2?;
            if !l2.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(l2.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
                let Ok(id) = Uuid::parse_str(stem) else { continue };
                if referenced.contains(&id) {
                    continue;
                }
                let modified = entry.metadata()?.modified().unwrap_or(now);
                if now.duration_since(modified).unwrap_or_default() >= retention {
                    delete_blob(root, id)?;
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        tracing::info!(removed, "swept orphaned blobs");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_container() -> ContainerFile {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        ContainerFile::create(&path, 512, 0).unwrap()
    }

    #[test]
    fn chain_round_trips_data_larger_than_one_page() {
        let mut c = new_container();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let first = write_chain(&mut c, &data).unwrap();
        let read_back = read_chain(&mut c, first).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn chain_detects_corruption() {
        let mut c = new_container();
        let data = vec![7u8; 100];
        let first = write_chain(&mut c, &data).unwrap();
        let mut page = c.read_page(first).unwrap();
        page[20] ^= 0xFF;
        c.write_page(first, &page).unwrap();
        assert!(read_chain(&mut c, first).is_err());
    }

    #[test]
    fn blob_round_trips_with_digest_check() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"large blob payload".to_vec();
        let (id, size, digest) = write_blob(dir.path(), &data).unwrap();
        assert_eq!(size, data.len() as u64);
        let read_back = read_blob(dir.path(), id, &digest).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn blob_digest_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (id, _, _) = write_blob(dir.path(), b"hello").unwrap();
        let wrong_digest = [0u8; 32];
        assert!(read_blob(dir.path(), id, &wrong_digest).is_err());
    }

    #[test]
    fn missing_blob_reports_blob_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_blob(dir.path(), Uuid::new_v4(), &[0u8; 32]).unwrap_err();
        assert!(matches!(err, DbError::BlobMissing(_)));
    }
}
