// Engine-wide configuration knobs and their defaults.

use crate::error::{DbError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Page sizes the container format accepts, chosen once at `create` time and
/// fixed for the life of the file.
pub const ALLOWED_PAGE_SIZES: [u32; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalDurability {
    /// fsync before acknowledging every commit.
    FullSync,
    /// batch fsyncs across a group-commit window.
    GroupCommit,
    /// acknowledge on buffer append; fsync happens opportunistically.
    Async,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_size: u32,
    pub cache_capacity_pages: usize,
    pub wal_durability: WalDurability,
    pub wal_group_commit_window: Duration,
    pub wal_buffer_pages: u32,
    pub inline_threshold_bytes: u32,
    pub overflow_threshold_bytes: u32,
    pub blob_root: Option<PathBuf>,
    pub blob_retention: Duration,
    pub plan_cache_enabled: bool,
    pub plan_cache_capacity: usize,
    pub plan_cache_normalize_sql: bool,
    pub encryption_key: Option<[u8; 32]>,
    pub metadata_compression: bool,
    pub write_lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity_pages: 4096,
            wal_durability: WalDurability::GroupCommit,
            wal_group_commit_window: Duration::from_millis(5),
            wal_buffer_pages: 256,
            inline_threshold_bytes: 256,
            overflow_threshold_bytes: 8192,
            blob_root: None,
            blob_retention: Duration::from_secs(24 * 3600),
            plan_cache_enabled: true,
            plan_cache_capacity: 2048,
            plan_cache_normalize_sql: true,
            encryption_key: None,
            metadata_compression: true,
            write_lock_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if !ALLOWED_PAGE_SIZES.contains(&self.page_size) {
            return Err(DbError::SchemaError(format!(
                "page size {} is not one of {:?}",
                self.page_size, ALLOWED_PAGE_SIZES
            )));
        }
        if self.inline_threshold_bytes as u64 >= self.overflow_threshold_bytes as u64 {
            return Err(DbError::SchemaError(
                "inline_threshold_bytes must be smaller than overflow_threshold_bytes".into(),
            ));
        }
        if self.cache_capacity_pages == 0 {
            return Err(DbError::SchemaError(
                "cache_capacity_pages must be at least 1".into(),
            ));
        }
        if self.plan_cache_capacity == 0 && self.plan_cache_enabled {
            return Err(DbError::SchemaError(
                "plan_cache_capacity must be at least 1 when the plan cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        EngineOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_unsupported_page_size() {
        let mut opts = EngineOptions::default();
        opts.page_size = 3000;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut opts = EngineOptions::default();
        opts.inline_threshold_bytes = opts.overflow_threshold_bytes;
        assert!(opts.validate().is_err());
    }
}
