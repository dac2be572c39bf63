// Caches parsed statements keyed by a normalized form of their SQL text plus
// the shape of their parameters, so a driver that re-issues the same
// parameterized query doesn't pay the parser again on every call.
//
// Bounded by `BoundedHashMap`'s LRU eviction, the same structure the buffer
// pool and hash index reach for elsewhere in this crate.

use crate::common::BoundedHashMap;
use crate::parser::SqlStatement;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coarse statement category, cheap to compute without fully parsing --
/// used as the first component of the cache key so a `SELECT` and an
/// `INSERT` that happen to normalize to similar text never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl CommandTag {
    fn of(stmt: &SqlStatement) -> Self {
        match stmt {
            SqlStatement::Select(_) => CommandTag::Select,
            SqlStatement::Insert { .. } => CommandTag::Insert,
            SqlStatement::Update { .. } => CommandTag::Update,
            SqlStatement::Delete { .. } => CommandTag::Delete,
            SqlStatement::CreateTable { .. }
            | SqlStatement::DropTable { .. }
            | SqlStatement::AlterTableAddColumn { .. }
            | SqlStatement::CreateIndex { .. }
            | SqlStatement::DropIndex { .. }
            | SqlStatement::Begin
            | SqlStatement::Commit
            | SqlStatement::Rollback => CommandTag::Other,
        }
    }

    /// Reads the leading keyword off raw SQL text to pick a tag without
    /// paying for a full parse -- good enough for cache-key disambiguation,
    /// not for execution.
    fn sniff(sql: &str) -> Self {
        let first_word = sql.split_whitespace().next().unwrap_or("").to_uppercase();
        match first_word.as_str() {
            "SELECT" => CommandTag::Select,
            "INSERT" => CommandTag::Insert,
            "UPDATE" => CommandTag::Update,
            "DELETE" => CommandTag::Delete,
            _ => CommandTag::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    tag: CommandTag,
    normalized_sql: String,
    param_shape: usize,
}

/// Collapses run-together whitespace and lowercases the text so that
/// `SELECT  *  FROM t` and `select * from t` hit the same cache entry.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl PlanCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded cache of parsed statement lists, keyed by command category,
/// normalized SQL text, and parameter count.
pub struct PlanCache {
    entries: Mutex<BoundedHashMap<PlanKey, Arc<Vec<SqlStatement>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    capacity: usize,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(BoundedHashMap::new(capacity.max(1))), hits: AtomicU64::new(0), misses: AtomicU64::new(0), capacity }
    }

    /// Looks up a cached plan for `sql` with `param_count` placeholders,
    /// computed by `parse` (typically `SqlParser::parse`) on a miss.
    pub fn get_or_parse(
        &self,
        sql: &str,
        param_count: usize,
        parse: impl FnOnce() -> crate::Result<Vec<SqlStatement>>,
    ) -> crate::Result<Arc<Vec<SqlStatement>>> {
        let tag = CommandTag::sniff(sql);
        let key = PlanKey { tag, normalized_sql: normalize_sql(sql), param_shape: param_count };

        if let Some(cached) = self.entries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let parsed = Arc::new(parse()?);
        self.entries.lock().insert(key, parsed.clone());
        Ok(parsed)
    }

    pub fn insert_tagged(&self, sql: &str, param_count: usize, statements: Vec<SqlStatement>) -> Arc<Vec<SqlStatement>> {
        let tag = statements.first().map(CommandTag::of).unwrap_or(CommandTag::Select);
        let key = PlanKey { tag, normalized_sql: normalize_sql(sql), param_shape: param_count };
        let parsed = Arc::new(statements);
        self.entries.lock().insert(key, parsed.clone());
        parsed
    }

    pub fn lookup_tagged(&self, sql: &str, param_count: usize, tag: CommandTag) -> Option<Arc<Vec<SqlStatement>>> {
        let key = PlanKey { tag, normalized_sql: normalize_sql(sql), param_shape: param_count };
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(plan) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(plan.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlParser;

    #[test]
    fn normalize_folds_whitespace_and_case() {
        assert_eq!(normalize_sql("SELECT   *\nFROM t"), "select * from t");
    }

    #[test]
    fn repeated_lookup_is_a_hit() {
        let cache = PlanCache::new(8);
        let parser = SqlParser::new();
        let sql = "SELECT id FROM t WHERE id = ?";

        let first = cache.get_or_parse(sql, 1, || parser.parse(sql)).unwrap();
        assert_eq!(cache.stats().misses, 1);

        let second = cache.get_or_parse(sql, 1, || parser.parse(sql)).unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn different_param_counts_are_different_entries() {
        let cache = PlanCache::new(8);
        let parser = SqlParser::new();
        let sql = "SELECT id FROM t WHERE id = ?";

        cache.get_or_parse(sql, 1, || parser.parse(sql)).unwrap();
        cache.get_or_parse(sql, 2, || parser.parse(sql)).unwrap();
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn clear_resets_stats_and_entries() {
        let cache = PlanCache::new(8);
        let parser = SqlParser::new();
        let sql = "SELECT 1";
        cache.get_or_parse(sql, 0, || parser.parse(sql)).unwrap();
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = PlanCache::new(2);
        let parser = SqlParser::new();
        for i in 0..3 {
            let sql = format!("SELECT {i}");
            cache.get_or_parse(&sql, 0, || parser.parse(&sql)).unwrap();
        }
        assert_eq!(cache.stats().size, 2);
    }
}
