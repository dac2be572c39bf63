// Secondary indexes: an ordered B+tree for range-friendly lookups and an
// extendible hash table for point lookups, both keyed by a collation-aware
// wrapper around `Value`.
//
// Both underlying structures are generic over an arbitrary key type with no
// notion of text collation; `IndexKey` carries the column's `Collation`
// alongside the value and implements ordering/hashing in terms of it, so a
// `TEXT COLLATE ascii_ci` column indexes the same way whether it's backed by
// a tree or a table.

pub mod btree;
pub mod hash_index;

use crate::catalog::IndexKind;
use crate::collation::Collation;
use crate::common::{RowId, Value};
use crate::error::{DbError, Result};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A single column value as stored in an index, paired with the collation
/// that governs how it orders and hashes. Two keys that compare equal under
/// their collation must hash equally.
#[derive(Debug, Clone)]
pub struct IndexKey {
    pub value: Value,
    pub collation: Option<Collation>,
}

impl IndexKey {
    pub fn new(value: Value) -> Self {
        Self { value, collation: None }
    }

    pub fn with_collation(value: Value, collation: Collation) -> Self {
        Self { value, collation: Some(collation) }
    }

    fn effective_collation(&self) -> &Collation {
        self.collation.as_ref().unwrap_or(&Collation::Binary)
    }
}

fn variant_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 2,
        Value::Float(_) => 3,
        Value::Text(_) => 4,
        Value::Bytes(_) => 5,
        Value::Date(_) => 6,
        Value::Timestamp(_) => 7,
        Value::Decimal { .. } => 8,
        Value::Uuid(_) => 9,
        Value::Vector(_) => 10,
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.value, &other.value) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => self.effective_collation().compare(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Decimal { unscaled: a, scale: sa }, Value::Decimal { unscaled: b, scale: sb }) => {
                a.cmp(b).then(sa.cmp(sb))
            }
            (Value::Uuid(a), Value::Uuid(b)) => a.as_u128().cmp(&b.as_u128()),
            _ => variant_rank(&self.value).cmp(&variant_rank(&other.value)),
        }
    }
}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.value {
            Value::Null => 0u8.hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => self.effective_collation().normalize(s).hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Decimal { unscaled, scale } => {
                unscaled.hash(state);
                scale.hash(state);
            }
            Value::Uuid(u) => u.as_u128().hash(state),
            Value::Vector(v) => {
                for x in v {
                    x.to_bits().hash(state);
                }
            }
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// The set of row ids a single key maps to. Secondary indexes here are
/// duplicate-permitting: two rows with the same indexed value both show up
/// under that key.
pub type Postings = Vec<RowId>;

/// A single secondary index, backed by whichever structure its definition
/// asked for.
pub enum Index {
    BTree(btree::BPlusTree<IndexKey, Postings>),
    Hash(hash_index::ExtendibleHashIndex<IndexKey, Postings>),
}

const DEFAULT_HASH_BUCKET_CAPACITY: usize = 128;

impl Index {
    pub fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::BTree => Index::BTree(btree::BPlusTree::new()),
            IndexKind::Hash => Index::Hash(hash_index::ExtendibleHashIndex::new(DEFAULT_HASH_BUCKET_CAPACITY)),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Index::BTree(_) => IndexKind::BTree,
            Index::Hash(_) => IndexKind::Hash,
        }
    }

    fn postings(&self, key: &IndexKey) -> Result<Option<Postings>> {
        match self {
            Index::BTree(t) => t.search(key),
            Index::Hash(h) => h.get(key),
        }
    }

    fn put_postings(&self, key: IndexKey, postings: Postings) -> Result<()> {
        match self {
            Index::BTree(t) => t.insert(key, postings),
            Index::Hash(h) => h.insert(key, postings),
        }
    }

    fn remove_postings(&self, key: &IndexKey) -> Result<bool> {
        match self {
            Index::BTree(t) => t.delete(key),
            Index::Hash(h) => h.delete(key),
        }
    }

    /// Adds `row_id` to the postings list for `key`, creating the entry if
    /// this is the first row with that value.
    pub fn insert(&self, key: IndexKey, row_id: RowId) -> Result<()> {
        let mut postings = self.postings(&key)?.unwrap_or_default();
        if !postings.contains(&row_id) {
            postings.push(row_id);
        }
        self.put_postings(key, postings)
    }

    /// Removes `row_id` from `key`'s postings list, dropping the entry
    /// entirely once it's empty.
    pub fn remove(&self, key: &IndexKey, row_id: RowId) -> Result<()> {
        let Some(mut postings) = self.postings(key)? else {
            return Ok(());
        };
        postings.retain(|r| *r != row_id);
        if postings.is_empty() {
            self.remove_postings(key)?;
        } else {
            self.put_postings(key.clone(), postings)?;
        }
        Ok(())
    }

    pub fn lookup(&self, key: &IndexKey) -> Result<Vec<RowId>> {
        Ok(self.postings(key)?.unwrap_or_default())
    }

    /// Ordered row ids across `[start, end]`. Hash indexes have no useful
    /// order, so range scans are rejected rather than silently scanning
    /// everything.
    pub fn range(&self, start: &IndexKey, end: &IndexKey) -> Result<Vec<RowId>> {
        match self {
            Index::BTree(t) => Ok(t.range_scan(start, end)?.into_iter().flat_map(|(_, rows)| rows).collect()),
            Index::Hash(_) => Err(DbError::SchemaError("range scans require a B-tree index".to_string())),
        }
    }
}

/// Owns every secondary index for every table, keyed by `"<table>.<index>"`.
#[derive(Default)]
pub struct IndexManager {
    indexes: RwLock<HashMap<String, Arc<Index>>>,
}

fn index_key(table: &str, index_name: &str) -> String {
    format!("{table}.{index_name}")
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index(&self, table: &str, index_name: &str, kind: IndexKind) -> Result<()> {
        let key = index_key(table, index_name);
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&key) {
            return Err(DbError::SchemaError(format!("index '{index_name}' already exists on '{table}'")));
        }
        indexes.insert(key, Arc::new(Index::new(kind)));
        Ok(())
    }

    pub fn drop_index(&self, table: &str, index_name: &str) -> Result<()> {
        self.indexes
            .write()
            .remove(&index_key(table, index_name))
            .map(|_| ())
            .ok_or_else(|| DbError::SchemaError(format!("index '{index_name}' not found on '{table}'")))
    }

    pub fn drop_table_indexes(&self, table: &str) {
        let prefix = format!("{table}.");
        self.indexes.write().retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn get(&self, table: &str, index_name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(&index_key(table, index_name)).cloned()
    }

    pub fn list_indexes(&self, table: &str) -> Vec<String> {
        let prefix = format!("{table}.");
        let mut names: Vec<String> = self
            .indexes
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: i64) -> IndexKey {
        IndexKey::new(Value::Integer(i))
    }

    fn text_key(s: &str, collation: Collation) -> IndexKey {
        IndexKey::with_collation(Value::Text(s.to_string()), collation)
    }

    #[test]
    fn btree_index_supports_duplicates_and_range() {
        let idx = Index::new(IndexKind::BTree);
        idx.insert(key(1), 100).unwrap();
        idx.insert(key(1), 101).unwrap();
        idx.insert(key(2), 200).unwrap();

        let mut rows = idx.lookup(&key(1)).unwrap();
        rows.sort();
        assert_eq!(rows, vec![100, 101]);

        let ranged = idx.range(&key(1), &key(2)).unwrap();
        assert_eq!(ranged.len(), 3);
    }

    #[test]
    fn removing_last_row_drops_the_key() {
        let idx = Index::new(IndexKind::BTree);
        idx.insert(key(5), 1).unwrap();
        idx.remove(&key(5), 1).unwrap();
        assert!(idx.lookup(&key(5)).unwrap().is_empty());
    }

    #[test]
    fn hash_index_rejects_range_scan() {
        let idx = Index::new(IndexKind::Hash);
        idx.insert(key(1), 1).unwrap();
        assert!(idx.range(&key(1), &key(1)).is_err());
    }

    #[test]
    fn collation_aware_text_keys_compare_equal_across_case() {
        let idx = Index::new(IndexKind::BTree);
        idx.insert(text_key("Ada", Collation::AsciiCaseInsensitive), 1).unwrap();
        idx.insert(text_key("ADA", Collation::AsciiCaseInsensitive), 2).unwrap();

        let mut rows = idx.lookup(&text_key("ada", Collation::AsciiCaseInsensitive)).unwrap();
        rows.sort();
        assert_eq!(rows, vec![1, 2]);
    }

    #[test]
    fn index_manager_scopes_indexes_by_table() {
        let mgr = IndexManager::new();
        mgr.create_index("users", "by_email", IndexKind::BTree).unwrap();
        mgr.create_index("orders", "by_email", IndexKind::Hash).unwrap();

        assert!(mgr.get("users", "by_email").unwrap().kind() == IndexKind::BTree);
        assert!(mgr.get("orders", "by_email").unwrap().kind() == IndexKind::Hash);
        assert_eq!(mgr.list_indexes("users"), vec!["by_email".to_string()]);

        mgr.drop_table_indexes("users");
        assert!(mgr.get("users", "by_email").is_none());
        assert!(mgr.get("orders", "by_email").is_some());
    }

    #[test]
    fn duplicate_index_name_on_same_table_is_rejected() {
        let mgr = IndexManager::new();
        mgr.create_index("t", "idx", IndexKind::BTree).unwrap();
        assert!(mgr.create_index("t", "idx", IndexKind::Hash).is_err());
    }
}
