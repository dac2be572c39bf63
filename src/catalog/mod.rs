// Table schema metadata: columns, primary key, secondary index definitions.
// Schemas persist to the `sys:metadata` block as a self-describing binary
// record, optionally Brotli-compressed behind a `BROT` magic prefix.

use crate::collation::Collation;
use crate::common::PageId;
use crate::error::{DbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

const BROTLI_MAGIC: &[u8; 4] = b"BROT";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    Integer,
    BigInt,
    Float,
    Double,
    Decimal,
    Varchar(u32),
    Text,
    Blob,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    SortableUuid,
    Vector(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<String>,
    pub collation: Option<Collation>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type, nullable: true, default: None, collation: None }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub secondary_indexes: Vec<IndexDef>,
    pub created_at_unix: i64,
    /// Container page ids holding this table's row heap, in allocation
    /// order. Empty for a table that has never had a row physically
    /// stored yet. Reopening an engine walks these to repopulate the
    /// in-memory heap; see `Catalog::set_heap_pages`.
    pub heap_pages: Vec<PageId>,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, created_at_unix: i64) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            secondary_indexes: Vec::new(),
            created_at_unix,
            heap_pages: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, key: Vec<String>) -> Self {
        self.primary_key = key;
        self
    }

    pub fn with_secondary_index(mut self, index: IndexDef) -> Self {
        self.secondary_indexes.push(index);
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A whole catalog's worth of schemas, as persisted in `sys:metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogSnapshot {
    schemas: Vec<Schema>,
}

/// Encodes a catalog snapshot to bytes, Brotli-compressing and tagging with
/// the `BROT` magic when `compress` is set.
pub fn encode_snapshot(schemas: &[Schema], compress: bool) -> Result<Vec<u8>> {
    let snapshot = CatalogSnapshot { schemas: schemas.to_vec() };
    let raw = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
    if !compress {
        return Ok(raw);
    }
    let mut out = Vec::with_capacity(raw.len() + 4);
    out.extend_from_slice(BROTLI_MAGIC);
    let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 9, 22);
    writer.write_all(&raw)?;
    drop(writer);
    Ok(out)
}

/// Decodes a catalog snapshot. Empty or whitespace-only bytes decode as an
/// empty schema set rather than an error -- a freshly created container has
/// no `sys:metadata` content to parse yet.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Schema>> {
    if bytes.is_empty() || bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let raw = if bytes.len() >= 4 && &bytes[0..4] == BROTLI_MAGIC {
        let mut decompressed = Vec::new();
        brotli::Decompressor::new(&bytes[4..], 4096)
            .read_to_end(&mut decompressed)
            .map_err(|e| DbError::SchemaError(format!("corrupt brotli-compressed metadata: {e}")))?;
        decompressed
    } else {
        bytes.to_vec()
    };
    let (snapshot, _): (CatalogSnapshot, usize) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| DbError::SchemaError(format!("corrupt metadata record: {e}")))?;
    Ok(snapshot.schemas)
}

/// In-memory table of live schemas, guarded for concurrent reader access.
#[derive(Clone)]
pub struct Catalog {
    schemas: Arc<RwLock<HashMap<String, Schema>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self { schemas: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn from_snapshot(schemas: Vec<Schema>) -> Self {
        let map = schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { schemas: Arc::new(RwLock::new(map)) }
    }

    pub fn snapshot(&self) -> Vec<Schema> {
        let mut schemas: Vec<Schema> = self.schemas.read().values().cloned().collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn create_table(&self, schema: Schema) -> Result<()> {
        let mut schemas = self.schemas.write();
        if schemas.contains_key(&schema.name) {
            return Err(DbError::SchemaError(format!("table '{}' already exists", schema.name)));
        }
        schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Result<Schema> {
        self.schemas.read().get(name).cloned().ok_or_else(|| DbError::SchemaError(format!("table '{name}' not found")))
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.schemas
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DbError::SchemaError(format!("table '{name}' not found")))
    }

    /// Updates a table's persisted heap page list in place, without the
    /// drop-then-recreate dance `create_index`/`drop_index` use for other
    /// schema mutations -- this is called after nearly every write, so it
    /// needs to be cheap and not disturb the rest of the schema.
    pub fn set_heap_pages(&self, name: &str, pages: Vec<PageId>) -> Result<()> {
        let mut schemas = self.schemas.write();
        let schema = schemas.get_mut(name).ok_or_else(|| DbError::SchemaError(format!("table '{name}' not found")))?;
        schema.heap_pages = pages;
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(
            "users",
            vec![
                Column::new("id", DataType::BigInt).not_null(),
                Column::new("name", DataType::Varchar(255)).not_null().with_collation(Collation::AsciiCaseInsensitive),
            ],
            1_700_000_000,
        )
        .with_primary_key(vec!["id".to_string()])
    }

    #[test]
    fn create_then_fetch_table() {
        let catalog = Catalog::new();
        catalog.create_table(sample_schema()).unwrap();
        let loaded = catalog.get_table("users").unwrap();
        assert_eq!(loaded.columns.len(), 2);
        assert_eq!(loaded.primary_key, vec!["id".to_string()]);
    }

    #[test]
    fn duplicate_table_is_rejected() {
        let catalog = Catalog::new();
        catalog.create_table(sample_schema()).unwrap();
        assert!(catalog.create_table(sample_schema()).is_err());
    }

    #[test]
    fn snapshot_round_trips_uncompressed() {
        let schemas = vec![sample_schema()];
        let bytes = encode_snapshot(&schemas, false).unwrap();
        let decoded = decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "users");
    }

    #[test]
    fn snapshot_round_trips_compressed() {
        let schemas = vec![sample_schema()];
        let bytes = encode_snapshot(&schemas, true).unwrap();
        assert_eq!(&bytes[0..4], b"BROT");
        let decoded = decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded[0].name, "users");
    }

    #[test]
    fn empty_metadata_decodes_to_empty_schema_set() {
        assert!(decode_snapshot(&[]).unwrap().is_empty());
        assert!(decode_snapshot(b"   \n").unwrap().is_empty());
    }
}
