// Walks one `SqlStatement` against the catalog, the secondary indexes, and
// a row heap backed by the container's slotted pages. The in-memory
// `BTreeMap<RowId, Row>` in `TableHeap` is a read-side working set rebuilt
// from those pages on open (see `load_heap_from_pages`); every insert,
// update, and delete also performs the matching physical page write so the
// working set and the container never diverge. Joins, CTEs, and subqueries
// are out of scope; `convert_select` in the parser already rejects anything
// beyond a single-table query before it reaches here.

use crate::buffer::PageKey;
use crate::catalog::{Catalog, Column, DataType, IndexDef, Schema};
use crate::common::{pack_row_id, unpack_row_id, PageId, RowId, Value};
use crate::container::ContainerFile;
use crate::error::{DbError, Result};
use crate::index::{IndexKey, IndexManager};
use crate::parser::expression::{Expression, ExpressionEvaluator, LiteralValue};
use crate::parser::{AggregateFunc, SelectItem, SelectStatement, SqlStatement};
use crate::storage::overflow;
use crate::storage::page::{PageType, SlottedPage};
use crate::storage::row::{decode_row, encode_row, RowStorage};
use crate::transaction::TransactionManager;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::QueryResult;

type Row = Vec<Value>;

/// Page space heap rows live in. Only one block is in play today; the field
/// exists so a future index page space doesn't collide with it in the cache.
const HEAP_BLOCK: u64 = 0;

const STORED_INLINE: u8 = 0;
const STORED_CHAIN: u8 = 1;
const STORED_ROW_HEADER: usize = 9; // row_id:u64 + tag:u8

#[derive(Default)]
struct TableHeap {
    rows: BTreeMap<RowId, Row>,
    /// Container page ids belonging to this table's heap, in allocation
    /// order. Mirrors `Schema::heap_pages`; kept here too so insert doesn't
    /// need to round-trip through the catalog on every row.
    pages: Vec<PageId>,
}

pub struct Executor {
    catalog: Arc<Catalog>,
    indexes: Arc<IndexManager>,
    heaps: RwLock<HashMap<String, RwLock<TableHeap>>>,
    txn_manager: Arc<TransactionManager>,
    container: Arc<Mutex<ContainerFile>>,
    page_size: usize,
    inline_threshold: usize,
}

impl Executor {
    pub fn new(
        catalog: Arc<Catalog>,
        indexes: Arc<IndexManager>,
        txn_manager: Arc<TransactionManager>,
        container: Arc<Mutex<ContainerFile>>,
        page_size: usize,
        inline_threshold: usize,
    ) -> Self {
        Self {
            catalog,
            indexes,
            heaps: RwLock::new(HashMap::new()),
            txn_manager,
            container,
            page_size,
            inline_threshold,
        }
    }

    /// Rebuilds a table's in-memory heap by scanning its persisted pages --
    /// used when reopening an engine whose metadata blob recorded
    /// `heap_pages` for this table. An empty `page_ids` list just registers
    /// an empty heap, the same as a freshly created table.
    pub fn load_heap_from_pages(&self, table: &str, page_ids: &[PageId]) -> Result<()> {
        let mut heap = TableHeap { rows: BTreeMap::new(), pages: page_ids.to_vec() };
        for &page_id in page_ids {
            let bytes = self.read_heap_page(page_id)?;
            let page = SlottedPage::from_bytes(bytes, page_id)?;
            for (_, data) in page.iter_live() {
                let (row_id, values) = self.decode_stored_row(data)?;
                heap.rows.insert(row_id, values);
            }
        }
        self.heaps.write().insert(table.to_string(), RwLock::new(heap));
        Ok(())
    }

    pub fn execute(&self, stmt: SqlStatement) -> Result<QueryResult> {
        match stmt {
            SqlStatement::CreateTable { name, columns } => self.create_table(name, columns),
            SqlStatement::DropTable { name } => self.drop_table(&name),
            SqlStatement::AlterTableAddColumn { table, column } => self.alter_table_add_column(&table, column),
            SqlStatement::CreateIndex { name, table, columns, kind } => self.create_index(&table, &name, columns, kind),
            SqlStatement::DropIndex { name, table } => self.drop_index(&table, &name),
            SqlStatement::Insert { table, columns, values } => self.insert(&table, columns, values),
            SqlStatement::Update { table, assignments, filter } => self.update(&table, assignments, filter),
            SqlStatement::Delete { table, filter } => self.delete(&table, filter),
            SqlStatement::Select(select) => self.select(select),
            SqlStatement::Begin | SqlStatement::Commit | SqlStatement::Rollback => Ok(QueryResult::affected(0)),
        }
    }

    fn create_table(&self, name: String, columns: Vec<Column>) -> Result<QueryResult> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let schema = Schema::new(name.clone(), columns, now);
        self.catalog.create_table(schema)?;
        self.heaps.write().insert(name, RwLock::new(TableHeap::default()));
        Ok(QueryResult::affected(0))
    }

    fn drop_table(&self, name: &str) -> Result<QueryResult> {
        self.catalog.drop_table(name)?;
        self.heaps.write().remove(name);
        self.indexes.drop_table_indexes(name);
        Ok(QueryResult::affected(0))
    }

    fn alter_table_add_column(&self, table: &str, column: Column) -> Result<QueryResult> {
        let mut schema = self.catalog.get_table(table)?;
        if schema.column(&column.name).is_some() {
            return Err(DbError::SchemaError(format!("column '{}' already exists on '{table}'", column.name)));
        }
        schema.columns.push(column);
        self.catalog.drop_table(table)?;
        self.catalog.create_table(schema)?;

        // The padded column only exists in the in-memory working set; see
        // DESIGN.md for why this doesn't rewrite the table's heap pages.
        let heaps = self.heaps.read();
        if let Some(heap) = heaps.get(table) {
            for row in heap.write().rows.values_mut() {
                row.push(Value::Null);
            }
        }
        Ok(QueryResult::affected(0))
    }

    /// Indexes here are single-column; a composite `columns` list uses only
    /// the first entry; see the grounding ledger for why.
    fn create_index(
        &self,
        table: &str,
        name: &str,
        columns: Vec<String>,
        kind: crate::catalog::IndexKind,
    ) -> Result<QueryResult> {
        let mut schema = self.catalog.get_table(table)?;
        let column_name = columns
            .first()
            .cloned()
            .ok_or_else(|| DbError::SchemaError("CREATE INDEX needs at least one column".to_string()))?;
        let column = schema
            .column(&column_name)
            .cloned()
            .ok_or_else(|| DbError::SchemaError(format!("column '{column_name}' not found on '{table}'")))?;

        self.indexes.create_index(table, name, kind)?;
        let index = self.indexes.get(table, name).expect("just created");

        if let Some(heap) = self.heaps.read().get(table) {
            let heap = heap.read();
            let col_idx = schema.column_index(&column_name).expect("checked above");
            for (row_id, row) in &heap.rows {
                if let Some(value) = row.get(col_idx) {
                    if !value.is_null() {
                        index.insert(index_key_for(value, &column), *row_id)?;
                    }
                }
            }
        }

        schema.secondary_indexes.push(IndexDef { name: name.to_string(), columns: vec![column_name], kind });
        self.catalog.drop_table(table)?;
        self.catalog.create_table(schema)?;
        Ok(QueryResult::affected(0))
    }

    fn drop_index(&self, table: &str, name: &str) -> Result<QueryResult> {
        self.indexes.drop_index(table, name)?;
        let mut schema = self.catalog.get_table(table)?;
        schema.secondary_indexes.retain(|idx| idx.name != name);
        self.catalog.drop_table(table)?;
        self.catalog.create_table(schema)?;
        Ok(QueryResult::affected(0))
    }

    fn insert(&self, table: &str, columns: Vec<String>, values: Vec<Vec<Expression>>) -> Result<QueryResult> {
        let schema = self.catalog.get_table(table)?;
        let target_columns = if columns.is_empty() { schema.columns.iter().map(|c| c.name.clone()).collect() } else { columns };
        if target_columns.len() != values.first().map(|r| r.len()).unwrap_or(0) {
            return Err(DbError::SchemaError("column count does not match VALUES arity".to_string()));
        }

        let heaps = self.heaps.read();
        let heap_lock = heaps.get(table).ok_or_else(|| DbError::SchemaError(format!("table '{table}' has no heap")))?;
        let mut heap = heap_lock.write();
        let evaluator = ExpressionEvaluator::new(HashMap::new());
        let mut inserted = 0usize;

        for value_row in values {
            if value_row.len() != target_columns.len() {
                return Err(DbError::SchemaError("column count does not match VALUES arity".to_string()));
            }
            let mut row: Row = vec![Value::Null; schema.columns.len()];
            for (col_name, expr) in target_columns.iter().zip(value_row.iter()) {
                let col_idx = schema
                    .column_index(col_name)
                    .ok_or_else(|| DbError::SchemaError(format!("unknown column '{col_name}' on '{table}'")))?;
                let column = &schema.columns[col_idx];
                let literal = evaluator.evaluate(expr)?;
                let value = literal_to_value(literal, &column.data_type)?;
                if value.is_null() && !column.nullable {
                    return Err(DbError::ConstraintViolation(format!("column '{col_name}' is NOT NULL")));
                }
                row[col_idx] = value;
            }

            let row_id = self.insert_physical(table, &mut heap, &row)?;
            self.index_row(table, &schema, row_id, &row)?;
            heap.rows.insert(row_id, row);
            inserted += 1;
        }
        Ok(QueryResult::affected(inserted))
    }

    /// Inserts pre-typed rows directly into the heap, bypassing SQL parsing
    /// and literal evaluation -- the binary fast path for bulk loads.
    pub fn insert_rows(&self, table: &str, rows: Vec<Vec<Value>>) -> Result<QueryResult> {
        let schema = self.catalog.get_table(table)?;
        let heaps = self.heaps.read();
        let heap_lock = heaps.get(table).ok_or_else(|| DbError::SchemaError(format!("table '{table}' has no heap")))?;
        let mut heap = heap_lock.write();

        let mut inserted = 0usize;
        for row in rows {
            if row.len() != schema.columns.len() {
                return Err(DbError::SchemaError(format!("row has {} values, table '{table}' has {} columns", row.len(), schema.columns.len())));
            }
            for (value, column) in row.iter().zip(schema.columns.iter()) {
                if value.is_null() && !column.nullable {
                    return Err(DbError::ConstraintViolation(format!("column '{}' is NOT NULL", column.name)));
                }
            }
            let row_id = self.insert_physical(table, &mut heap, &row)?;
            self.index_row(table, &schema, row_id, &row)?;
            heap.rows.insert(row_id, row);
            inserted += 1;
        }
        Ok(QueryResult::affected(inserted))
    }

    fn update(&self, table: &str, assignments: Vec<(String, Expression)>, filter: Option<Expression>) -> Result<QueryResult> {
        let schema = self.catalog.get_table(table)?;
        let heaps = self.heaps.read();
        let heap_lock = heaps.get(table).ok_or_else(|| DbError::SchemaError(format!("table '{table}' has no heap")))?;
        let mut heap = heap_lock.write();

        let mut matching = Vec::new();
        for (row_id, row) in heap.rows.iter() {
            if row_matches(&schema, row, filter.as_ref())?.unwrap_or(true) {
                matching.push(*row_id);
            }
        }

        let mut updated = 0usize;
        for row_id in matching {
            let before = heap.rows.get(&row_id).cloned().expect("matched above");
            let evaluator = ExpressionEvaluator::new(row_to_map(&schema, &before));
            let mut after = before.clone();
            for (col_name, expr) in &assignments {
                let col_idx = schema
                    .column_index(col_name)
                    .ok_or_else(|| DbError::SchemaError(format!("unknown column '{col_name}' on '{table}'")))?;
                let column = &schema.columns[col_idx];
                let literal = evaluator.evaluate(expr)?;
                let value = literal_to_value(literal, &column.data_type)?;
                if value.is_null() && !column.nullable {
                    return Err(DbError::ConstraintViolation(format!("column '{col_name}' is NOT NULL")));
                }
                after[col_idx] = value;
            }

            // No in-place slot rewrite exists (see storage::page), so an
            // update tombstones the old slot and inserts the new value
            // fresh; the row id changes with it.
            self.deindex_row(table, &schema, row_id, &before)?;
            self.remove_row_physically(row_id)?;
            let new_row_id = self.insert_physical(table, &mut heap, &after)?;
            self.index_row(table, &schema, new_row_id, &after)?;
            heap.rows.remove(&row_id);
            heap.rows.insert(new_row_id, after);
            updated += 1;
        }
        Ok(QueryResult::affected(updated))
    }

    fn delete(&self, table: &str, filter: Option<Expression>) -> Result<QueryResult> {
        let schema = self.catalog.get_table(table)?;
        let heaps = self.heaps.read();
        let heap_lock = heaps.get(table).ok_or_else(|| DbError::SchemaError(format!("table '{table}' has no heap")))?;
        let mut heap = heap_lock.write();

        let mut matching = Vec::new();
        for (row_id, row) in heap.rows.iter() {
            if row_matches(&schema, row, filter.as_ref())?.unwrap_or(true) {
                matching.push(*row_id);
            }
        }

        for row_id in &matching {
            if let Some(row) = heap.rows.remove(row_id) {
                self.deindex_row(table, &schema, *row_id, &row)?;
                self.remove_row_physically(*row_id)?;
            }
        }
        Ok(QueryResult::affected(matching.len()))
    }

    fn select(&self, select: SelectStatement) -> Result<QueryResult> {
        let schema = self.catalog.get_table(&select.table)?;
        let heaps = self.heaps.read();
        let heap = heaps
            .get(&select.table)
            .ok_or_else(|| DbError::SchemaError(format!("table '{}' has no heap", select.table)))?;
        let heap = heap.read();

        let mut matched: Vec<&Row> = Vec::new();
        for row in heap.rows.values() {
            if row_matches(&schema, row, select.filter.as_ref())?.unwrap_or(true) {
                matched.push(row);
            }
        }

        let has_aggregates = select.projection.iter().any(|p| matches!(p, SelectItem::Aggregate { .. }));
        if has_aggregates || !select.group_by.is_empty() {
            return self.select_aggregated(&schema, &select, matched);
        }

        let columns: Vec<String> = select
            .projection
            .iter()
            .flat_map(|item| match item {
                SelectItem::Wildcard => schema.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                SelectItem::Column(name) => vec![name.clone()],
                SelectItem::Aggregate { .. } => Vec::new(),
            })
            .collect();

        let mut rows: Vec<Row> = matched
            .into_iter()
            .map(|row| project(&schema, row, &columns))
            .collect::<Result<Vec<_>>>()?;

        sort_rows(&mut rows, &columns, &select.order_by);
        apply_limit_offset(&mut rows, select.limit, select.offset);

        Ok(QueryResult::rows(columns, rows))
    }

    fn select_aggregated(&self, schema: &Schema, select: &SelectStatement, matched: Vec<&Row>) -> Result<QueryResult> {
        let groups = group_rows(schema, &matched, &select.group_by)?;
        let mut columns = select.group_by.clone();
        for item in &select.projection {
            if let SelectItem::Aggregate { func, arg, alias } = item {
                columns.push(alias.clone().unwrap_or_else(|| format!("{func:?}({})", arg.clone().unwrap_or_else(|| "*".to_string()))));
            }
        }

        let mut out_rows = Vec::new();
        for (key, group) in groups {
            let mut out_row = key.clone();
            let mut having_ok = true;
            for item in &select.projection {
                if let SelectItem::Aggregate { func, arg, .. } = item {
                    let value = compute_aggregate(schema, &group, *func, arg.as_deref())?;
                    out_row.push(value);
                }
            }
            if let Some(having) = &select.having {
                let row_data: HashMap<String, LiteralValue> = select
                    .group_by
                    .iter()
                    .zip(key.iter())
                    .map(|(name, value)| (name.clone(), value_to_literal(value)))
                    .collect();
                let resolved = substitute_aggregates(having, schema, &group)?;
                let evaluator = ExpressionEvaluator::new(row_data);
                having_ok = evaluator.evaluate(&resolved)?.as_bool().unwrap_or(false);
            }
            if having_ok {
                out_rows.push(out_row);
            }
        }

        apply_limit_offset(&mut out_rows, select.limit, select.offset);
        Ok(QueryResult::rows(columns, out_rows))
    }

    fn index_row(&self, table: &str, schema: &Schema, row_id: RowId, row: &Row) -> Result<()> {
        for def in &schema.secondary_indexes {
            let Some(col_name) = def.columns.first() else { continue };
            let Some(col_idx) = schema.column_index(col_name) else { continue };
            let Some(value) = row.get(col_idx) else { continue };
            if value.is_null() {
                continue;
            }
            if let Some(index) = self.indexes.get(table, &def.name) {
                index.insert(index_key_for(value, &schema.columns[col_idx]), row_id)?;
            }
        }
        Ok(())
    }

    fn deindex_row(&self, table: &str, schema: &Schema, row_id: RowId, row: &Row) -> Result<()> {
        for def in &schema.secondary_indexes {
            let Some(col_name) = def.columns.first() else { continue };
            let Some(col_idx) = schema.column_index(col_name) else { continue };
            let Some(value) = row.get(col_idx) else { continue };
            if value.is_null() {
                continue;
            }
            if let Some(index) = self.indexes.get(table, &def.name) {
                index.remove(&index_key_for(value, &schema.columns[col_idx]), row_id)?;
            }
        }
        Ok(())
    }

    // -- Physical row storage -------------------------------------------
    //
    // A stored row is `row_id:u64 ++ tag:u8 ++ payload`. `tag` is either
    // `STORED_INLINE`, with the column-encoded bytes as payload, or
    // `STORED_CHAIN`, with a bincode-encoded `RowStorage::ChainHead`
    // pointing at an overflow page chain holding the real bytes. The row id
    // is `pack_row_id(page_id, slot)`, so a row's physical location is
    // always recoverable from its id with no separate lookup table.

    fn encode_stored_row(&self, row_id: RowId, values: &[Value]) -> Result<Vec<u8>> {
        let encoded = encode_row(values);
        let mut out = Vec::with_capacity(STORED_ROW_HEADER + encoded.len());
        out.extend_from_slice(&row_id.to_le_bytes());
        if encoded.len() > self.inline_threshold {
            let first_page = {
                let mut container = self.container.lock();
                overflow::write_chain(&mut container, &encoded)?
            };
            let descriptor = RowStorage::ChainHead { first_page, total_len: encoded.len() as u64, digest: None };
            let desc_bytes = bincode::serde::encode_to_vec(&descriptor, bincode::config::standard())
                .map_err(|e| DbError::Internal(format!("failed to encode row storage descriptor: {e}")))?;
            out.push(STORED_CHAIN);
            out.extend_from_slice(&desc_bytes);
        } else {
            out.push(STORED_INLINE);
            out.extend_from_slice(&encoded);
        }
        Ok(out)
    }

    fn decode_stored_row(&self, data: &[u8]) -> Result<(RowId, Vec<Value>)> {
        if data.len() < STORED_ROW_HEADER {
            return Err(DbError::SchemaError("stored row shorter than its header".to_string()));
        }
        let row_id = RowId::from_le_bytes(data[0..8].try_into().unwrap());
        let tag = data[8];
        let payload = &data[STORED_ROW_HEADER..];
        let values = match tag {
            STORED_INLINE => decode_row(payload)?,
            STORED_CHAIN => {
                let (descriptor, _): (RowStorage, usize) =
                    bincode::serde::decode_from_slice(payload, bincode::config::standard())
                        .map_err(|e| DbError::Internal(format!("corrupt row storage descriptor: {e}")))?;
                match descriptor {
                    RowStorage::ChainHead { first_page, .. } => {
                        let bytes = {
                            let mut container = self.container.lock();
                            overflow::read_chain(&mut container, first_page)?
                        };
                        decode_row(&bytes)?
                    }
                    other => return Err(DbError::Internal(format!("unexpected row storage descriptor {other:?}"))),
                }
            }
            other => return Err(DbError::SchemaError(format!("unknown stored-row tag {other}"))),
        };
        Ok((row_id, values))
    }

    fn read_heap_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        if let Some(txn_id) = self.txn_manager.active_writer_id() {
            if let Some(bytes) = self.txn_manager.overlay_read(txn_id, PageKey::new(HEAP_BLOCK, page_id)) {
                return Ok(bytes);
            }
        }
        self.container.lock().read_page(page_id)
    }

    /// Buffers the page write against the active writer's commit overlay
    /// when one exists; otherwise (standalone executor use, no engine
    /// transaction wrapping this call) writes straight through to the
    /// container with no WAL record.
    fn persist_heap_page(&self, page_id: PageId, bytes: Vec<u8>) -> Result<()> {
        match self.txn_manager.active_writer_id() {
            Some(txn_id) => self.txn_manager.buffer_write(txn_id, PageKey::new(HEAP_BLOCK, page_id), bytes),
            None => self.container.lock().write_page(page_id, &bytes),
        }
    }

    /// Allocates a fresh heap page and formats it in place so a later cache
    /// fetch passes checksum validation. This initial format carries no
    /// committed data, so it's written directly rather than through the WAL.
    fn allocate_heap_page(&self) -> Result<PageId> {
        let mut container = self.container.lock();
        let page_id = container.allocate_pages(1);
        let blank = SlottedPage::new(page_id, self.page_size, PageType::TableHeap).finalize();
        container.write_page(page_id, &blank)?;
        Ok(page_id)
    }

    fn insert_physical(&self, table: &str, heap: &mut TableHeap, values: &[Value]) -> Result<RowId> {
        loop {
            if let Some(&page_id) = heap.pages.last() {
                let bytes = self.read_heap_page(page_id)?;
                let mut page = SlottedPage::from_bytes(bytes, page_id)?;
                let predicted_slot = page.slot_count();
                let row_id = pack_row_id(page_id, predicted_slot);
                let stored = self.encode_stored_row(row_id, values)?;
                if page.insert(&stored).is_some() {
                    self.persist_heap_page(page_id, page.finalize())?;
                    return Ok(row_id);
                }
            }
            let page_id = self.allocate_heap_page()?;
            heap.pages.push(page_id);
            self.catalog.set_heap_pages(table, heap.pages.clone())?;
        }
    }

    fn remove_row_physically(&self, row_id: RowId) -> Result<()> {
        let (page_id, slot) = unpack_row_id(row_id);
        let bytes = self.read_heap_page(page_id)?;
        let mut page = SlottedPage::from_bytes(bytes, page_id)?;

        let chained_first_page = page.get(slot).and_then(|data| {
            if data.len() > STORED_ROW_HEADER && data[8] == STORED_CHAIN {
                bincode::serde::decode_from_slice::<RowStorage, _>(&data[STORED_ROW_HEADER..], bincode::config::standard())
                    .ok()
                    .and_then(|(descriptor, _)| match descriptor {
                        RowStorage::ChainHead { first_page, .. } => Some(first_page),
                        _ => None,
                    })
            } else {
                None
            }
        });
        if let Some(first_page) = chained_first_page {
            let mut container = self.container.lock();
            overflow::free_chain(&mut container, first_page)?;
        }

        page.delete(slot);
        self.persist_heap_page(page_id, page.finalize())?;
        Ok(())
    }
}

fn index_key_for(value: &Value, column: &Column) -> IndexKey {
    match (value, &column.collation) {
        (Value::Text(_), Some(collation)) => IndexKey::with_collation(value.clone(), collation.clone()),
        _ => IndexKey::new(value.clone()),
    }
}

fn row_to_map(schema: &Schema, row: &Row) -> HashMap<String, LiteralValue> {
    schema.columns.iter().zip(row.iter()).map(|(c, v)| (c.name.clone(), value_to_literal(v))).collect()
}

fn row_matches(schema: &Schema, row: &Row, filter: Option<&Expression>) -> Result<Option<bool>> {
    match filter {
        None => Ok(None),
        Some(expr) => {
            let evaluator = ExpressionEvaluator::new(row_to_map(schema, row));
            Ok(Some(evaluator.evaluate(expr)?.as_bool().unwrap_or(false)))
        }
    }
}

fn project(schema: &Schema, row: &Row, columns: &[String]) -> Result<Row> {
    columns
        .iter()
        .map(|name| {
            schema
                .column_index(name)
                .and_then(|idx| row.get(idx).cloned())
                .ok_or_else(|| DbError::SchemaError(format!("unknown column '{name}'")))
        })
        .collect()
}

fn sort_rows(rows: &mut [Row], columns: &[String], order_by: &[crate::parser::OrderByClause]) {
    if order_by.is_empty() {
        return;
    }
    let positions: Vec<(usize, bool)> = order_by
        .iter()
        .filter_map(|ob| columns.iter().position(|c| c == &ob.column).map(|idx| (idx, ob.ascending)))
        .collect();
    rows.sort_by(|a, b| {
        for (idx, ascending) in &positions {
            let ord = a[*idx].partial_cmp(&b[*idx]).unwrap_or(std::cmp::Ordering::Equal);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn apply_limit_offset(rows: &mut Vec<Row>, limit: Option<u64>, offset: Option<u64>) {
    if let Some(offset) = offset {
        let offset = offset as usize;
        if offset >= rows.len() {
            rows.clear();
        } else {
            rows.drain(0..offset);
        }
    }
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
}

fn group_rows<'a>(schema: &Schema, rows: &[&'a Row], group_by: &[String]) -> Result<Vec<(Row, Vec<&'a Row>)>> {
    if group_by.is_empty() {
        return Ok(vec![(Vec::new(), rows.to_vec())]);
    }
    let idxs: Vec<usize> = group_by
        .iter()
        .map(|c| schema.column_index(c).ok_or_else(|| DbError::SchemaError(format!("unknown GROUP BY column '{c}'"))))
        .collect::<Result<Vec<_>>>()?;

    let mut groups: Vec<(Row, Vec<&'a Row>)> = Vec::new();
    for row in rows {
        let key: Row = idxs.iter().map(|i| row[*i].clone()).collect();
        if let Some(existing) = groups.iter_mut().find(|(k, _)| k == &key) {
            existing.1.push(row);
        } else {
            groups.push((key, vec![row]));
        }
    }
    Ok(groups)
}

fn compute_aggregate(schema: &Schema, group: &[&Row], func: AggregateFunc, arg: Option<&str>) -> Result<Value> {
    if func == AggregateFunc::Count {
        return Ok(Value::Integer(group.len() as i64));
    }
    let col_name = arg.ok_or_else(|| DbError::SchemaError("aggregate needs a column argument".to_string()))?;
    let col_idx = schema.column_index(col_name).ok_or_else(|| DbError::SchemaError(format!("unknown column '{col_name}'")))?;
    let numbers: Vec<f64> = group
        .iter()
        .filter_map(|row| match &row[col_idx] {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        })
        .collect();

    Ok(match func {
        AggregateFunc::Count => unreachable!(),
        AggregateFunc::Sum => Value::Float(numbers.iter().sum()),
        AggregateFunc::Avg => {
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFunc::Min => numbers.iter().cloned().fold(None, |acc, x| Some(acc.map_or(x, |a: f64| a.min(x)))).map(Value::Float).unwrap_or(Value::Null),
        AggregateFunc::Max => numbers.iter().cloned().fold(None, |acc, x| Some(acc.map_or(x, |a: f64| a.max(x)))).map(Value::Float).unwrap_or(Value::Null),
    })
}

fn aggregate_func_from_name(name: &str) -> Option<AggregateFunc> {
    match name.to_uppercase().as_str() {
        "COUNT" => Some(AggregateFunc::Count),
        "SUM" => Some(AggregateFunc::Sum),
        "AVG" => Some(AggregateFunc::Avg),
        "MIN" => Some(AggregateFunc::Min),
        "MAX" => Some(AggregateFunc::Max),
        _ => None,
    }
}

/// Replaces aggregate function calls in a HAVING expression with the
/// literal value computed over the current group, so the plain expression
/// evaluator -- which has no notion of aggregates -- can run unmodified.
fn substitute_aggregates(expr: &Expression, schema: &Schema, group: &[&Row]) -> Result<Expression> {
    let recurse = |e: &Expression| substitute_aggregates(e, schema, group);
    Ok(match expr {
        Expression::Function { name, args } if aggregate_func_from_name(name).is_some() => {
            let func = aggregate_func_from_name(name).expect("checked above");
            let arg = args.first().and_then(|a| match a {
                Expression::Column(c) => Some(c.clone()),
                _ => None,
            });
            let value = compute_aggregate(schema, group, func, arg.as_deref())?;
            Expression::Literal(value_to_literal(&value))
        }
        Expression::Function { name, args } => {
            Expression::Function { name: name.clone(), args: args.iter().map(recurse).collect::<Result<Vec<_>>>()? }
        }
        Expression::BinaryOp { left, op, right } => {
            Expression::BinaryOp { left: Box::new(recurse(left)?), op: *op, right: Box::new(recurse(right)?) }
        }
        Expression::UnaryOp { op, expr } => Expression::UnaryOp { op: *op, expr: Box::new(recurse(expr)?) },
        Expression::Between { expr, low, high, negated } => Expression::Between {
            expr: Box::new(recurse(expr)?),
            low: Box::new(recurse(low)?),
            high: Box::new(recurse(high)?),
            negated: *negated,
        },
        Expression::In { expr, list, negated } => Expression::In {
            expr: Box::new(recurse(expr)?),
            list: list.iter().map(recurse).collect::<Result<Vec<_>>>()?,
            negated: *negated,
        },
        Expression::IsNull { expr, negated } => Expression::IsNull { expr: Box::new(recurse(expr)?), negated: *negated },
        Expression::Like { expr, pattern, escape, negated } => Expression::Like {
            expr: Box::new(recurse(expr)?),
            pattern: Box::new(recurse(pattern)?),
            escape: escape.as_ref().map(|e| recurse(e)).transpose()?.map(Box::new),
            negated: *negated,
        },
        Expression::Case { operand, conditions, else_result } => Expression::Case {
            operand: operand.as_ref().map(|e| recurse(e)).transpose()?.map(Box::new),
            conditions: conditions
                .iter()
                .map(|(w, t)| Ok((recurse(w)?, recurse(t)?)))
                .collect::<Result<Vec<_>>>()?,
            else_result: else_result.as_ref().map(|e| recurse(e)).transpose()?.map(Box::new),
        },
        other => other.clone(),
    })
}

fn value_to_literal(v: &Value) -> LiteralValue {
    match v {
        Value::Null => LiteralValue::Null,
        Value::Boolean(b) => LiteralValue::Boolean(*b),
        Value::Integer(i) => LiteralValue::Integer(*i),
        Value::Float(f) => LiteralValue::Float(*f),
        Value::Text(s) => LiteralValue::String(s.clone()),
        Value::Date(d) => LiteralValue::Date(d.to_string()),
        Value::Timestamp(t) => LiteralValue::Timestamp(t.to_string()),
        other => LiteralValue::String(other.to_string()),
    }
}

fn literal_to_value(lit: LiteralValue, dt: &DataType) -> Result<Value> {
    Ok(match (lit, dt) {
        (LiteralValue::Null, _) => Value::Null,
        (LiteralValue::Boolean(b), DataType::Boolean) => Value::Boolean(b),
        (LiteralValue::Integer(i), DataType::Integer | DataType::BigInt) => Value::Integer(i),
        (LiteralValue::Integer(i), DataType::Float | DataType::Double | DataType::Decimal) => Value::Float(i as f64),
        (LiteralValue::Float(f), DataType::Float | DataType::Double | DataType::Decimal) => Value::Float(f),
        (LiteralValue::Float(f), DataType::Integer | DataType::BigInt) => Value::Integer(f as i64),
        (LiteralValue::String(s), DataType::Varchar(_) | DataType::Text) => Value::Text(s),
        (LiteralValue::String(s), DataType::Uuid | DataType::SortableUuid) => Value::Uuid(
            uuid::Uuid::parse_str(&s).map_err(|e| DbError::SchemaError(format!("bad uuid literal: {e}")))?,
        ),
        (LiteralValue::Integer(i), DataType::Date) => Value::Date(i as i32),
        (LiteralValue::Integer(i), DataType::Timestamp) => Value::Timestamp(i),
        (other, dt) => return Err(DbError::SchemaError(format!("literal {other:?} is not compatible with column type {dt:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexKind;
    use crate::config::WalDurability;
    use crate::parser::SqlParser;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    /// Builds a standalone executor over a temp-file-backed WAL and
    /// container, with no engine wrapping it: `execute` runs with no active
    /// writer transaction, so physical page writes go straight to the
    /// container (see `persist_heap_page`).
    fn new_executor() -> Executor {
        let wal_tmp = NamedTempFile::new().unwrap();
        let wal_path = wal_tmp.path().to_path_buf();
        std::fs::remove_file(&wal_path).ok();
        let wal = crate::transaction::WalManager::create(&wal_path, 64 * 1024, 256, WalDurability::FullSync).unwrap();
        let txn_manager = Arc::new(TransactionManager::new(wal, Duration::from_millis(200)));

        let container_tmp = NamedTempFile::new().unwrap();
        let container_path = container_tmp.path().to_path_buf();
        std::fs::remove_file(&container_path).ok();
        let container = Arc::new(Mutex::new(ContainerFile::create(&container_path, 4096, 0).unwrap()));

        Executor::new(Arc::new(Catalog::new()), Arc::new(IndexManager::new()), txn_manager, container, 4096, 256)
    }

    fn run(executor: &Executor, sql: &str) -> Vec<QueryResult> {
        let parser = SqlParser::new();
        parser.parse(sql).unwrap().into_iter().map(|s| executor.execute(s).unwrap()).collect()
    }

    #[test]
    fn create_insert_select_round_trips() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE users (id INT, name VARCHAR(64))");
        run(&executor, "INSERT INTO users (id, name) VALUES (1, 'Ada')");
        run(&executor, "INSERT INTO users (id, name) VALUES (2, 'Bob')");

        let results = run(&executor, "SELECT id, name FROM users WHERE id > 1");
        assert_eq!(results[0].rows.len(), 1);
        assert_eq!(results[0].rows[0][1], Value::Text("Bob".to_string()));
    }

    #[test]
    fn update_and_delete_affect_expected_rows() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE t (id INT, n INT)");
        run(&executor, "INSERT INTO t (id, n) VALUES (1, 10)");
        run(&executor, "INSERT INTO t (id, n) VALUES (2, 20)");

        let updated = run(&executor, "UPDATE t SET n = 99 WHERE id = 1");
        assert_eq!(updated[0].rows_affected, 1);

        let deleted = run(&executor, "DELETE FROM t WHERE id = 2");
        assert_eq!(deleted[0].rows_affected, 1);

        let remaining = run(&executor, "SELECT id, n FROM t");
        assert_eq!(remaining[0].rows, vec![vec![Value::Integer(1), Value::Integer(99)]]);
    }

    #[test]
    fn index_lookup_reflects_inserted_rows() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE t (id INT, name VARCHAR(32))");
        executor.create_index("t", "by_name", vec!["name".to_string()], IndexKind::BTree).unwrap();
        run(&executor, "INSERT INTO t (id, name) VALUES (1, 'Ada')");

        let index = executor.indexes.get("t", "by_name").unwrap();
        let rows = index.lookup(&IndexKey::new(Value::Text("Ada".to_string()))).unwrap();
        assert_eq!(rows.len(), 1);
        let (page_id, slot) = unpack_row_id(rows[0]);
        assert_eq!((page_id, slot), (0, 0));
    }

    #[test]
    fn count_aggregate_groups_by_column() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE orders (id INT, status VARCHAR(16))");
        run(&executor, "INSERT INTO orders (id, status) VALUES (1, 'open')");
        run(&executor, "INSERT INTO orders (id, status) VALUES (2, 'open')");
        run(&executor, "INSERT INTO orders (id, status) VALUES (3, 'closed')");

        let results = run(&executor, "SELECT status, COUNT(id) FROM orders GROUP BY status");
        assert_eq!(results[0].rows.len(), 2);
    }

    #[test]
    fn rows_survive_a_reload_from_their_heap_pages() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE t (id INT, n INT)");
        run(&executor, "INSERT INTO t (id, n) VALUES (1, 10)");
        run(&executor, "INSERT INTO t (id, n) VALUES (2, 20)");

        let schema = executor.catalog.get_table("t").unwrap();
        assert!(!schema.heap_pages.is_empty());

        executor.load_heap_from_pages("t", &schema.heap_pages).unwrap();
        let results = run(&executor, "SELECT id, n FROM t");
        assert_eq!(results[0].rows.len(), 2);
    }

    #[test]
    fn oversized_row_round_trips_through_an_overflow_chain() {
        let executor = new_executor();
        run(&executor, "CREATE TABLE t (id INT, blob VARCHAR(4000))");
        let long_value = "x".repeat(2000);
        executor
            .insert_rows("t", vec![vec![Value::Integer(1), Value::Text(long_value.clone())]])
            .unwrap();

        let schema = executor.catalog.get_table("t").unwrap();
        executor.load_heap_from_pages("t", &schema.heap_pages).unwrap();
        let results = run(&executor, "SELECT blob FROM t");
        assert_eq!(results[0].rows[0][0], Value::Text(long_value));
    }
}
