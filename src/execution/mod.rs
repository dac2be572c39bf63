// Statement execution: walks one parsed `SqlStatement` against the catalog,
// secondary indexes, and a row heap backed by the container's slotted pages.
// No join planner, no CTEs, no subqueries, no cost-based optimizer -- those
// belong to the optional external query engine, not this crate.

pub mod executor;

pub use executor::Executor;

use crate::common::Value;
use serde::{Deserialize, Serialize};

/// Caps how many rows a single query materializes, so a runaway `SELECT`
/// can't exhaust memory before `LIMIT` or streaming gets a chance to help.
pub const MAX_RESULT_ROWS: usize = 1_000_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: usize,
}

impl QueryResult {
    pub fn rows(columns: Vec<String>, mut rows: Vec<Vec<Value>>) -> Self {
        if rows.len() > MAX_RESULT_ROWS {
            rows.truncate(MAX_RESULT_ROWS);
        }
        let rows_affected = rows.len();
        Self { columns, rows, rows_affected }
    }

    pub fn affected(rows_affected: usize) -> Self {
        Self { columns: Vec::new(), rows: Vec::new(), rows_affected }
    }
}
