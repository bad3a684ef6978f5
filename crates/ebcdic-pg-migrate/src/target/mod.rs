//! Target database access.
//!
//! [`TargetClient`] is the seam the load and verify engines work against:
//! a PostgreSQL implementation for production and an in-memory double for
//! tests. Loaded tables carry two synthetic columns, `_source_row` (1-based
//! position in the source file) and `_split_id`, which make reloads
//! idempotent and verification addressable per split.

mod memory;
mod pools;
mod postgres;

pub use memory::MemoryTarget;
pub use pools::{MemoryTargetFactory, PgTargetFactory, TargetFactory};
pub use postgres::PgTarget;

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// One fetched target row: source row number plus the business column
/// values, NULLs as `None`.
pub type TargetRow = (i64, Vec<Option<String>>);

/// Operations the pipeline needs against a target database.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;

    /// Load one split file into `table` within a single transaction:
    /// delete any rows already tagged with `split_id`, then bulk-append the
    /// file's records with the split id added as the final column.
    /// All-or-nothing; a re-run after failure cannot duplicate rows.
    ///
    /// `columns` is the full load column list (business columns plus the
    /// two synthetic columns, in file order).
    async fn load_split(
        &self,
        table: &str,
        columns: &[String],
        split_id: i64,
        split_path: &Path,
    ) -> Result<u64>;

    /// Rows currently tagged with `split_id`.
    async fn count_split_rows(&self, table: &str, split_id: i64) -> Result<i64>;

    /// Total rows in the table.
    async fn count_table_rows(&self, table: &str) -> Result<i64>;

    /// Business-column values for a split, as text, ordered by source row.
    async fn fetch_split_rows(
        &self,
        table: &str,
        columns: &[String],
        split_id: i64,
    ) -> Result<Vec<TargetRow>>;
}

/// Double-quote an identifier for SQL interpolation.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("accounts"), "\"accounts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
