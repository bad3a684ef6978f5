//! In-memory target double for tests and dry runs.
//!
//! Mirrors the COPY csv NULL convention: an empty field loads as NULL.

use super::{TargetClient, TargetRow};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredRow {
    split_id: i64,
    source_row: i64,
    values: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<StoredRow>>,
    fail_loads: HashSet<i64>,
}

/// Map-backed target. Split files are parsed with the same csv reader the
/// real load path uses.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    inner: Mutex<Inner>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next load of `split_id` fail (for failure-path tests).
    pub fn fail_load_for(&self, split_id: i64) {
        self.inner
            .lock()
            .expect("target lock poisoned")
            .fail_loads
            .insert(split_id);
    }

    /// Drop one loaded row of a split, producing a count mismatch.
    pub fn drop_one_row(&self, table: &str, split_id: i64) {
        let mut inner = self.inner.lock().expect("target lock poisoned");
        if let Some(rows) = inner.tables.get_mut(table) {
            if let Some(pos) = rows.iter().position(|r| r.split_id == split_id) {
                rows.remove(pos);
            }
        }
    }

    /// Overwrite one cell of a loaded row (for content-mismatch tests).
    pub fn corrupt_cell(&self, table: &str, split_id: i64, column: usize, value: &str) {
        let mut inner = self.inner.lock().expect("target lock poisoned");
        if let Some(rows) = inner.tables.get_mut(table) {
            if let Some(row) = rows.iter_mut().find(|r| r.split_id == split_id) {
                if let Some(cell) = row.values.get_mut(column) {
                    *cell = Some(value.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl TargetClient for MemoryTarget {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn load_split(
        &self,
        table: &str,
        _columns: &[String],
        split_id: i64,
        split_path: &Path,
    ) -> Result<u64> {
        let mut parsed = Vec::new();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(split_path)?;
        for record in reader.records() {
            let record = record?;
            let fields: Vec<&str> = record.iter().collect();
            let (source_field, business) = fields
                .split_last()
                .ok_or_else(|| MigrateError::load(split_id, "empty record"))?;
            let source_row: i64 = source_field
                .parse()
                .map_err(|_| MigrateError::load(split_id, "bad source row number"))?;
            parsed.push(StoredRow {
                split_id,
                source_row,
                values: business
                    .iter()
                    .map(|f| {
                        if f.is_empty() {
                            None
                        } else {
                            Some(f.to_string())
                        }
                    })
                    .collect(),
            });
        }

        let mut inner = self.inner.lock().expect("target lock poisoned");
        if inner.fail_loads.remove(&split_id) {
            return Err(MigrateError::load(split_id, "injected load failure"));
        }
        let rows = inner.tables.entry(table.to_string()).or_default();
        rows.retain(|r| r.split_id != split_id);
        let loaded = parsed.len() as u64;
        rows.extend(parsed);
        Ok(loaded)
    }

    async fn count_split_rows(&self, table: &str, split_id: i64) -> Result<i64> {
        let inner = self.inner.lock().expect("target lock poisoned");
        Ok(inner
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.split_id == split_id).count())
            .unwrap_or(0) as i64)
    }

    async fn count_table_rows(&self, table: &str) -> Result<i64> {
        let inner = self.inner.lock().expect("target lock poisoned");
        Ok(inner.tables.get(table).map(|rows| rows.len()).unwrap_or(0) as i64)
    }

    async fn fetch_split_rows(
        &self,
        table: &str,
        _columns: &[String],
        split_id: i64,
    ) -> Result<Vec<TargetRow>> {
        let inner = self.inner.lock().expect("target lock poisoned");
        let mut rows: Vec<TargetRow> = inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.split_id == split_id)
                    .map(|r| (r.source_row, r.values.clone()))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|(source_row, _)| *source_row);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_split(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_is_idempotent_per_split() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_split(&dir, "s1.csv", "a,1\nb,2\n");
        let target = MemoryTarget::new();
        let cols = vec!["v".to_string()];

        assert_eq!(target.load_split("t", &cols, 7, &path).await.unwrap(), 2);
        assert_eq!(target.load_split("t", &cols, 7, &path).await.unwrap(), 2);
        assert_eq!(target.count_split_rows("t", 7).await.unwrap(), 2);
        assert_eq!(target.count_table_rows("t").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_field_loads_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_split(&dir, "s1.csv", ",1\n");
        let target = MemoryTarget::new();
        target
            .load_split("t", &["v".to_string()], 1, &path)
            .await
            .unwrap();
        let rows = target
            .fetch_split_rows("t", &["v".to_string()], 1)
            .await
            .unwrap();
        assert_eq!(rows, vec![(1, vec![None])]);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_split(&dir, "s1.csv", "a,1\n");
        let target = MemoryTarget::new();
        target.fail_load_for(3);
        assert!(target
            .load_split("t", &["v".to_string()], 3, &path)
            .await
            .is_err());
        assert!(target
            .load_split("t", &["v".to_string()], 3, &path)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rows_ordered_by_source_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_split(&dir, "s1.csv", "b,2\na,1\n");
        let target = MemoryTarget::new();
        target
            .load_split("t", &["v".to_string()], 1, &path)
            .await
            .unwrap();
        let rows = target
            .fetch_split_rows("t", &["v".to_string()], 1)
            .await
            .unwrap();
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[1].0, 2);
    }
}
