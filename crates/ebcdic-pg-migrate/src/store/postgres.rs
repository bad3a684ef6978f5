//! PostgreSQL-backed metadata store.
//!
//! All pipeline records live in a dedicated schema. Conditional status
//! updates use a `WHERE status = $from` guard and report whether the row
//! was actually written, which is the optimistic-concurrency mechanism the
//! gateway builds on.

use super::{MetaStore, NewBatch, NewJob};
use crate::config::StoreConfig;
use crate::error::{MigrateError, Result};
use crate::model::{
    Batch, BatchStatus, FileTask, FileTaskStatus, Job, JobState, NewSplit, Split, SplitStatus,
    TargetConn,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::path::PathBuf;
use tokio_postgres::{NoTls, Row};

/// PostgreSQL metadata store.
pub struct PgMetaStore {
    pool: Pool,
    schema: String,
}

impl PgMetaStore {
    /// Build a pooled store from configuration.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .connection_string()
            .parse()
            .map_err(|e| MigrateError::Config(format!("store connection: {}", e)))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| MigrateError::store(format!("store pool: {}", e)))?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    fn job_from_row(row: &Row) -> Result<Job> {
        let state: String = row.get("state");
        let watch_dir: String = row.get("watch_dir");
        Ok(Job {
            id: row.get("id"),
            name: row.get("name"),
            watch_dir: PathBuf::from(watch_dir),
            target: TargetConn {
                host: row.get("target_host"),
                port: row.get::<_, i32>("target_port") as u16,
                database: row.get("target_database"),
                user: row.get("target_user"),
                password: row.get("target_password"),
                schema: row.get("target_schema"),
                max_connections: row.get::<_, i32>("target_max_connections") as usize,
            },
            state: JobState::parse(&state)?,
        })
    }

    fn batch_from_row(row: &Row) -> Result<Batch> {
        let status: String = row.get("status");
        let ddl_path: String = row.get("ddl_path");
        let created_at: DateTime<Utc> = row.get("created_at");
        Ok(Batch {
            id: row.get("id"),
            job_id: row.get("job_id"),
            signal_path: row.get("signal_path"),
            table: row.get("table_name"),
            ddl_path: PathBuf::from(ddl_path),
            status: BatchStatus::parse(&status)?,
            created_at,
        })
    }

    fn file_task_from_row(row: &Row) -> Result<FileTask> {
        let status: String = row.get("status");
        let source_path: String = row.get("source_path");
        Ok(FileTask {
            id: row.get("id"),
            batch_id: row.get("batch_id"),
            source_path: PathBuf::from(source_path),
            status: FileTaskStatus::parse(&status)?,
            progress: row.get("progress"),
            error: row.get("error"),
            total_rows: row.get("total_rows"),
            error_rows: row.get("error_rows"),
            node: row.get("node"),
        })
    }

    fn split_from_row(row: &Row) -> Result<Split> {
        let status: String = row.get("status");
        let path: String = row.get("path");
        Ok(Split {
            id: row.get("id"),
            file_task_id: row.get("file_task_id"),
            path: PathBuf::from(path),
            start_row: row.get("start_row"),
            row_count: row.get("row_count"),
            status: SplitStatus::parse(&status)?,
            error: row.get("error"),
            node: row.get("node"),
        })
    }
}

#[async_trait]
impl MetaStore for PgMetaStore {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.jobs (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    name TEXT NOT NULL,
                    watch_dir TEXT NOT NULL,
                    state TEXT NOT NULL CHECK (state IN ('active', 'stopped', 'paused')),
                    target_host TEXT NOT NULL,
                    target_port INT NOT NULL,
                    target_database TEXT NOT NULL,
                    target_user TEXT NOT NULL,
                    target_password TEXT NOT NULL,
                    target_schema TEXT NOT NULL,
                    target_max_connections INT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.batches (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    job_id BIGINT NOT NULL REFERENCES {}.jobs(id),
                    signal_path TEXT NOT NULL UNIQUE,
                    table_name TEXT NOT NULL,
                    ddl_path TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('processing', 'finished')),
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema, self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.file_tasks (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    batch_id BIGINT NOT NULL REFERENCES {}.batches(id),
                    source_path TEXT NOT NULL,
                    status TEXT NOT NULL,
                    progress SMALLINT NOT NULL DEFAULT 0,
                    error TEXT,
                    total_rows BIGINT NOT NULL DEFAULT 0,
                    error_rows BIGINT NOT NULL DEFAULT 0,
                    node TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema, self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.splits (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    file_task_id BIGINT NOT NULL REFERENCES {}.file_tasks(id),
                    path TEXT NOT NULL,
                    start_row BIGINT NOT NULL,
                    row_count BIGINT NOT NULL,
                    status TEXT NOT NULL,
                    error TEXT,
                    node TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema, self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_file_tasks_status
                    ON {}.file_tasks(status)",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_splits_status
                    ON {}.splits(status)",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO {}.jobs
                     (name, watch_dir, state, target_host, target_port, target_database,
                      target_user, target_password, target_schema, target_max_connections)
                     VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $9)
                     RETURNING *",
                    self.schema
                ),
                &[
                    &job.name,
                    &job.watch_dir.to_string_lossy().as_ref(),
                    &job.target.host,
                    &(job.target.port as i32),
                    &job.target.database,
                    &job.target.user,
                    &job.target.password,
                    &job.target.schema,
                    &(job.target.max_connections as i32),
                ],
            )
            .await?;
        Self::job_from_row(&row)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT * FROM {}.jobs WHERE id = $1", self.schema),
                &[&id],
            )
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!("SELECT * FROM {}.jobs ORDER BY id", self.schema),
                &[],
            )
            .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn set_job_state(&self, id: i64, state: JobState) -> Result<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!("UPDATE {}.jobs SET state = $1 WHERE id = $2", self.schema),
                &[&state.as_str(), &id],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn create_batch(&self, batch: NewBatch, sources: Vec<PathBuf>) -> Result<Option<Batch>> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "INSERT INTO {}.batches (job_id, signal_path, table_name, ddl_path, status)
                     VALUES ($1, $2, $3, $4, 'processing')
                     ON CONFLICT (signal_path) DO NOTHING
                     RETURNING *",
                    self.schema
                ),
                &[
                    &batch.job_id,
                    &batch.signal_path,
                    &batch.table,
                    &batch.ddl_path.to_string_lossy().as_ref(),
                ],
            )
            .await?;

        let record = match row {
            Some(r) => Self::batch_from_row(&r)?,
            None => {
                // Signal path already recorded: nothing to do
                tx.rollback().await?;
                return Ok(None);
            }
        };

        for source in &sources {
            tx.execute(
                &format!(
                    "INSERT INTO {}.file_tasks (batch_id, source_path, status)
                     VALUES ($1, $2, 'new')",
                    self.schema
                ),
                &[&record.id, &source.to_string_lossy().as_ref()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn get_batch(&self, id: i64) -> Result<Option<Batch>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT * FROM {}.batches WHERE id = $1", self.schema),
                &[&id],
            )
            .await?;
        row.as_ref().map(Self::batch_from_row).transpose()
    }

    async fn batches_in_status(&self, status: BatchStatus) -> Result<Vec<Batch>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.batches WHERE status = $1 ORDER BY id",
                    self.schema
                ),
                &[&status.as_str()],
            )
            .await?;
        rows.iter().map(Self::batch_from_row).collect()
    }

    async fn batches_for_job(&self, job_id: i64) -> Result<Vec<Batch>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.batches WHERE job_id = $1 ORDER BY id",
                    self.schema
                ),
                &[&job_id],
            )
            .await?;
        rows.iter().map(Self::batch_from_row).collect()
    }

    async fn update_batch_status(
        &self,
        id: i64,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.batches SET status = $1 WHERE id = $2 AND status = $3",
                    self.schema
                ),
                &[&to.as_str(), &id, &from.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn get_file_task(&self, id: i64) -> Result<Option<FileTask>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT * FROM {}.file_tasks WHERE id = $1", self.schema),
                &[&id],
            )
            .await?;
        row.as_ref().map(Self::file_task_from_row).transpose()
    }

    async fn file_tasks_in_status(&self, status: FileTaskStatus) -> Result<Vec<FileTask>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.file_tasks WHERE status = $1 ORDER BY id",
                    self.schema
                ),
                &[&status.as_str()],
            )
            .await?;
        rows.iter().map(Self::file_task_from_row).collect()
    }

    async fn file_tasks_for_batch(&self, batch_id: i64) -> Result<Vec<FileTask>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.file_tasks WHERE batch_id = $1 ORDER BY id",
                    self.schema
                ),
                &[&batch_id],
            )
            .await?;
        rows.iter().map(Self::file_task_from_row).collect()
    }

    async fn count_file_tasks_not_complete(&self, batch_id: i64) -> Result<i64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {}.file_tasks
                     WHERE batch_id = $1
                       AND status NOT IN ('finished', 'finished_with_error')",
                    self.schema
                ),
                &[&batch_id],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn update_file_task_status(
        &self,
        id: i64,
        from: FileTaskStatus,
        to: FileTaskStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.file_tasks
                     SET status = $1, error = COALESCE($2, error), node = $3, updated_at = NOW()
                     WHERE id = $4 AND status = $5",
                    self.schema
                ),
                &[&to.as_str(), &error, &node, &id, &from.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn set_file_task_progress(&self, id: i64, progress: i16) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "UPDATE {}.file_tasks SET progress = $1, updated_at = NOW() WHERE id = $2",
                self.schema
            ),
            &[&progress.clamp(0, 100), &id],
        )
        .await?;
        Ok(())
    }

    async fn set_file_task_counts(&self, id: i64, total_rows: i64, error_rows: i64) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "UPDATE {}.file_tasks
                 SET total_rows = $1, error_rows = $2, updated_at = NOW()
                 WHERE id = $3",
                self.schema
            ),
            &[&total_rows, &error_rows, &id],
        )
        .await?;
        Ok(())
    }

    async fn insert_split(&self, split: NewSplit) -> Result<Split> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO {}.splits (file_task_id, path, start_row, row_count, status)
                     VALUES ($1, $2, $3, $4, 'wait_load')
                     RETURNING *",
                    self.schema
                ),
                &[
                    &split.file_task_id,
                    &split.path.to_string_lossy().as_ref(),
                    &split.start_row,
                    &split.row_count,
                ],
            )
            .await?;
        Self::split_from_row(&row)
    }

    async fn get_split(&self, id: i64) -> Result<Option<Split>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT * FROM {}.splits WHERE id = $1", self.schema),
                &[&id],
            )
            .await?;
        row.as_ref().map(Self::split_from_row).transpose()
    }

    async fn splits_in_status(&self, status: SplitStatus) -> Result<Vec<Split>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.splits WHERE status = $1 ORDER BY id",
                    self.schema
                ),
                &[&status.as_str()],
            )
            .await?;
        rows.iter().map(Self::split_from_row).collect()
    }

    async fn splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT * FROM {}.splits WHERE file_task_id = $1 ORDER BY start_row",
                    self.schema
                ),
                &[&file_task_id],
            )
            .await?;
        rows.iter().map(Self::split_from_row).collect()
    }

    async fn update_split_status(
        &self,
        id: i64,
        from: SplitStatus,
        to: SplitStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.splits
                     SET status = $1, error = COALESCE($2, error), node = $3, updated_at = NOW()
                     WHERE id = $4 AND status = $5",
                    self.schema
                ),
                &[&to.as_str(), &error, &node, &id, &from.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn delete_splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "DELETE FROM {}.splits WHERE file_task_id = $1 RETURNING *",
                    self.schema
                ),
                &[&file_task_id],
            )
            .await?;
        let mut removed: Vec<Split> = rows
            .iter()
            .map(Self::split_from_row)
            .collect::<Result<_>>()?;
        removed.sort_by_key(|s| s.start_row);
        Ok(removed)
    }

    async fn reset_in_flight(&self, node: &str) -> Result<u64> {
        let conn = self.pool.get().await?;
        let mut reset = 0u64;

        reset += conn
            .execute(
                &format!(
                    "UPDATE {}.file_tasks SET status = 'new', updated_at = NOW()
                     WHERE status = 'transcoding' AND (node = $1 OR node IS NULL)",
                    self.schema
                ),
                &[&node],
            )
            .await?;

        reset += conn
            .execute(
                &format!(
                    "UPDATE {}.splits SET status = 'wait_load', updated_at = NOW()
                     WHERE status = 'loading' AND (node = $1 OR node IS NULL)",
                    self.schema
                ),
                &[&node],
            )
            .await?;

        reset += conn
            .execute(
                &format!(
                    "UPDATE {}.splits SET status = 'wait_verify', updated_at = NOW()
                     WHERE status = 'verifying' AND (node = $1 OR node IS NULL)",
                    self.schema
                ),
                &[&node],
            )
            .await?;

        Ok(reset)
    }
}
