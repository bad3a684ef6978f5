//! Metadata store: the repository the engines coordinate through.
//!
//! The trait exposes only the specific queries the engines need:
//! find-by-status, conditional update-status, counts and the idempotent
//! batch insert. No identity map, no lazy loading.
//!
//! Implementations:
//! - [`PgMetaStore`]: PostgreSQL, for production
//! - [`MemoryStore`]: in-process maps, for tests and single-process runs

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgMetaStore;

use crate::error::Result;
use crate::model::{
    Batch, BatchStatus, FileTask, FileTaskStatus, Job, JobState, NewSplit, Split, SplitStatus,
    TargetConn,
};
use async_trait::async_trait;
use std::path::PathBuf;

/// Input record for job creation.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub watch_dir: PathBuf,
    pub target: TargetConn,
}

/// Input record for batch creation.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub job_id: i64,
    /// Absolute signal-file path; the idempotency key.
    pub signal_path: String,
    pub table: String,
    pub ddl_path: PathBuf,
}

/// Repository over the persisted pipeline records.
///
/// Every status update here is an independently committed unit of work:
/// a crash after the call leaves the status durably advanced, a crash
/// before leaves it durably un-advanced, never ambiguous.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Backend name for logging.
    fn store_type(&self) -> &'static str;

    /// Create the store's schema. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    // === Jobs ===

    async fn insert_job(&self, job: NewJob) -> Result<Job>;
    async fn get_job(&self, id: i64) -> Result<Option<Job>>;
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn set_job_state(&self, id: i64, state: JobState) -> Result<bool>;

    // === Batches ===

    /// Create a batch together with one FileTask per source path, atomically.
    /// Returns `None` without side effects if the signal path is already
    /// recorded.
    async fn create_batch(&self, batch: NewBatch, sources: Vec<PathBuf>) -> Result<Option<Batch>>;

    async fn get_batch(&self, id: i64) -> Result<Option<Batch>>;
    async fn batches_in_status(&self, status: BatchStatus) -> Result<Vec<Batch>>;
    async fn batches_for_job(&self, job_id: i64) -> Result<Vec<Batch>>;

    /// Conditional status write; returns false when the current status no
    /// longer matches `from`.
    async fn update_batch_status(&self, id: i64, from: BatchStatus, to: BatchStatus)
        -> Result<bool>;

    // === File tasks ===

    async fn get_file_task(&self, id: i64) -> Result<Option<FileTask>>;
    async fn file_tasks_in_status(&self, status: FileTaskStatus) -> Result<Vec<FileTask>>;
    async fn file_tasks_for_batch(&self, batch_id: i64) -> Result<Vec<FileTask>>;

    /// FileTasks under a batch not yet in a rollup-complete status.
    async fn count_file_tasks_not_complete(&self, batch_id: i64) -> Result<i64>;

    /// Conditional status write tagged with the acting node. The `WHERE
    /// status = from` guard is the cross-node optimistic-concurrency
    /// mechanism: a racing worker sees a mismatched current status and
    /// loses.
    async fn update_file_task_status(
        &self,
        id: i64,
        from: FileTaskStatus,
        to: FileTaskStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool>;

    async fn set_file_task_progress(&self, id: i64, progress: i16) -> Result<()>;
    async fn set_file_task_counts(&self, id: i64, total_rows: i64, error_rows: i64) -> Result<()>;

    // === Splits ===

    async fn insert_split(&self, split: NewSplit) -> Result<Split>;
    async fn get_split(&self, id: i64) -> Result<Option<Split>>;
    async fn splits_in_status(&self, status: SplitStatus) -> Result<Vec<Split>>;
    async fn splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>>;

    /// Conditional status write tagged with the acting node.
    async fn update_split_status(
        &self,
        id: i64,
        from: SplitStatus,
        to: SplitStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool>;

    /// Remove all split records for a task (transcode retry discards prior
    /// artifacts). Returns the removed records so files can be cleaned up.
    async fn delete_splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>>;

    // === Crash recovery ===

    /// Reset every transient in-flight status owned by `node` (or not yet
    /// owned) back to its waiting status. Runs before dispatch starts.
    async fn reset_in_flight(&self, node: &str) -> Result<u64>;
}
