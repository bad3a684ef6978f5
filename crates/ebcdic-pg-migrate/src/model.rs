//! Persisted entities and their status state machines.
//!
//! These are plain data records; all persistence goes through the
//! [`MetaStore`](crate::store::MetaStore) repository. Each status enum
//! carries an explicit legal-transition table; everything that moves a
//! status must consult it via `can_transition_to`.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A migration configuration: one watched source, one target database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,

    /// Human-readable job name.
    pub name: String,

    /// Directory the external watcher observes for signal files.
    pub watch_dir: PathBuf,

    /// Target database connection parameters.
    pub target: TargetConn,

    /// Active / stopped / paused gate consulted by every transition.
    pub state: JobState,
}

/// Target database connection parameters, stored per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConn {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Target schema holding the business tables.
    pub schema: String,
    /// Upper bound for the per-job connection pool.
    pub max_connections: usize,
}

impl TargetConn {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// Job gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    Stopped,
    Paused,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Active => "active",
            JobState::Stopped => "stopped",
            JobState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(JobState::Active),
            "stopped" => Ok(JobState::Stopped),
            "paused" => Ok(JobState::Paused),
            _ => Err(MigrateError::store(format!("Invalid job state: {}", s))),
        }
    }

    /// Whether tasks under this job may make progress.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Active)
    }
}

/// One discovered migration request (one signal file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub job_id: i64,

    /// Absolute signal-file path; the idempotency key for batch creation.
    pub signal_path: String,

    /// Target table name.
    pub table: String,

    /// Path to the column-definition descriptor file.
    pub ddl_path: PathBuf,

    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Finished,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(BatchStatus::Processing),
            "finished" => Ok(BatchStatus::Finished),
            _ => Err(MigrateError::store(format!("Invalid batch status: {}", s))),
        }
    }

    pub fn can_transition_to(self, to: BatchStatus) -> bool {
        matches!((self, to), (BatchStatus::Processing, BatchStatus::Finished))
    }
}

/// One legacy source CSV file under a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTask {
    pub id: i64,
    pub batch_id: i64,

    /// Legacy-encoded source file.
    pub source_path: PathBuf,

    pub status: FileTaskStatus,

    /// Transcode progress, 0-100.
    pub progress: i16,

    /// Human-readable failure detail, if any.
    pub error: Option<String>,

    /// Data rows seen by the transcoder.
    pub total_rows: i64,

    /// Rows routed to the error file.
    pub error_rows: i64,

    /// Node that last worked on this task.
    pub node: Option<String>,
}

/// FileTask lifecycle status.
///
/// `ProcessingSplits` is a parked state: the task no longer participates in
/// dispatch and is advanced by rollup once all of its splits are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTaskStatus {
    New,
    Transcoding,
    FailTranscode,
    ProcessingSplits,
    Finished,
    FinishedWithError,
}

impl FileTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileTaskStatus::New => "new",
            FileTaskStatus::Transcoding => "transcoding",
            FileTaskStatus::FailTranscode => "fail_transcode",
            FileTaskStatus::ProcessingSplits => "processing_splits",
            FileTaskStatus::Finished => "finished",
            FileTaskStatus::FinishedWithError => "finished_with_error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(FileTaskStatus::New),
            "transcoding" => Ok(FileTaskStatus::Transcoding),
            "fail_transcode" => Ok(FileTaskStatus::FailTranscode),
            "processing_splits" => Ok(FileTaskStatus::ProcessingSplits),
            "finished" => Ok(FileTaskStatus::Finished),
            "finished_with_error" => Ok(FileTaskStatus::FinishedWithError),
            _ => Err(MigrateError::store(format!(
                "Invalid file task status: {}",
                s
            ))),
        }
    }

    /// Legal-transition table.
    ///
    /// `Transcoding -> New` is the crash-recovery reset; `FailTranscode ->
    /// New` is the manual retry. `Transcoding -> Finished*` covers files
    /// that produce no splits at all (empty, or every row bad).
    pub fn can_transition_to(self, to: FileTaskStatus) -> bool {
        use FileTaskStatus::*;
        matches!(
            (self, to),
            (New, Transcoding)
                | (Transcoding, ProcessingSplits)
                | (Transcoding, FailTranscode)
                | (Transcoding, Finished)
                | (Transcoding, FinishedWithError)
                | (Transcoding, New)
                | (FailTranscode, New)
                | (ProcessingSplits, Finished)
                | (ProcessingSplits, FinishedWithError)
        )
    }

    /// Terminal for batch rollup purposes. `FailTranscode` is excluded:
    /// it is human-retriable and holds the batch open.
    pub fn is_rollup_complete(self) -> bool {
        matches!(
            self,
            FileTaskStatus::Finished | FileTaskStatus::FinishedWithError
        )
    }
}

/// One chunk of a transcoded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub id: i64,
    pub file_task_id: i64,

    /// UTF-8 split file path.
    pub path: PathBuf,

    /// 1-based position of this split's first row in the source file.
    pub start_row: i64,

    /// Number of rows in the split file.
    pub row_count: i64,

    pub status: SplitStatus,
    pub error: Option<String>,
    pub node: Option<String>,
}

/// New split record, created by the transcode engine as a chunk closes.
#[derive(Debug, Clone)]
pub struct NewSplit {
    pub file_task_id: i64,
    pub path: PathBuf,
    pub start_row: i64,
    pub row_count: i64,
}

/// Split lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStatus {
    WaitLoad,
    Loading,
    WaitVerify,
    Verifying,
    Pass,
    FailLoad,
    FailVerify,
}

impl SplitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SplitStatus::WaitLoad => "wait_load",
            SplitStatus::Loading => "loading",
            SplitStatus::WaitVerify => "wait_verify",
            SplitStatus::Verifying => "verifying",
            SplitStatus::Pass => "pass",
            SplitStatus::FailLoad => "fail_load",
            SplitStatus::FailVerify => "fail_verify",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "wait_load" => Ok(SplitStatus::WaitLoad),
            "loading" => Ok(SplitStatus::Loading),
            "wait_verify" => Ok(SplitStatus::WaitVerify),
            "verifying" => Ok(SplitStatus::Verifying),
            "pass" => Ok(SplitStatus::Pass),
            "fail_load" => Ok(SplitStatus::FailLoad),
            "fail_verify" => Ok(SplitStatus::FailVerify),
            _ => Err(MigrateError::store(format!("Invalid split status: {}", s))),
        }
    }

    /// Legal-transition table.
    ///
    /// `Loading -> WaitLoad` and `Verifying -> WaitVerify` are the
    /// crash-recovery resets; `Fail* -> Wait*` are the manual retries.
    pub fn can_transition_to(self, to: SplitStatus) -> bool {
        use SplitStatus::*;
        matches!(
            (self, to),
            (WaitLoad, Loading)
                | (Loading, WaitVerify)
                | (Loading, FailLoad)
                | (Loading, WaitLoad)
                | (WaitVerify, Verifying)
                | (Verifying, Pass)
                | (Verifying, FailVerify)
                | (Verifying, WaitVerify)
                | (FailLoad, WaitLoad)
                | (FailVerify, WaitVerify)
        )
    }

    /// Still being worked on or waiting for work.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SplitStatus::WaitLoad
                | SplitStatus::Loading
                | SplitStatus::WaitVerify
                | SplitStatus::Verifying
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, SplitStatus::FailLoad | SplitStatus::FailVerify)
    }
}
