//! Verify engine: confirm each loaded split against the target.
//!
//! Row-count verification always runs; content verification (lockstep
//! comparison against the split file) is opt-in per config. Mismatches are
//! findings, not errors: the split lands in FailVerify with a message and,
//! for content checks, a diff file next to the split file.

mod compare;
mod global;

pub use compare::{cells_equal, CompareOutcome, DiffLine, RowComparator};
pub use global::{classify, verify_job, TableReport, TableStatus};

use crate::config::VerifyConfig;
use crate::ddl::DdlFile;
use crate::error::{MigrateError, Result};
use crate::model::{Split, SplitStatus};
use crate::status::StatusGateway;
use crate::target::{TargetClient, TargetFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub struct VerifyEngine {
    gateway: Arc<StatusGateway>,
    targets: Arc<dyn TargetFactory>,
    config: VerifyConfig,
}

/// What the checks concluded for one split.
enum Verdict {
    Pass,
    Fail(String),
}

impl VerifyEngine {
    pub fn new(
        gateway: Arc<StatusGateway>,
        targets: Arc<dyn TargetFactory>,
        config: VerifyConfig,
    ) -> Self {
        Self {
            gateway,
            targets,
            config,
        }
    }

    /// Claim and verify one split. A lost claim is not an error.
    pub async fn run_split(&self, split_id: i64) -> Result<()> {
        if !self
            .gateway
            .transition_split(split_id, SplitStatus::WaitVerify, SplitStatus::Verifying, None)
            .await?
        {
            return Ok(());
        }

        match self.check(split_id).await {
            Ok(Verdict::Pass) => {
                info!(split = split_id, "split verified");
                self.gateway
                    .transition_split(split_id, SplitStatus::Verifying, SplitStatus::Pass, None)
                    .await?;
            }
            Ok(Verdict::Fail(message)) => {
                warn!(split = split_id, reason = %message, "split verification failed");
                self.gateway
                    .transition_split(
                        split_id,
                        SplitStatus::Verifying,
                        SplitStatus::FailVerify,
                        Some(&message),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(split = split_id, error = %e, "split verification errored");
                self.gateway
                    .transition_split(
                        split_id,
                        SplitStatus::Verifying,
                        SplitStatus::FailVerify,
                        Some(&e.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn check(&self, split_id: i64) -> Result<Verdict> {
        let store = self.gateway.store();
        let split = store
            .get_split(split_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("split {} not found", split_id)))?;
        let task = store
            .get_file_task(split.file_task_id)
            .await?
            .ok_or_else(|| {
                MigrateError::store(format!("file task {} not found", split.file_task_id))
            })?;
        let batch = store
            .get_batch(task.batch_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("batch {} not found", task.batch_id)))?;
        let job = store
            .get_job(batch.job_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("job {} not found", batch.job_id)))?;

        let target = self.targets.for_job(&job).await?;
        let target_count = target.count_split_rows(&batch.table, split_id).await?;
        if target_count != split.row_count {
            return Ok(Verdict::Fail(format!(
                "row count mismatch: target has {}, split recorded {}",
                target_count, split.row_count
            )));
        }

        if !self.config.content_check {
            return Ok(Verdict::Pass);
        }

        let ddl = DdlFile::load(&batch.ddl_path)?;
        let outcome = self
            .compare_content(&split, &batch.table, &ddl, target.as_ref())
            .await?;
        if outcome.is_match() {
            return Ok(Verdict::Pass);
        }

        let diff_path = self.write_diff_file(&split, &outcome).await?;
        Ok(Verdict::Fail(format!(
            "content mismatch: {} difference(s){}, see {}",
            outcome.diffs.len(),
            if outcome.truncated { " (truncated)" } else { "" },
            diff_path.display()
        )))
    }

    async fn compare_content(
        &self,
        split: &Split,
        table: &str,
        ddl: &DdlFile,
        target: &dyn TargetClient,
    ) -> Result<CompareOutcome> {
        let file_rows = read_split_rows(&split.path)?;
        let target_rows = target
            .fetch_split_rows(table, &ddl.column_names(), split.id)
            .await?;
        let comparator = RowComparator::new(
            ddl.columns.iter().map(|c| c.class()).collect(),
            ddl.column_names(),
            self.config.max_diffs,
        );
        Ok(comparator.compare(&file_rows, &target_rows))
    }

    async fn write_diff_file(&self, split: &Split, outcome: &CompareOutcome) -> Result<PathBuf> {
        let mut path = split.path.clone().into_os_string();
        path.push(".diff");
        let path = PathBuf::from(path);
        let mut file = tokio::fs::File::create(&path).await?;
        for diff in &outcome.diffs {
            file.write_all(diff.detail.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        if outcome.truncated {
            file.write_all(b"... comparison aborted at diff cap\n").await?;
        }
        file.flush().await?;
        Ok(path)
    }
}

/// Parse a split file into (source row, business values) pairs; the file's
/// trailing column is the source row number.
fn read_split_rows(path: &std::path::Path) -> Result<Vec<(i64, Vec<String>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<String> = record.iter().map(str::to_string).collect();
        let (source_field, business) = fields
            .split_last()
            .ok_or_else(|| MigrateError::Verify("empty split record".into()))?;
        let source_row: i64 = source_field
            .parse()
            .map_err(|_| MigrateError::Verify(format!("bad source row number: {}", source_field)))?;
        rows.push((source_row, business.to_vec()));
    }
    Ok(rows)
}
