//! Transcode engine: legacy source file → UTF-8 split files.
//!
//! The engine claims a task, runs the blocking streaming pass on a
//! dedicated thread and handles its events on the async side: split
//! records are persisted as the pass closes files, progress and counters
//! are written back periodically, and a watch flag carries the
//! cooperative stop signal when the owning job leaves Active.

mod pass;

pub(crate) use pass::{PassEvent, PassOutcome, TranscodePass};

use crate::codec::LegacyCharset;
use crate::config::TranscodeConfig;
use crate::ddl::DdlFile;
use crate::error::{MigrateError, Result};
use crate::model::{FileTask, FileTaskStatus};
use crate::status::StatusGateway;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_DEPTH: usize = 64;

pub struct TranscodeEngine {
    gateway: Arc<StatusGateway>,
    config: TranscodeConfig,
    charset: LegacyCharset,
}

impl TranscodeEngine {
    pub fn new(gateway: Arc<StatusGateway>, config: TranscodeConfig) -> Result<Self> {
        let charset = LegacyCharset::new(&config.charset)?;
        Ok(Self {
            gateway,
            config,
            charset,
        })
    }

    /// Claim and transcode one file task. A lost claim is not an error;
    /// the task simply belongs to someone else.
    pub async fn run_task(&self, task_id: i64) -> Result<()> {
        if !self
            .gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await?
        {
            return Ok(());
        }

        let store = self.gateway.store();
        let task = store
            .get_file_task(task_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("file task {} not found", task_id)))?;
        let batch = store
            .get_batch(task.batch_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("batch {} not found", task.batch_id)))?;

        // A retry re-runs the whole file; anything from the prior attempt
        // is stale
        self.discard_splits(task_id).await?;

        info!(
            task = task_id,
            source = %task.source_path.display(),
            table = %batch.table,
            charset = self.charset.name(),
            "transcoding"
        );

        let ddl = match DdlFile::load(&batch.ddl_path) {
            Ok(ddl) => ddl,
            Err(e) => {
                self.fail_task(task_id, &format!("descriptor: {}", e)).await?;
                return Ok(());
            }
        };

        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        match self.run_pass(&task, ddl.column_count()).await {
            Ok(outcome) if outcome.stopped => {
                info!(task = task_id, rows = outcome.total_rows, "transcode stopped by job gate");
                self.discard_splits(task_id).await?;
                self.gateway
                    .transition_file_task(
                        task_id,
                        FileTaskStatus::Transcoding,
                        FileTaskStatus::New,
                        None,
                    )
                    .await?;
            }
            Ok(outcome) => {
                store
                    .set_file_task_counts(task_id, outcome.total_rows, outcome.error_rows)
                    .await?;
                store.set_file_task_progress(task_id, 100).await?;
                let to = if outcome.splits > 0 {
                    FileTaskStatus::ProcessingSplits
                } else if outcome.error_rows > 0 {
                    FileTaskStatus::FinishedWithError
                } else {
                    FileTaskStatus::Finished
                };
                self.gateway
                    .transition_file_task(task_id, FileTaskStatus::Transcoding, to, None)
                    .await?;
                info!(
                    task = task_id,
                    rows = outcome.total_rows,
                    errors = outcome.error_rows,
                    splits = outcome.splits,
                    "transcode complete"
                );
            }
            Err(e) => {
                warn!(task = task_id, error = %e, "transcode failed");
                // Nothing from a failed attempt may reach the loader
                self.discard_splits(task_id).await?;
                self.fail_task(task_id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn run_pass(&self, task: &FileTask, column_count: usize) -> Result<PassOutcome> {
        let store = self.gateway.store().clone();
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);

        let pass = TranscodePass {
            task_id: task.id,
            source_path: task.source_path.clone(),
            work_dir: self.config.work_dir.clone(),
            charset: self.charset,
            tunneling: self.config.tunneling,
            rows_per_split: self.config.rows_per_split,
            column_count,
        };
        let handle = tokio::task::spawn_blocking(move || pass.run(event_tx, stop_rx));

        let batch_id = task.batch_id;
        let task_id = task.id;
        let mut poll = tokio::time::interval(JOB_POLL_INTERVAL);
        poll.tick().await; // immediate first tick

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(PassEvent::SplitClosed(new_split)) => {
                        let split = store.insert_split(new_split).await?;
                        info!(task = task_id, split = split.id, rows = split.row_count,
                            "split ready");
                    }
                    Some(PassEvent::Progress { percent, total_rows, error_rows }) => {
                        store.set_file_task_progress(task_id, percent).await?;
                        store.set_file_task_counts(task_id, total_rows, error_rows).await?;
                    }
                    // Sender dropped: the pass is done
                    None => break,
                },
                _ = poll.tick() => {
                    if let Some(batch) = store.get_batch(batch_id).await? {
                        if let Some(job) = store.get_job(batch.job_id).await? {
                            if !job.state.is_active() {
                                let _ = stop_tx.send(true);
                            }
                        }
                    }
                }
            }
        }

        handle
            .await
            .map_err(|e| MigrateError::transcode(task_id, format!("pass panicked: {}", e)))?
    }

    /// Remove split records and their files from a prior attempt.
    async fn discard_splits(&self, task_id: i64) -> Result<()> {
        let removed = self.gateway.store().delete_splits_for_task(task_id).await?;
        for split in removed {
            remove_file_best_effort(&split.path).await;
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: i64, message: &str) -> Result<()> {
        self.gateway
            .transition_file_task(
                task_id,
                FileTaskStatus::Transcoding,
                FileTaskStatus::FailTranscode,
                Some(message),
            )
            .await?;
        Ok(())
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove split file");
        }
    }
}
