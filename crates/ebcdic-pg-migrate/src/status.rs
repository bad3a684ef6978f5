//! Status gateway: the single funnel for every status change.
//!
//! Engines never call the store's update methods directly. The gateway
//! loads a fresh record, applies the job-state gate, checks the legal
//! transition table and then issues the conditional store write. A `false`
//! result means someone else moved the record first; callers treat it as
//! "not mine" and move on.

use crate::error::{MigrateError, Result};
use crate::model::{Batch, BatchStatus, FileTask, FileTaskStatus, Job, Split, SplitStatus};
use crate::store::MetaStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a rollup check over one file task's splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    /// Some splits are still in flight; nothing to do.
    Pending,
    /// All splits terminal; task advanced to the given status.
    Advanced(FileTaskStatus),
}

pub struct StatusGateway {
    store: Arc<dyn MetaStore>,
    node: String,
}

impl StatusGateway {
    pub fn new(store: Arc<dyn MetaStore>, node: String) -> Self {
        Self { store, node }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    /// Whether a file-task transition begins new work (and therefore must
    /// respect the job gate). Finishing or failing in-flight work is always
    /// allowed so a paused job can drain cleanly.
    fn file_task_starts_work(from: FileTaskStatus, to: FileTaskStatus) -> bool {
        matches!((from, to), (FileTaskStatus::New, FileTaskStatus::Transcoding))
    }

    fn split_starts_work(from: SplitStatus, to: SplitStatus) -> bool {
        matches!(
            (from, to),
            (SplitStatus::WaitLoad, SplitStatus::Loading)
                | (SplitStatus::WaitVerify, SplitStatus::Verifying)
        )
    }

    async fn job_for_batch(&self, batch_id: i64) -> Result<(Batch, Job)> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("batch {} not found", batch_id)))?;
        let job = self
            .store
            .get_job(batch.job_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("job {} not found", batch.job_id)))?;
        Ok((batch, job))
    }

    async fn job_for_task(&self, task: &FileTask) -> Result<Job> {
        let (_, job) = self.job_for_batch(task.batch_id).await?;
        Ok(job)
    }

    async fn job_for_split(&self, split: &Split) -> Result<(FileTask, Job)> {
        let task = self
            .store
            .get_file_task(split.file_task_id)
            .await?
            .ok_or_else(|| {
                MigrateError::store(format!("file task {} not found", split.file_task_id))
            })?;
        let job = self.job_for_task(&task).await?;
        Ok((task, job))
    }

    /// Attempt a file-task transition. Returns false when the transition is
    /// gated, illegal against the fresh status, or lost to a racing node.
    pub async fn transition_file_task(
        &self,
        id: i64,
        from: FileTaskStatus,
        to: FileTaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let task = match self.store.get_file_task(id).await? {
            Some(task) => task,
            None => return Ok(false),
        };
        if task.status != from {
            debug!(task = id, current = task.status.as_str(), expected = from.as_str(),
                "stale file task status, skipping");
            return Ok(false);
        }
        if Self::file_task_starts_work(from, to) {
            let job = self.job_for_task(&task).await?;
            if !job.state.is_active() {
                debug!(task = id, job = job.id, state = job.state.as_str(),
                    "job gate closed, not starting work");
                return Ok(false);
            }
        }
        if !from.can_transition_to(to) {
            warn!(task = id, from = from.as_str(), to = to.as_str(),
                "illegal file task transition refused");
            return Ok(false);
        }
        let won = self
            .store
            .update_file_task_status(id, from, to, error, &self.node)
            .await?;
        if won {
            info!(task = id, from = from.as_str(), to = to.as_str(), "file task transition");
        }
        Ok(won)
    }

    /// Attempt a split transition, with the same gate and race semantics as
    /// [`transition_file_task`](Self::transition_file_task).
    pub async fn transition_split(
        &self,
        id: i64,
        from: SplitStatus,
        to: SplitStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let split = match self.store.get_split(id).await? {
            Some(split) => split,
            None => return Ok(false),
        };
        if split.status != from {
            debug!(split = id, current = split.status.as_str(), expected = from.as_str(),
                "stale split status, skipping");
            return Ok(false);
        }
        if Self::split_starts_work(from, to) {
            let (_, job) = self.job_for_split(&split).await?;
            if !job.state.is_active() {
                debug!(split = id, job = job.id, state = job.state.as_str(),
                    "job gate closed, not starting work");
                return Ok(false);
            }
        }
        if !from.can_transition_to(to) {
            warn!(split = id, from = from.as_str(), to = to.as_str(),
                "illegal split transition refused");
            return Ok(false);
        }
        let won = self
            .store
            .update_split_status(id, from, to, error, &self.node)
            .await?;
        if won {
            debug!(split = id, from = from.as_str(), to = to.as_str(), "split transition");
        }
        Ok(won)
    }

    /// Roll a parked file task forward once all of its splits are terminal.
    ///
    /// The verdict is over split statuses only: clean when every split
    /// passed. Rows diverted to the error file are reported through the
    /// error counters and the error file, not the task status.
    pub async fn rollup_file_task(&self, task_id: i64) -> Result<RollupOutcome> {
        let task = self
            .store
            .get_file_task(task_id)
            .await?
            .ok_or_else(|| MigrateError::store(format!("file task {} not found", task_id)))?;
        if task.status != FileTaskStatus::ProcessingSplits {
            return Ok(RollupOutcome::Pending);
        }
        let splits = self.store.splits_for_task(task_id).await?;
        if splits.iter().any(|s| s.status.is_in_flight()) {
            return Ok(RollupOutcome::Pending);
        }
        let clean = splits.iter().all(|s| s.status == SplitStatus::Pass);
        let to = if clean {
            FileTaskStatus::Finished
        } else {
            FileTaskStatus::FinishedWithError
        };
        if self
            .transition_file_task(task_id, FileTaskStatus::ProcessingSplits, to, None)
            .await?
        {
            Ok(RollupOutcome::Advanced(to))
        } else {
            Ok(RollupOutcome::Pending)
        }
    }

    /// Finish every processing batch whose file tasks are all complete.
    /// Returns the number of batches closed.
    pub async fn rollup_batches(&self) -> Result<u64> {
        let mut closed = 0u64;
        for batch in self.store.batches_in_status(BatchStatus::Processing).await? {
            let tasks = self.store.file_tasks_for_batch(batch.id).await?;
            if tasks.is_empty() {
                continue;
            }
            if self.store.count_file_tasks_not_complete(batch.id).await? > 0 {
                continue;
            }
            if self
                .store
                .update_batch_status(batch.id, BatchStatus::Processing, BatchStatus::Finished)
                .await?
            {
                info!(batch = batch.id, table = %batch.table, "batch finished");
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Crash recovery: reset every in-flight status this node owns back to
    /// its waiting status. Runs once before dispatch starts.
    pub async fn recover(&self) -> Result<u64> {
        let reset = self.store.reset_in_flight(&self.node).await?;
        if reset > 0 {
            info!(node = %self.node, reset, "reset in-flight tasks from previous run");
        }
        Ok(reset)
    }

    /// Manual retry of a failed transcode. The next dispatch cycle picks
    /// the task up again.
    pub async fn retry_file_task(&self, id: i64) -> Result<bool> {
        self.transition_file_task(id, FileTaskStatus::FailTranscode, FileTaskStatus::New, None)
            .await
    }

    /// Manual retry of a failed split, from either failure status.
    pub async fn retry_split(&self, id: i64) -> Result<bool> {
        let split = match self.store.get_split(id).await? {
            Some(split) => split,
            None => return Ok(false),
        };
        match split.status {
            SplitStatus::FailLoad => {
                self.transition_split(id, SplitStatus::FailLoad, SplitStatus::WaitLoad, None)
                    .await
            }
            SplitStatus::FailVerify => {
                self.transition_split(id, SplitStatus::FailVerify, SplitStatus::WaitVerify, None)
                    .await
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobState, NewSplit, TargetConn};
    use crate::store::{MemoryStore, NewBatch, NewJob};

    async fn setup() -> (Arc<MemoryStore>, StatusGateway, i64, i64) {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .insert_job(NewJob {
                name: "j".into(),
                watch_dir: "/in".into(),
                target: TargetConn {
                    host: "localhost".into(),
                    port: 5432,
                    database: "d".into(),
                    user: "u".into(),
                    password: "p".into(),
                    schema: "public".into(),
                    max_connections: 2,
                },
            })
            .await
            .unwrap();
        let batch = store
            .create_batch(
                NewBatch {
                    job_id: job.id,
                    signal_path: "/sig".into(),
                    table: "t".into(),
                    ddl_path: "/d".into(),
                },
                vec!["/a.csv".into()],
            )
            .await
            .unwrap()
            .unwrap();
        let task_id = store.file_tasks_for_batch(batch.id).await.unwrap()[0].id;
        let gateway = StatusGateway::new(store.clone() as Arc<dyn MetaStore>, "n1".into());
        (store, gateway, job.id, task_id)
    }

    #[tokio::test]
    async fn test_gate_blocks_new_work_when_paused() {
        let (store, gateway, job_id, task_id) = setup().await;
        store.set_job_state(job_id, JobState::Paused).await.unwrap();
        let won = gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap();
        assert!(!won);
        assert_eq!(
            store.get_file_task(task_id).await.unwrap().unwrap().status,
            FileTaskStatus::New
        );
    }

    #[tokio::test]
    async fn test_gate_allows_finishing_when_paused() {
        let (store, gateway, job_id, task_id) = setup().await;
        assert!(gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap());
        store.set_job_state(job_id, JobState::Paused).await.unwrap();
        // In-flight work may still complete
        assert!(gateway
            .transition_file_task(
                task_id,
                FileTaskStatus::Transcoding,
                FileTaskStatus::ProcessingSplits,
                None
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_illegal_transition_refused() {
        let (_, gateway, _, task_id) = setup().await;
        let won = gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Finished, None)
            .await
            .unwrap();
        assert!(!won);
    }

    #[tokio::test]
    async fn test_stale_from_loses() {
        let (_, gateway, _, task_id) = setup().await;
        assert!(gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap());
        assert!(!gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap());
    }

    async fn park_with_splits(
        store: &Arc<MemoryStore>,
        gateway: &StatusGateway,
        task_id: i64,
        statuses: &[SplitStatus],
    ) -> Vec<i64> {
        gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap();
        let mut ids = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let split = store
                .insert_split(NewSplit {
                    file_task_id: task_id,
                    path: format!("/s{i}.csv").into(),
                    start_row: (i as i64) * 10 + 1,
                    row_count: 10,
                })
                .await
                .unwrap();
            // Walk each split to the requested status through legal edges
            if *status != SplitStatus::WaitLoad {
                store
                    .update_split_status(split.id, SplitStatus::WaitLoad, SplitStatus::Loading, None, "n1")
                    .await
                    .unwrap();
            }
            match status {
                SplitStatus::WaitLoad | SplitStatus::Loading => {}
                SplitStatus::FailLoad => {
                    store
                        .update_split_status(split.id, SplitStatus::Loading, SplitStatus::FailLoad, None, "n1")
                        .await
                        .unwrap();
                }
                other => {
                    store
                        .update_split_status(split.id, SplitStatus::Loading, SplitStatus::WaitVerify, None, "n1")
                        .await
                        .unwrap();
                    if *other != SplitStatus::WaitVerify {
                        store
                            .update_split_status(split.id, SplitStatus::WaitVerify, SplitStatus::Verifying, None, "n1")
                            .await
                            .unwrap();
                    }
                    match other {
                        SplitStatus::Pass => {
                            store
                                .update_split_status(split.id, SplitStatus::Verifying, SplitStatus::Pass, None, "n1")
                                .await
                                .unwrap();
                        }
                        SplitStatus::FailVerify => {
                            store
                                .update_split_status(split.id, SplitStatus::Verifying, SplitStatus::FailVerify, None, "n1")
                                .await
                                .unwrap();
                        }
                        _ => {}
                    }
                }
            }
            ids.push(split.id);
        }
        gateway
            .transition_file_task(
                task_id,
                FileTaskStatus::Transcoding,
                FileTaskStatus::ProcessingSplits,
                None,
            )
            .await
            .unwrap();
        ids
    }

    #[tokio::test]
    async fn test_rollup_pending_while_split_in_flight() {
        let (store, gateway, _, task_id) = setup().await;
        park_with_splits(&store, &gateway, task_id, &[SplitStatus::Pass, SplitStatus::WaitLoad])
            .await;
        assert_eq!(
            gateway.rollup_file_task(task_id).await.unwrap(),
            RollupOutcome::Pending
        );
    }

    #[tokio::test]
    async fn test_rollup_finishes_clean() {
        let (store, gateway, _, task_id) = setup().await;
        park_with_splits(&store, &gateway, task_id, &[SplitStatus::Pass, SplitStatus::Pass]).await;
        assert_eq!(
            gateway.rollup_file_task(task_id).await.unwrap(),
            RollupOutcome::Advanced(FileTaskStatus::Finished)
        );
    }

    #[tokio::test]
    async fn test_rollup_finishes_with_error_on_failed_split() {
        let (store, gateway, _, task_id) = setup().await;
        park_with_splits(&store, &gateway, task_id, &[SplitStatus::Pass, SplitStatus::FailLoad])
            .await;
        assert_eq!(
            gateway.rollup_file_task(task_id).await.unwrap(),
            RollupOutcome::Advanced(FileTaskStatus::FinishedWithError)
        );
    }

    #[tokio::test]
    async fn test_rollup_verdict_ignores_error_row_counters() {
        let (store, gateway, _, task_id) = setup().await;
        park_with_splits(&store, &gateway, task_id, &[SplitStatus::Pass]).await;
        // Diverted rows show up in the counters, not the task status
        store.set_file_task_counts(task_id, 10, 2).await.unwrap();
        assert_eq!(
            gateway.rollup_file_task(task_id).await.unwrap(),
            RollupOutcome::Advanced(FileTaskStatus::Finished)
        );
    }

    #[tokio::test]
    async fn test_batch_rollup_waits_for_fail_transcode() {
        let (store, gateway, _, task_id) = setup().await;
        gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap();
        gateway
            .transition_file_task(
                task_id,
                FileTaskStatus::Transcoding,
                FileTaskStatus::FailTranscode,
                Some("boom"),
            )
            .await
            .unwrap();
        // FailTranscode is retriable, so the batch stays open
        assert_eq!(gateway.rollup_batches().await.unwrap(), 0);

        assert!(gateway.retry_file_task(task_id).await.unwrap());
        gateway
            .transition_file_task(task_id, FileTaskStatus::New, FileTaskStatus::Transcoding, None)
            .await
            .unwrap();
        gateway
            .transition_file_task(
                task_id,
                FileTaskStatus::Transcoding,
                FileTaskStatus::Finished,
                None,
            )
            .await
            .unwrap();
        assert_eq!(gateway.rollup_batches().await.unwrap(), 1);
        let batches = store.batches_in_status(BatchStatus::Finished).await.unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_split_from_both_failure_states() {
        let (store, gateway, _, task_id) = setup().await;
        let ids = park_with_splits(
            &store,
            &gateway,
            task_id,
            &[SplitStatus::FailLoad, SplitStatus::FailVerify],
        )
        .await;
        assert!(gateway.retry_split(ids[0]).await.unwrap());
        assert!(gateway.retry_split(ids[1]).await.unwrap());
        assert_eq!(
            store.get_split(ids[0]).await.unwrap().unwrap().status,
            SplitStatus::WaitLoad
        );
        assert_eq!(
            store.get_split(ids[1]).await.unwrap().unwrap().status,
            SplitStatus::WaitVerify
        );
    }
}
