//! In-memory metadata store for tests and single-process runs.

use super::{MetaStore, NewBatch, NewJob};
use crate::error::Result;
use crate::model::{
    Batch, BatchStatus, FileTask, FileTaskStatus, Job, JobState, NewSplit, Split, SplitStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<i64, Job>,
    batches: HashMap<i64, Batch>,
    file_tasks: HashMap<i64, FileTask>,
    splits: HashMap<i64, Split>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mutex-guarded map store. All operations are atomic under one lock,
/// which trivially satisfies the conditional-update contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let id = inner.next_id();
        let job = Job {
            id,
            name: job.name,
            watch_dir: job.watch_dir,
            target: job.target,
            state: JobState::Active,
        };
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn set_job_state(&self, id: i64, state: JobState) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.jobs.get_mut(&id) {
            Some(job) => {
                job.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_batch(&self, batch: NewBatch, sources: Vec<PathBuf>) -> Result<Option<Batch>> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner
            .batches
            .values()
            .any(|b| b.signal_path == batch.signal_path)
        {
            return Ok(None);
        }
        let id = inner.next_id();
        let record = Batch {
            id,
            job_id: batch.job_id,
            signal_path: batch.signal_path,
            table: batch.table,
            ddl_path: batch.ddl_path,
            status: BatchStatus::Processing,
            created_at: Utc::now(),
        };
        inner.batches.insert(id, record.clone());
        for source_path in sources {
            let task_id = inner.next_id();
            inner.file_tasks.insert(
                task_id,
                FileTask {
                    id: task_id,
                    batch_id: id,
                    source_path,
                    status: FileTaskStatus::New,
                    progress: 0,
                    error: None,
                    total_rows: 0,
                    error_rows: 0,
                    node: None,
                },
            );
        }
        Ok(Some(record))
    }

    async fn get_batch(&self, id: i64) -> Result<Option<Batch>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.batches.get(&id).cloned())
    }

    async fn batches_in_status(&self, status: BatchStatus) -> Result<Vec<Batch>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut batches: Vec<_> = inner
            .batches
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.id);
        Ok(batches)
    }

    async fn batches_for_job(&self, job_id: i64) -> Result<Vec<Batch>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut batches: Vec<_> = inner
            .batches
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.id);
        Ok(batches)
    }

    async fn update_batch_status(
        &self,
        id: i64,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.batches.get_mut(&id) {
            Some(batch) if batch.status == from => {
                batch.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_file_task(&self, id: i64) -> Result<Option<FileTask>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.file_tasks.get(&id).cloned())
    }

    async fn file_tasks_in_status(&self, status: FileTaskStatus) -> Result<Vec<FileTask>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut tasks: Vec<_> = inner
            .file_tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn file_tasks_for_batch(&self, batch_id: i64) -> Result<Vec<FileTask>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut tasks: Vec<_> = inner
            .file_tasks
            .values()
            .filter(|t| t.batch_id == batch_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn count_file_tasks_not_complete(&self, batch_id: i64) -> Result<i64> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .file_tasks
            .values()
            .filter(|t| t.batch_id == batch_id && !t.status.is_rollup_complete())
            .count() as i64)
    }

    async fn update_file_task_status(
        &self,
        id: i64,
        from: FileTaskStatus,
        to: FileTaskStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.file_tasks.get_mut(&id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.node = Some(node.to_string());
                if let Some(error) = error {
                    task.error = Some(error.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_file_task_progress(&self, id: i64, progress: i16) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(task) = inner.file_tasks.get_mut(&id) {
            task.progress = progress.clamp(0, 100);
        }
        Ok(())
    }

    async fn set_file_task_counts(&self, id: i64, total_rows: i64, error_rows: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(task) = inner.file_tasks.get_mut(&id) {
            task.total_rows = total_rows;
            task.error_rows = error_rows;
        }
        Ok(())
    }

    async fn insert_split(&self, split: NewSplit) -> Result<Split> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let id = inner.next_id();
        let record = Split {
            id,
            file_task_id: split.file_task_id,
            path: split.path,
            start_row: split.start_row,
            row_count: split.row_count,
            status: SplitStatus::WaitLoad,
            error: None,
            node: None,
        };
        inner.splits.insert(id, record.clone());
        Ok(record)
    }

    async fn get_split(&self, id: i64) -> Result<Option<Split>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.splits.get(&id).cloned())
    }

    async fn splits_in_status(&self, status: SplitStatus) -> Result<Vec<Split>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut splits: Vec<_> = inner
            .splits
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        splits.sort_by_key(|s| s.id);
        Ok(splits)
    }

    async fn splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut splits: Vec<_> = inner
            .splits
            .values()
            .filter(|s| s.file_task_id == file_task_id)
            .cloned()
            .collect();
        splits.sort_by_key(|s| s.start_row);
        Ok(splits)
    }

    async fn update_split_status(
        &self,
        id: i64,
        from: SplitStatus,
        to: SplitStatus,
        error: Option<&str>,
        node: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.splits.get_mut(&id) {
            Some(split) if split.status == from => {
                split.status = to;
                split.node = Some(node.to_string());
                if let Some(error) = error {
                    split.error = Some(error.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_splits_for_task(&self, file_task_id: i64) -> Result<Vec<Split>> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let ids: Vec<i64> = inner
            .splits
            .values()
            .filter(|s| s.file_task_id == file_task_id)
            .map(|s| s.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(split) = inner.splits.remove(&id) {
                removed.push(split);
            }
        }
        removed.sort_by_key(|s| s.start_row);
        Ok(removed)
    }

    async fn reset_in_flight(&self, node: &str) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut reset = 0u64;
        for task in inner.file_tasks.values_mut() {
            if task.status == FileTaskStatus::Transcoding
                && task.node.as_deref().map(|n| n == node).unwrap_or(true)
            {
                task.status = FileTaskStatus::New;
                reset += 1;
            }
        }
        for split in inner.splits.values_mut() {
            let owned = split.node.as_deref().map(|n| n == node).unwrap_or(true);
            if !owned {
                continue;
            }
            match split.status {
                SplitStatus::Loading => {
                    split.status = SplitStatus::WaitLoad;
                    reset += 1;
                }
                SplitStatus::Verifying => {
                    split.status = SplitStatus::WaitVerify;
                    reset += 1;
                }
                _ => {}
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetConn;

    fn target() -> TargetConn {
        TargetConn {
            host: "localhost".into(),
            port: 5432,
            database: "t".into(),
            user: "u".into(),
            password: "p".into(),
            schema: "public".into(),
            max_connections: 2,
        }
    }

    fn new_job() -> NewJob {
        NewJob {
            name: "job".into(),
            watch_dir: "/in".into(),
            target: target(),
        }
    }

    #[tokio::test]
    async fn test_batch_creation_is_idempotent_on_signal_path() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
        let batch = NewBatch {
            job_id: job.id,
            signal_path: "/in/sig.json".into(),
            table: "accounts".into(),
            ddl_path: "/in/accounts.ddl".into(),
        };
        let first = store
            .create_batch(batch.clone(), vec!["/in/a.csv".into(), "/in/b.csv".into()])
            .await
            .unwrap();
        assert!(first.is_some());
        let tasks = store
            .file_tasks_for_batch(first.as_ref().unwrap().id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == FileTaskStatus::New));

        let second = store
            .create_batch(batch, vec!["/in/a.csv".into()])
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(
            store.file_tasks_in_status(FileTaskStatus::New).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_conditional_update_loses_on_stale_status() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
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
        let task = &store.file_tasks_for_batch(batch.id).await.unwrap()[0];

        let won = store
            .update_file_task_status(
                task.id,
                FileTaskStatus::New,
                FileTaskStatus::Transcoding,
                None,
                "n1",
            )
            .await
            .unwrap();
        assert!(won);

        // Second racer sees a stale `from` and loses
        let lost = store
            .update_file_task_status(
                task.id,
                FileTaskStatus::New,
                FileTaskStatus::Transcoding,
                None,
                "n2",
            )
            .await
            .unwrap();
        assert!(!lost);

        let task = store.get_file_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, FileTaskStatus::Transcoding);
        assert_eq!(task.node.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_reset_in_flight_recovers_transients() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
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
        let task = &store.file_tasks_for_batch(batch.id).await.unwrap()[0];
        store
            .update_file_task_status(
                task.id,
                FileTaskStatus::New,
                FileTaskStatus::Transcoding,
                None,
                "n1",
            )
            .await
            .unwrap();
        let split = store
            .insert_split(NewSplit {
                file_task_id: task.id,
                path: "/s1.csv".into(),
                start_row: 1,
                row_count: 10,
            })
            .await
            .unwrap();
        store
            .update_split_status(split.id, SplitStatus::WaitLoad, SplitStatus::Loading, None, "n1")
            .await
            .unwrap();

        let reset = store.reset_in_flight("n1").await.unwrap();
        assert_eq!(reset, 2);
        assert_eq!(
            store.get_file_task(task.id).await.unwrap().unwrap().status,
            FileTaskStatus::New
        );
        assert_eq!(
            store.get_split(split.id).await.unwrap().unwrap().status,
            SplitStatus::WaitLoad
        );
    }

    #[tokio::test]
    async fn test_reset_in_flight_skips_other_nodes() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job()).await.unwrap();
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
        let task = &store.file_tasks_for_batch(batch.id).await.unwrap()[0];
        store
            .update_file_task_status(
                task.id,
                FileTaskStatus::New,
                FileTaskStatus::Transcoding,
                None,
                "other-node",
            )
            .await
            .unwrap();

        assert_eq!(store.reset_in_flight("this-node").await.unwrap(), 0);
        assert_eq!(
            store.get_file_task(task.id).await.unwrap().unwrap().status,
            FileTaskStatus::Transcoding
        );
    }

    #[tokio::test]
    async fn test_delete_splits_for_task() {
        let store = MemoryStore::new();
        for start in [1, 11] {
            store
                .insert_split(NewSplit {
                    file_task_id: 5,
                    path: format!("/s{start}.csv").into(),
                    start_row: start,
                    row_count: 10,
                })
                .await
                .unwrap();
        }
        let removed = store.delete_splits_for_task(5).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].start_row, 1);
        assert!(store.splits_for_task(5).await.unwrap().is_empty());
    }
}
