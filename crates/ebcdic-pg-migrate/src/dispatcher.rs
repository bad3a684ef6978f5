//! Polling dispatcher: the pipeline's only scheduler.
//!
//! Each cycle fans waiting work out to per-stage bounded worker pools and
//! then runs the rollups. The cycle itself never waits on task
//! completion; a stage with no free permits simply skips until the next
//! tick. Lock contention is skipped silently, it means another worker on
//! this node already has the task.

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::load::LoadEngine;
use crate::lock::{LockKind, TaskLock};
use crate::model::{FileTaskStatus, SplitStatus};
use crate::status::StatusGateway;
use crate::transcode::TranscodeEngine;
use crate::verify::VerifyEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Dispatcher {
    gateway: Arc<StatusGateway>,
    lock: Arc<TaskLock>,
    transcode: Arc<TranscodeEngine>,
    load: Arc<LoadEngine>,
    verify: Arc<VerifyEngine>,
    interval: Duration,
    transcode_permits: Arc<Semaphore>,
    load_permits: Arc<Semaphore>,
    verify_permits: Arc<Semaphore>,
    transcode_slots: u32,
    load_slots: u32,
    verify_slots: u32,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<StatusGateway>,
        transcode: Arc<TranscodeEngine>,
        load: Arc<LoadEngine>,
        verify: Arc<VerifyEngine>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            gateway,
            lock: Arc::new(TaskLock::new()),
            transcode,
            load,
            verify,
            interval: Duration::from_secs(config.interval_secs),
            transcode_permits: Arc::new(Semaphore::new(config.transcode_workers)),
            load_permits: Arc::new(Semaphore::new(config.load_workers)),
            verify_permits: Arc::new(Semaphore::new(config.verify_workers)),
            transcode_slots: config.transcode_workers as u32,
            load_slots: config.load_workers as u32,
            verify_slots: config.verify_workers as u32,
        }
    }

    /// Recover, then poll until cancelled. Returns only after every
    /// spawned worker has finished, so callers may tear down shared
    /// resources once this completes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.gateway.recover().await?;
        info!(node = self.gateway.node(), "dispatcher started");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("dispatcher stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!(error = %e, "dispatch cycle failed");
                    }
                }
            }
        }
        self.drain().await;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Wait for all in-flight workers by acquiring every permit of every
    /// stage. Workers hold their permit until their status write lands,
    /// so an interrupted COPY never outlives the dispatcher.
    async fn drain(&self) {
        for (sem, slots) in [
            (&self.transcode_permits, self.transcode_slots),
            (&self.load_permits, self.load_slots),
            (&self.verify_permits, self.verify_slots),
        ] {
            if let Ok(all) = sem.acquire_many(slots).await {
                drop(all);
            }
        }
    }

    /// One dispatch cycle. Public so tests can drive the pipeline
    /// deterministically.
    pub async fn cycle(&self) -> Result<()> {
        let store = self.gateway.store();

        for task in store.file_tasks_in_status(FileTaskStatus::New).await? {
            let permit = match self.transcode_permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            if !self.lock.try_acquire(LockKind::FileTask, task.id) {
                continue;
            }
            let engine = self.transcode.clone();
            let lock = self.lock.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run_task(task.id).await {
                    error!(task = task.id, error = %e.format_detailed(), "transcode worker failed");
                }
                lock.release(LockKind::FileTask, task.id);
                drop(permit);
            });
        }

        for split in store.splits_in_status(SplitStatus::WaitLoad).await? {
            let permit = match self.load_permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            if !self.lock.try_acquire(LockKind::Split, split.id) {
                continue;
            }
            let engine = self.load.clone();
            let lock = self.lock.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run_split(split.id).await {
                    error!(split = split.id, error = %e.format_detailed(), "load worker failed");
                }
                lock.release(LockKind::Split, split.id);
                drop(permit);
            });
        }

        for split in store.splits_in_status(SplitStatus::WaitVerify).await? {
            let permit = match self.verify_permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            if !self.lock.try_acquire(LockKind::Split, split.id) {
                continue;
            }
            let engine = self.verify.clone();
            let lock = self.lock.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run_split(split.id).await {
                    error!(split = split.id, error = %e.format_detailed(), "verify worker failed");
                }
                lock.release(LockKind::Split, split.id);
                drop(permit);
            });
        }

        for task in store
            .file_tasks_in_status(FileTaskStatus::ProcessingSplits)
            .await?
        {
            self.gateway.rollup_file_task(task.id).await?;
        }
        let closed = self.gateway.rollup_batches().await?;
        if closed > 0 {
            debug!(closed, "batches rolled up");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TranscodeConfig, VerifyConfig};
    use crate::model::{BatchStatus, TargetConn};
    use crate::store::{MemoryStore, MetaStore, NewBatch, NewJob};
    use crate::target::{MemoryTarget, MemoryTargetFactory, TargetClient, TargetFactory};

    async fn drive_until<F>(dispatcher: &Dispatcher, mut done: F)
    where
        F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
    {
        for _ in 0..50 {
            dispatcher.cycle().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if done().await {
                return;
            }
        }
        panic!("pipeline did not settle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_pipeline_through_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let ddl_path = dir.path().join("accounts.ddl");
        std::fs::write(&ddl_path, "name,text\nvalue,int\n").unwrap();
        let source_path = dir.path().join("accounts_1.csv");
        std::fs::write(&source_path, b"a,1\nb,2\nc,3\n").unwrap();

        let store = Arc::new(MemoryStore::new());
        let job = store
            .insert_job(NewJob {
                name: "j".into(),
                watch_dir: dir.path().to_path_buf(),
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
                    table: "accounts".into(),
                    ddl_path,
                },
                vec![source_path],
            )
            .await
            .unwrap()
            .unwrap();

        let gateway = Arc::new(StatusGateway::new(
            store.clone() as Arc<dyn MetaStore>,
            "n1".into(),
        ));
        let target = Arc::new(MemoryTarget::new());
        let targets: Arc<dyn TargetFactory> = Arc::new(MemoryTargetFactory::new(target.clone()));

        let dispatcher = Dispatcher::new(
            gateway.clone(),
            Arc::new(
                TranscodeEngine::new(
                    gateway.clone(),
                    TranscodeConfig {
                        charset: "GBK".into(),
                        tunneling: true,
                        rows_per_split: 2,
                        work_dir: dir.path().join("work"),
                    },
                )
                .unwrap(),
            ),
            Arc::new(LoadEngine::new(gateway.clone(), targets.clone())),
            Arc::new(VerifyEngine::new(
                gateway.clone(),
                targets.clone(),
                VerifyConfig {
                    content_check: true,
                    max_diffs: 10,
                },
            )),
            &DispatcherConfig::default(),
        );

        let store_done = store.clone();
        let batch_id = batch.id;
        drive_until(&dispatcher, move || {
            let store = store_done.clone();
            Box::pin(async move {
                store
                    .get_batch(batch_id)
                    .await
                    .unwrap()
                    .map(|b| b.status == BatchStatus::Finished)
                    .unwrap_or(false)
            })
        })
        .await;

        let task = &store.file_tasks_for_batch(batch.id).await.unwrap()[0];
        assert_eq!(task.status, crate::model::FileTaskStatus::Finished);
        let splits = store.splits_for_task(task.id).await.unwrap();
        assert_eq!(splits.len(), 2);
        assert!(splits.iter().all(|s| s.status == SplitStatus::Pass));
        assert_eq!(target.count_table_rows("accounts").await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_waits_for_in_flight_workers_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(StatusGateway::new(
            store as Arc<dyn MetaStore>,
            "n1".into(),
        ));
        let target = Arc::new(MemoryTarget::new());
        let targets: Arc<dyn TargetFactory> = Arc::new(MemoryTargetFactory::new(target));

        let dispatcher = Arc::new(Dispatcher::new(
            gateway.clone(),
            Arc::new(
                TranscodeEngine::new(
                    gateway.clone(),
                    TranscodeConfig {
                        charset: "GBK".into(),
                        tunneling: true,
                        rows_per_split: 2,
                        work_dir: dir.path().join("work"),
                    },
                )
                .unwrap(),
            ),
            Arc::new(LoadEngine::new(gateway.clone(), targets.clone())),
            Arc::new(VerifyEngine::new(
                gateway,
                targets,
                VerifyConfig {
                    content_check: false,
                    max_diffs: 10,
                },
            )),
            &DispatcherConfig::default(),
        ));

        // Stand in for a load worker that is still mid-flight at shutdown
        let held = dispatcher.load_permits.clone().try_acquire_owned().unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let runner = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_finished(), "run returned with a worker permit still held");

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
