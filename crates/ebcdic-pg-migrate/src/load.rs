//! Load engine: one split file → target table, transactionally.
//!
//! Delete-then-COPY inside a single transaction makes a reload of the same
//! split idempotent: either the old tagged rows are fully replaced or
//! nothing changes.

use crate::ddl::DdlFile;
use crate::error::{MigrateError, Result};
use crate::model::SplitStatus;
use crate::status::StatusGateway;
use crate::target::TargetFactory;
use std::sync::Arc;
use tracing::{info, warn};

pub struct LoadEngine {
    gateway: Arc<StatusGateway>,
    targets: Arc<dyn TargetFactory>,
}

impl LoadEngine {
    pub fn new(gateway: Arc<StatusGateway>, targets: Arc<dyn TargetFactory>) -> Self {
        Self { gateway, targets }
    }

    /// Claim and load one split. A lost claim is not an error.
    pub async fn run_split(&self, split_id: i64) -> Result<()> {
        if !self
            .gateway
            .transition_split(split_id, SplitStatus::WaitLoad, SplitStatus::Loading, None)
            .await?
        {
            return Ok(());
        }

        match self.load(split_id).await {
            Ok(loaded) => {
                info!(split = split_id, rows = loaded, "split loaded");
                self.gateway
                    .transition_split(split_id, SplitStatus::Loading, SplitStatus::WaitVerify, None)
                    .await?;
            }
            Err(e) => {
                warn!(split = split_id, error = %e, "split load failed");
                self.gateway
                    .transition_split(
                        split_id,
                        SplitStatus::Loading,
                        SplitStatus::FailLoad,
                        Some(&e.to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn load(&self, split_id: i64) -> Result<u64> {
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

        let ddl = DdlFile::load(&batch.ddl_path)?;
        let target = self.targets.for_job(&job).await?;
        target
            .load_split(&batch.table, &ddl.load_columns(), split_id, &split.path)
            .await
    }
}
