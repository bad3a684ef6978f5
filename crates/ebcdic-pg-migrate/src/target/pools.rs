//! Per-job target client cache.
//!
//! Pools live for the process lifetime; `close_all` is the shutdown
//! teardown. Sized by each job's own connection limit.

use super::{MemoryTarget, PgTarget, TargetClient};
use crate::error::Result;
use crate::model::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Hands out a target client for a job.
#[async_trait]
pub trait TargetFactory: Send + Sync {
    async fn for_job(&self, job: &Job) -> Result<Arc<dyn TargetClient>>;

    /// Close every cached pool. Called once at shutdown.
    async fn close_all(&self);
}

/// Caches one `PgTarget` (one pool) per job id.
#[derive(Default)]
pub struct PgTargetFactory {
    clients: Mutex<HashMap<i64, Arc<PgTarget>>>,
}

impl PgTargetFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a job's cached pool, closing it.
    pub fn remove(&self, job_id: i64) {
        let removed = self
            .clients
            .lock()
            .expect("factory lock poisoned")
            .remove(&job_id);
        if let Some(client) = removed {
            client.close();
        }
    }
}

#[async_trait]
impl TargetFactory for PgTargetFactory {
    async fn for_job(&self, job: &Job) -> Result<Arc<dyn TargetClient>> {
        let mut clients = self.clients.lock().expect("factory lock poisoned");
        if let Some(client) = clients.get(&job.id) {
            return Ok(client.clone());
        }
        debug!(job = job.id, host = %job.target.host, "creating target pool");
        let client = Arc::new(PgTarget::new(&job.target)?);
        clients.insert(job.id, client.clone());
        Ok(client)
    }

    async fn close_all(&self) {
        let mut clients = self.clients.lock().expect("factory lock poisoned");
        for (_, client) in clients.drain() {
            client.close();
        }
    }
}

/// Returns the same shared [`MemoryTarget`] for every job.
pub struct MemoryTargetFactory {
    target: Arc<MemoryTarget>,
}

impl MemoryTargetFactory {
    pub fn new(target: Arc<MemoryTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl TargetFactory for MemoryTargetFactory {
    async fn for_job(&self, _job: &Job) -> Result<Arc<dyn TargetClient>> {
        Ok(self.target.clone())
    }

    async fn close_all(&self) {}
}
