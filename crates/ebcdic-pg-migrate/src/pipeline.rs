//! Composition root: wires store, gateway, engines and dispatcher from
//! configuration.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::load::LoadEngine;
use crate::status::StatusGateway;
use crate::store::{MetaStore, PgMetaStore};
use crate::target::{PgTargetFactory, TargetFactory};
use crate::transcode::TranscodeEngine;
use crate::verify::VerifyEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One component's health probe result.
#[derive(Debug)]
pub struct HealthCheck {
    pub component: String,
    pub ok: bool,
    pub detail: Option<String>,
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn MetaStore>,
    gateway: Arc<StatusGateway>,
    targets: Arc<dyn TargetFactory>,
}

impl Pipeline {
    /// Build the production pipeline: PostgreSQL store, per-job target
    /// pools.
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn MetaStore> = Arc::new(PgMetaStore::new(&config.store)?);
        let targets: Arc<dyn TargetFactory> = Arc::new(PgTargetFactory::new());
        Self::with_parts(config, store, targets)
    }

    /// Build a pipeline over explicit store and target implementations
    /// (in-memory variants in tests and single-process runs).
    pub fn with_parts(
        config: Config,
        store: Arc<dyn MetaStore>,
        targets: Arc<dyn TargetFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let gateway = Arc::new(StatusGateway::new(store.clone(), config.node.id.clone()));
        Ok(Self {
            config,
            store,
            gateway,
            targets,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<StatusGateway> {
        &self.gateway
    }

    pub fn targets(&self) -> &Arc<dyn TargetFactory> {
        &self.targets
    }

    /// Create the metadata schema. Idempotent.
    pub async fn init_store(&self) -> Result<()> {
        self.store.init_schema().await?;
        info!(store = self.store.store_type(), "metadata schema ready");
        Ok(())
    }

    /// Probe store and per-job target connectivity.
    pub async fn health_check(&self) -> Vec<HealthCheck> {
        let mut checks = Vec::new();
        let jobs = match self.store.list_jobs().await {
            Ok(jobs) => {
                checks.push(HealthCheck {
                    component: format!("store ({})", self.store.store_type()),
                    ok: true,
                    detail: None,
                });
                jobs
            }
            Err(e) => {
                checks.push(HealthCheck {
                    component: format!("store ({})", self.store.store_type()),
                    ok: false,
                    detail: Some(e.to_string()),
                });
                return checks;
            }
        };

        for job in jobs {
            let component = format!("job {} target ({})", job.name, job.target.host);
            let result = match self.targets.for_job(&job).await {
                Ok(target) => target.ping().await,
                Err(e) => Err(e),
            };
            checks.push(match result {
                Ok(()) => HealthCheck {
                    component,
                    ok: true,
                    detail: None,
                },
                Err(e) => HealthCheck {
                    component,
                    ok: false,
                    detail: Some(e.to_string()),
                },
            });
        }
        checks
    }

    /// Run the dispatcher until cancelled, then tear down the target
    /// pools.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let dispatcher = Dispatcher::new(
            self.gateway.clone(),
            Arc::new(TranscodeEngine::new(
                self.gateway.clone(),
                self.config.transcode.clone(),
            )?),
            Arc::new(LoadEngine::new(self.gateway.clone(), self.targets.clone())),
            Arc::new(VerifyEngine::new(
                self.gateway.clone(),
                self.targets.clone(),
                self.config.verify.clone(),
            )),
            &self.config.dispatcher,
        );
        let result = dispatcher.run(shutdown).await;
        self.targets.close_all().await;
        result
    }
}
