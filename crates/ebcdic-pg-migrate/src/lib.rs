//! # ebcdic-pg-migrate
//!
//! Migration pipeline for very large legacy-encoded CSV extracts into
//! PostgreSQL:
//!
//! - **Transcode** legacy charsets (EBCDIC-family / legacy multibyte) to
//!   UTF-8 in one streaming pass, with escape-tunneling for characters the
//!   legacy charset cannot carry
//! - **Split** output into bounded chunks, each an independently loadable
//!   unit of work
//! - **Bulk load** via PostgreSQL COPY, idempotent per split
//! - **Verify** row counts (and optionally content) per split, plus
//!   job-level total reconciliation
//!
//! All progress lives in a metadata store as status-tagged records; a
//! polling dispatcher moves them through their state machines, so a crashed
//! run resumes where it left off.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ebcdic_pg_migrate::{Config, Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ebcdic_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pipeline = Pipeline::new(config)?;
//!     pipeline.run(CancellationToken::new()).await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod ddl;
pub mod dispatcher;
pub mod error;
pub mod load;
pub mod lock;
pub mod model;
pub mod signal;
pub mod status;
pub mod store;
pub mod target;
pub mod transcode;
pub mod verify;

mod pipeline;

// Re-exports for convenient access
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{MigrateError, Result};
pub use load::LoadEngine;
pub use model::{Batch, BatchStatus, FileTask, FileTaskStatus, Job, JobState, Split, SplitStatus};
pub use pipeline::{HealthCheck, Pipeline};
pub use signal::{ingest_signal_file, SignalFile};
pub use status::StatusGateway;
pub use store::{MemoryStore, MetaStore, PgMetaStore};
pub use target::{MemoryTarget, PgTarget, TargetClient, TargetFactory};
pub use transcode::TranscodeEngine;
pub use verify::{verify_job, TableReport, TableStatus, VerifyEngine};
