//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity (for crash recovery and task ownership).
    #[serde(default)]
    pub node: NodeConfig,

    /// Metadata store (PostgreSQL) configuration.
    pub store: StoreConfig,

    /// Dispatch loop configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Transcode engine configuration.
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Verification configuration.
    #[serde(default)]
    pub verify: VerifyConfig,
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node id. Defaults to a random id per process start; set this
    /// explicitly in multi-node deployments so recovery can find its own
    /// in-flight tasks after a restart.
    #[serde(default = "default_node_id")]
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

/// Metadata store (PostgreSQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,
    pub user: String,
    pub password: String,

    /// Schema holding the pipeline's own tables.
    #[serde(default = "default_store_schema")]
    pub schema: String,

    #[serde(default = "default_store_connections")]
    pub max_connections: usize,
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Poll interval in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Concurrent transcode workers.
    #[serde(default = "default_transcode_workers")]
    pub transcode_workers: usize,

    /// Concurrent load workers. Bound this well below the target
    /// database's connection ceiling across all active jobs.
    #[serde(default = "default_load_workers")]
    pub load_workers: usize,

    /// Concurrent verify workers.
    #[serde(default = "default_verify_workers")]
    pub verify_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            transcode_workers: default_transcode_workers(),
            load_workers: default_load_workers(),
            verify_workers: default_verify_workers(),
        }
    }
}

/// Transcode engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Legacy charset label (anything encoding_rs resolves, e.g. "GBK",
    /// "gb18030", "Big5", "windows-1252").
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Whether escape-tunneled characters are expected in the source.
    #[serde(default = "default_true")]
    pub tunneling: bool,

    /// Rows per split file.
    #[serde(default = "default_rows_per_split")]
    pub rows_per_split: i64,

    /// Directory receiving split files and error files.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            charset: default_charset(),
            tunneling: true,
            rows_per_split: default_rows_per_split(),
            work_dir: default_work_dir(),
        }
    }
}

/// Verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Compare cell content as well as row counts.
    #[serde(default)]
    pub content_check: bool,

    /// Stop writing the diff file and abort the comparison after this
    /// many differences.
    #[serde(default = "default_max_diffs")]
    pub max_diffs: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            content_check: false,
            max_diffs: default_max_diffs(),
        }
    }
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}

fn default_pg_port() -> u16 {
    5432
}

fn default_store_schema() -> String {
    "_ebcdic_pg_migrate".to_string()
}

fn default_store_connections() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    2
}

fn default_transcode_workers() -> usize {
    2
}

fn default_load_workers() -> usize {
    4
}

fn default_verify_workers() -> usize {
    4
}

fn default_charset() -> String {
    "GBK".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rows_per_split() -> i64 {
    500_000
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_max_diffs() -> usize {
    100
}
