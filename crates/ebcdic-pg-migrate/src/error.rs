//! Error types for the migration pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metadata store error
    #[error("Store error: {0}")]
    Store(String),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool exhausted or unavailable
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Unknown or unsupported legacy charset label
    #[error("Charset error: {0}")]
    Charset(String),

    /// Malformed column-definition descriptor
    #[error("DDL descriptor error: {0}")]
    Ddl(String),

    /// Transcoding failed for a specific file task
    #[error("Transcode failed for task {task}: {message}")]
    Transcode { task: i64, message: String },

    /// Bulk load failed for a specific split
    #[error("Load failed for split {split}: {message}")]
    Load { split: i64, message: String },

    /// Verification infrastructure failure (mismatches are data, not errors)
    #[error("Verification error: {0}")]
    Verify(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parse or write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Shutdown requested while work was in flight
    #[error("Cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Store error.
    pub fn store(message: impl Into<String>) -> Self {
        MigrateError::Store(message.into())
    }

    /// Create a Transcode error for a task.
    pub fn transcode(task: i64, message: impl Into<String>) -> Self {
        MigrateError::Transcode {
            task,
            message: message.into(),
        }
    }

    /// Create a Load error for a split.
    pub fn load(split: i64, message: impl Into<String>) -> Self {
        MigrateError::Load {
            split,
            message: message.into(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) => 2,
            MigrateError::Store(_) | MigrateError::Pool(_) => 3,
            MigrateError::Target(_) => 4,
            MigrateError::Verify(_) => 5,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
