//! Signal-file ingestion.
//!
//! A signal file is the handoff from the upstream extractor: a JSON
//! document naming the DDL descriptor and the source CSV files of one
//! delivery. Ingestion is idempotent on the signal file's absolute path,
//! so the external watcher may fire as often as it likes.

use crate::error::{MigrateError, Result};
use crate::model::Batch;
use crate::store::{MetaStore, NewBatch};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// On-disk signal file format.
#[derive(Debug, Deserialize)]
pub struct SignalFile {
    /// DDL descriptor path; its file stem names the target table.
    pub ddl: PathBuf,
    /// Legacy source CSV files, one FileTask each.
    pub csv: Vec<PathBuf>,
}

impl SignalFile {
    pub fn parse(content: &str) -> Result<Self> {
        let signal: SignalFile = serde_json::from_str(content)?;
        if signal.csv.is_empty() {
            return Err(MigrateError::Config(
                "signal file lists no csv sources".into(),
            ));
        }
        Ok(signal)
    }
}

/// Ingest one signal file for a job: create a Batch plus one FileTask per
/// source, atomically. Returns `None` when the signal path was already
/// ingested.
pub async fn ingest_signal_file(
    store: &Arc<dyn MetaStore>,
    job_id: i64,
    signal_path: &Path,
) -> Result<Option<Batch>> {
    let content = tokio::fs::read_to_string(signal_path).await?;
    let signal = SignalFile::parse(&content)?;

    // The idempotency key must be stable across watchers, so resolve to
    // the canonical absolute path
    let canonical = tokio::fs::canonicalize(signal_path).await?;
    let base = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let ddl_path = resolve(&base, &signal.ddl);
    let table = ddl_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrateError::Config(format!("bad ddl path: {}", ddl_path.display())))?
        .to_string();
    let sources: Vec<PathBuf> = signal.csv.iter().map(|p| resolve(&base, p)).collect();

    let created = store
        .create_batch(
            NewBatch {
                job_id,
                signal_path: canonical.display().to_string(),
                table: table.clone(),
                ddl_path,
            },
            sources,
        )
        .await?;

    match &created {
        Some(batch) => info!(
            batch = batch.id,
            table = %table,
            signal = %canonical.display(),
            "batch created"
        ),
        None => info!(signal = %canonical.display(), "signal already ingested, skipping"),
    }
    Ok(created)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetConn;
    use crate::store::{MemoryStore, NewJob};

    #[test]
    fn test_parse_signal_file() {
        let signal =
            SignalFile::parse(r#"{"ddl": "accounts.ddl", "csv": ["a.csv", "b.csv"]}"#).unwrap();
        assert_eq!(signal.ddl, PathBuf::from("accounts.ddl"));
        assert_eq!(signal.csv.len(), 2);
    }

    #[test]
    fn test_empty_csv_list_rejected() {
        assert!(SignalFile::parse(r#"{"ddl": "accounts.ddl", "csv": []}"#).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(SignalFile::parse("not json").is_err());
    }

    async fn store_with_job() -> (Arc<dyn MetaStore>, i64) {
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
        (store as Arc<dyn MetaStore>, job.id)
    }

    #[tokio::test]
    async fn test_ingest_creates_batch_and_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let signal_path = dir.path().join("delivery.json");
        std::fs::write(
            &signal_path,
            r#"{"ddl": "accounts.ddl", "csv": ["accounts_1.csv", "accounts_2.csv"]}"#,
        )
        .unwrap();

        let (store, job_id) = store_with_job().await;
        let batch = ingest_signal_file(&store, job_id, &signal_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.table, "accounts");
        assert!(batch.ddl_path.is_absolute());

        let tasks = store.file_tasks_for_batch(batch.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.source_path.is_absolute()));
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let signal_path = dir.path().join("delivery.json");
        std::fs::write(
            &signal_path,
            r#"{"ddl": "accounts.ddl", "csv": ["accounts_1.csv"]}"#,
        )
        .unwrap();

        let (store, job_id) = store_with_job().await;
        assert!(ingest_signal_file(&store, job_id, &signal_path)
            .await
            .unwrap()
            .is_some());
        assert!(ingest_signal_file(&store, job_id, &signal_path)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_absolute_paths_kept_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let signal_path = dir.path().join("delivery.json");
        std::fs::write(
            &signal_path,
            r#"{"ddl": "/data/ddl/accounts.ddl", "csv": ["/data/in/accounts_1.csv"]}"#,
        )
        .unwrap();

        let (store, job_id) = store_with_job().await;
        let batch = ingest_signal_file(&store, job_id, &signal_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.ddl_path, PathBuf::from("/data/ddl/accounts.ddl"));
        let tasks = store.file_tasks_for_batch(batch.id).await.unwrap();
        assert_eq!(tasks[0].source_path, PathBuf::from("/data/in/accounts_1.csv"));
    }
}
