//! PostgreSQL target client: COPY-based bulk load and verification queries.

use super::{quote_ident, TargetClient, TargetRow};
use crate::ddl::{SOURCE_ROW_COLUMN, SPLIT_ID_COLUMN};
use crate::error::{MigrateError, Result};
use crate::model::TargetConn;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::SinkExt;
use std::path::Path;
use tokio_postgres::NoTls;

const COPY_CHUNK_ROWS: usize = 10_000;

/// Pooled client against one job's target database.
pub struct PgTarget {
    pool: Pool,
    schema: String,
}

impl PgTarget {
    pub fn new(conn: &TargetConn) -> Result<Self> {
        let pg_config: tokio_postgres::Config = conn
            .connection_string()
            .parse()
            .map_err(|e| MigrateError::Config(format!("target connection: {}", e)))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(conn.max_connections)
            .build()
            .map_err(|e| MigrateError::Config(format!("target pool: {}", e)))?;
        Ok(Self {
            pool,
            schema: conn.schema.clone(),
        })
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

#[async_trait]
impl TargetClient for PgTarget {
    async fn ping(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn load_split(
        &self,
        table: &str,
        columns: &[String],
        split_id: i64,
        split_path: &Path,
    ) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = $1",
                self.qualified(table),
                quote_ident(SPLIT_ID_COLUMN)
            ),
            &[&split_id],
        )
        .await?;

        let col_list: String = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let copy_stmt = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
            self.qualified(table),
            col_list
        );
        let sink = tx.copy_in(&copy_stmt).await?;
        futures::pin_mut!(sink);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(false)
            .from_path(split_path)?;
        let split_id_field = split_id.to_string();

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        let mut pending = 0usize;
        for record in reader.records() {
            let record = record?;
            let mut writer = csv::Writer::from_writer(Vec::new());
            let mut out = csv::StringRecord::new();
            for field in record.iter() {
                out.push_field(field);
            }
            out.push_field(&split_id_field);
            writer.write_record(&out)?;
            let line = writer
                .into_inner()
                .map_err(|e| MigrateError::load(split_id, format!("CSV encode: {}", e)))?;
            buf.put_slice(&line);
            pending += 1;

            if pending == COPY_CHUNK_ROWS {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| MigrateError::load(split_id, format!("COPY send: {}", e)))?;
                pending = 0;
            }
        }
        if !buf.is_empty() {
            sink.send(buf.split().freeze())
                .await
                .map_err(|e| MigrateError::load(split_id, format!("COPY send: {}", e)))?;
        }

        let copied = sink.finish().await?;
        tx.commit().await?;
        Ok(copied)
    }

    async fn count_split_rows(&self, table: &str, split_id: i64) -> Result<i64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = $1",
                    self.qualified(table),
                    quote_ident(SPLIT_ID_COLUMN)
                ),
                &[&split_id],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn count_table_rows(&self, table: &str) -> Result<i64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(&format!("SELECT COUNT(*) FROM {}", self.qualified(table)), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn fetch_split_rows(
        &self,
        table: &str,
        columns: &[String],
        split_id: i64,
    ) -> Result<Vec<TargetRow>> {
        let conn = self.pool.get().await?;
        let col_list: String = columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = conn
            .query(
                &format!(
                    "SELECT {}, {} FROM {} WHERE {} = $1 ORDER BY {}",
                    quote_ident(SOURCE_ROW_COLUMN),
                    col_list,
                    self.qualified(table),
                    quote_ident(SPLIT_ID_COLUMN),
                    quote_ident(SOURCE_ROW_COLUMN)
                ),
                &[&split_id],
            )
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source_row: i64 = row.get(0);
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Option<String>>(i + 1));
            }
            out.push((source_row, values));
        }
        Ok(out)
    }
}
