//! The blocking streaming pass over one legacy source file.
//!
//! Runs on a blocking thread; talks to the async side through an event
//! channel (split closed, progress) and a watch flag for cooperative stop.
//! Decode is lenient: malformed bytes become the sentinel and are caught
//! by stability validation, never by a decoder error.

use crate::codec::{escape_for_check, unescape, LegacyCharset, SENTINEL};
use crate::error::{MigrateError, Result};
use crate::model::NewSplit;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use encoding_rs_io::DecodeReaderBytesBuilder;
use serde_json::json;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const PROGRESS_EVERY_ROWS: i64 = 10_000;

/// Event sent to the async side during the pass.
#[derive(Debug)]
pub(crate) enum PassEvent {
    /// A split file closed; persist its record.
    SplitClosed(NewSplit),
    /// Periodic progress and counter snapshot.
    Progress {
        percent: i16,
        total_rows: i64,
        error_rows: i64,
    },
}

/// Result of a completed (or stopped) pass.
#[derive(Debug)]
pub(crate) struct PassOutcome {
    pub total_rows: i64,
    pub error_rows: i64,
    pub splits: usize,
    pub stopped: bool,
}

/// Everything the pass needs, owned, so it can move to a blocking thread.
pub(crate) struct TranscodePass {
    pub task_id: i64,
    pub source_path: PathBuf,
    pub work_dir: PathBuf,
    pub charset: LegacyCharset,
    pub tunneling: bool,
    pub rows_per_split: i64,
    pub column_count: usize,
}

/// Wraps the raw file so progress can be derived from the byte position
/// before decoding inflates it.
struct CountingReader<R> {
    inner: R,
    read: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Lazily created per-task error file with the fixed header.
struct ErrorSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl ErrorSink {
    fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn append(
        &mut self,
        line_no: i64,
        error_type: &str,
        legacy_approx: &[u8],
        utf8_row: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        if self.writer.is_none() {
            let mut writer = csv::Writer::from_path(&self.path)?;
            writer.write_record([
                "LineNo",
                "ErrorType",
                "Row_Base64_Legacy_Approx",
                "Row_Base64_UTF8",
                "Column_Details_JSON",
            ])?;
            self.writer = Some(writer);
        }
        let writer = self.writer.as_mut().unwrap();
        writer.write_record([
            line_no.to_string().as_str(),
            error_type,
            &BASE64.encode(legacy_approx),
            &BASE64.encode(utf8_row),
            &details.to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

/// The open split file, if any.
struct SplitSink {
    work_dir: PathBuf,
    task_id: i64,
    index: usize,
    writer: Option<csv::Writer<File>>,
    path: PathBuf,
    start_row: i64,
    rows: i64,
}

impl SplitSink {
    fn new(work_dir: PathBuf, task_id: i64) -> Self {
        Self {
            work_dir,
            task_id,
            index: 0,
            writer: None,
            path: PathBuf::new(),
            start_row: 0,
            rows: 0,
        }
    }

    fn append(&mut self, fields: &[String], source_row: i64) -> Result<()> {
        if self.writer.is_none() {
            self.index += 1;
            self.path = self
                .work_dir
                .join(format!("task_{}_split_{}.csv", self.task_id, self.index));
            self.writer = Some(csv::Writer::from_path(&self.path)?);
            self.start_row = source_row;
            self.rows = 0;
        }
        let writer = self.writer.as_mut().unwrap();
        let mut record = csv::StringRecord::new();
        for field in fields {
            record.push_field(field);
        }
        record.push_field(&source_row.to_string());
        writer.write_record(&record)?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close the open split, returning its record. `None` when
    /// no rows were written since the last close.
    fn close(&mut self) -> Result<Option<NewSplit>> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => return Ok(None),
        };
        writer
            .into_inner()
            .map_err(|e| MigrateError::transcode(self.task_id, format!("split flush: {}", e)))?
            .sync_all()?;
        Ok(Some(NewSplit {
            file_task_id: self.task_id,
            path: self.path.clone(),
            start_row: self.start_row,
            row_count: self.rows,
        }))
    }
}

/// A row rejected by validation.
struct RowError {
    error_type: &'static str,
    details: serde_json::Value,
}

impl TranscodePass {
    pub fn run(
        self,
        events: mpsc::Sender<PassEvent>,
        stop: watch::Receiver<bool>,
    ) -> Result<PassOutcome> {
        let file_size = std::fs::metadata(&self.source_path)?.len().max(1);
        let bytes_read = Arc::new(AtomicU64::new(0));

        let file = File::open(&self.source_path)?;
        let counting = CountingReader {
            inner: file,
            read: bytes_read.clone(),
        };
        let decoder = DecodeReaderBytesBuilder::new()
            .encoding(Some(self.charset.encoding()))
            .build(counting);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(decoder);

        let mut errors = ErrorSink::new(
            self.work_dir
                .join(format!("task_{}.err.csv", self.task_id)),
        );
        let mut split = SplitSink::new(self.work_dir.clone(), self.task_id);

        let mut total_rows = 0i64;
        let mut error_rows = 0i64;
        let mut splits = 0usize;
        let mut stopped = false;

        for record in reader.records() {
            if *stop.borrow() {
                stopped = true;
                break;
            }
            let record = record?;
            total_rows += 1;
            let line_no = total_rows;

            let (fields, row_error) = self.validate_row(&record);
            if let Some(err) = row_error {
                let utf8_row = serialize_record(self.task_id, &record)?;
                errors.append(
                    line_no,
                    err.error_type,
                    &self.charset.encode_lossy(&utf8_row),
                    &utf8_row,
                    &err.details,
                )?;
                error_rows += 1;
                if line_no == 1 {
                    // A broken first data row means the file itself is
                    // suspect (wrong charset, wrong descriptor)
                    return Err(MigrateError::transcode(
                        self.task_id,
                        format!("first data row failed validation: {}", err.error_type),
                    ));
                }
                continue;
            }

            split.append(&fields, line_no)?;
            if split.rows >= self.rows_per_split {
                if let Some(new_split) = split.close()? {
                    splits += 1;
                    events
                        .blocking_send(PassEvent::SplitClosed(new_split))
                        .map_err(|_| MigrateError::Cancelled)?;
                }
            }

            if total_rows % PROGRESS_EVERY_ROWS == 0 {
                let percent =
                    ((bytes_read.load(Ordering::Relaxed) * 100 / file_size) as i16).min(99);
                events
                    .blocking_send(PassEvent::Progress {
                        percent,
                        total_rows,
                        error_rows,
                    })
                    .map_err(|_| MigrateError::Cancelled)?;
            }
        }

        if !stopped {
            if let Some(new_split) = split.close()? {
                splits += 1;
                events
                    .blocking_send(PassEvent::SplitClosed(new_split))
                    .map_err(|_| MigrateError::Cancelled)?;
            }
        }

        Ok(PassOutcome {
            total_rows,
            error_rows,
            splits,
            stopped,
        })
    }

    /// Validate one parsed row. Returns the output fields (escapes
    /// resolved) and the first validation failure, if any.
    fn validate_row(&self, record: &csv::StringRecord) -> (Vec<String>, Option<RowError>) {
        if record.len() != self.column_count {
            return (
                Vec::new(),
                Some(RowError {
                    error_type: "COLUMN_COUNT_MISMATCH",
                    details: json!({
                        "expected": self.column_count,
                        "actual": record.len(),
                    }),
                }),
            );
        }

        let mut fields = Vec::with_capacity(record.len());
        let mut bad_columns = Vec::new();
        for (idx, cell) in record.iter().enumerate() {
            let resolved = if self.tunneling {
                unescape(cell).0.into_owned()
            } else {
                cell.to_string()
            };
            if !self.cell_is_stable(cell, &resolved) {
                bad_columns.push(json!({ "column": idx, "value": cell }));
            }
            fields.push(resolved);
        }

        if bad_columns.is_empty() {
            (fields, None)
        } else {
            (
                fields,
                Some(RowError {
                    error_type: "STABILITY_MISMATCH",
                    details: serde_json::Value::Array(bad_columns),
                }),
            )
        }
    }

    /// Whether a decoded cell survives the round trip back to its legacy
    /// form. A sentinel anywhere marks decode damage. ASCII cells without
    /// a backslash cannot have been damaged and skip the check.
    fn cell_is_stable(&self, original: &str, resolved: &str) -> bool {
        if original.is_ascii() && !original.contains('\\') {
            return true;
        }
        if original.contains(SENTINEL) {
            return false;
        }
        if self.tunneling {
            escape_for_check(resolved, &self.charset) == original
        } else {
            self.charset.can_encode(original)
        }
    }
}

/// Re-serialize a parsed record to one CSV line without the trailing
/// newline, for the error-file payloads.
fn serialize_record(task_id: i64, record: &csv::StringRecord) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(record)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| MigrateError::transcode(task_id, format!("CSV encode: {}", e)))?;
    let mut line = String::from_utf8(bytes)
        .map_err(|e| MigrateError::transcode(task_id, format!("CSV encode: {}", e)))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
