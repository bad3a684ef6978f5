//! Type-aware row comparison for content verification.
//!
//! Values are compared as text with per-class normalization: numerics
//! through `rust_decimal` (so `1.10` equals `1.1`), timestamps through
//! `chrono` truncated to microseconds (the target's precision), text
//! byte-for-byte. A NULL on the target side matches an empty source field,
//! mirroring the COPY csv convention.

use crate::ddl::ColumnClass;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use std::str::FromStr;

/// One recorded difference.
#[derive(Debug, Clone)]
pub struct DiffLine {
    pub source_row: i64,
    pub detail: String,
}

/// Comparison result: collected diffs, and whether the scan stopped early.
#[derive(Debug)]
pub struct CompareOutcome {
    pub diffs: Vec<DiffLine>,
    pub truncated: bool,
}

impl CompareOutcome {
    pub fn is_match(&self) -> bool {
        self.diffs.is_empty()
    }
}

pub struct RowComparator {
    classes: Vec<ColumnClass>,
    column_names: Vec<String>,
    max_diffs: usize,
}

impl RowComparator {
    pub fn new(classes: Vec<ColumnClass>, column_names: Vec<String>, max_diffs: usize) -> Self {
        Self {
            classes,
            column_names,
            max_diffs,
        }
    }

    /// Lockstep comparison of source and target rows, both ordered by
    /// source row number. Alignment problems (missing, extra or reordered
    /// rows) abort immediately; content differences accumulate up to the
    /// configured cap.
    pub fn compare(
        &self,
        file_rows: &[(i64, Vec<String>)],
        target_rows: &[(i64, Vec<Option<String>>)],
    ) -> CompareOutcome {
        let mut diffs = Vec::new();
        let mut truncated = false;

        let mut file_iter = file_rows.iter();
        let mut target_iter = target_rows.iter();
        loop {
            match (file_iter.next(), target_iter.next()) {
                (None, None) => break,
                (Some((row, _)), None) => {
                    diffs.push(DiffLine {
                        source_row: *row,
                        detail: format!("row {} missing from target", row),
                    });
                    break;
                }
                (None, Some((row, _))) => {
                    diffs.push(DiffLine {
                        source_row: *row,
                        detail: format!("target row {} has no source counterpart", row),
                    });
                    break;
                }
                (Some((file_row, file_values)), Some((target_row, target_values))) => {
                    if file_row != target_row {
                        diffs.push(DiffLine {
                            source_row: *file_row,
                            detail: format!(
                                "row alignment broken: source row {}, target row {}",
                                file_row, target_row
                            ),
                        });
                        break;
                    }
                    if file_values.len() != self.classes.len()
                        || target_values.len() != self.classes.len()
                    {
                        diffs.push(DiffLine {
                            source_row: *file_row,
                            detail: format!(
                                "column count mismatch at row {}: source {}, target {}",
                                file_row,
                                file_values.len(),
                                target_values.len()
                            ),
                        });
                        break;
                    }
                    for (idx, class) in self.classes.iter().enumerate() {
                        let file_value = &file_values[idx];
                        let target_value = target_values[idx].as_deref();
                        if !cells_equal(*class, file_value, target_value) {
                            diffs.push(DiffLine {
                                source_row: *file_row,
                                detail: format!(
                                    "row {} column {}: source {:?}, target {:?}",
                                    file_row, self.column_names[idx], file_value, target_value
                                ),
                            });
                            if diffs.len() >= self.max_diffs {
                                truncated = true;
                                break;
                            }
                        }
                    }
                    if truncated {
                        break;
                    }
                }
            }
        }

        CompareOutcome { diffs, truncated }
    }
}

/// Per-cell equality under a column class. Target NULL matches an empty
/// source field.
pub fn cells_equal(class: ColumnClass, file_value: &str, target_value: Option<&str>) -> bool {
    let target = target_value.unwrap_or("");
    if file_value == target {
        return true;
    }
    match class {
        ColumnClass::Numeric => match (Decimal::from_str(file_value), Decimal::from_str(target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        ColumnClass::Timestamp => match (parse_timestamp(file_value), parse_timestamp(target)) {
            (Some(a), Some(b)) => truncate_to_micros(a) == truncate_to_micros(b),
            _ => false,
        },
        ColumnClass::Text => false,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

fn truncate_to_micros(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_nanosecond(dt.nanosecond() / 1_000 * 1_000)
        .unwrap_or(dt)
}
