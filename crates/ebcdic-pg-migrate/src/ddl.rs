//! Column-definition ("DDL") descriptor parsing.
//!
//! Descriptors are line-oriented text, one line per column; the first
//! comma-separated field is the column name, the second the declared type.
//! The type is unused during transcoding but drives load SQL generation and
//! type-aware verification equality.

use crate::error::{MigrateError, Result};
use std::path::Path;

/// Synthetic column tagging every loaded row with its originating split.
pub const SPLIT_ID_COLUMN: &str = "_split_id";

/// Synthetic column carrying the row's 1-based position in the source file.
pub const SOURCE_ROW_COLUMN: &str = "_source_row";

/// Equality class used by content verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Numeric,
    Timestamp,
    Text,
}

/// One declared column.
#[derive(Debug, Clone)]
pub struct DdlColumn {
    pub name: String,
    pub data_type: String,
}

impl DdlColumn {
    /// Classify the declared type for verification equality. Only the
    /// base type word is matched, so `point` and `interval` stay text and
    /// a precision suffix like `numeric(18,2)` is ignored.
    pub fn class(&self) -> ColumnClass {
        let ty = self.data_type.to_lowercase();
        let base = ty
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or("");
        match base {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "serial" | "bigserial"
            | "numeric" | "decimal" | "number" | "float" | "real" | "double" | "money" => {
                ColumnClass::Numeric
            }
            "date" | "datetime" | "datetime2" | "smalldatetime" => ColumnClass::Timestamp,
            _ if base.starts_with("timestamp") => ColumnClass::Timestamp,
            _ => ColumnClass::Text,
        }
    }
}

/// A parsed column-definition descriptor.
#[derive(Debug, Clone)]
pub struct DdlFile {
    /// Target table name, derived from the descriptor's file stem.
    pub table: String,
    pub columns: Vec<DdlColumn>,
}

impl DdlFile {
    /// Load and parse a descriptor file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let table = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MigrateError::Ddl(format!("bad descriptor path: {}", path.display())))?
            .to_string();
        Self::parse(&table, &content)
    }

    /// Parse descriptor content. Blank lines are skipped; a line without a
    /// column name is malformed.
    pub fn parse(table: &str, content: &str) -> Result<Self> {
        let mut columns = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, ',');
            let name = fields.next().unwrap_or("").trim();
            if name.is_empty() {
                return Err(MigrateError::Ddl(format!(
                    "line {}: missing column name",
                    idx + 1
                )));
            }
            let data_type = fields.next().unwrap_or("").trim().to_string();
            columns.push(DdlColumn {
                name: name.to_string(),
                data_type,
            });
        }
        if columns.is_empty() {
            return Err(MigrateError::Ddl("descriptor declares no columns".into()));
        }
        Ok(Self {
            table: table.to_string(),
            columns,
        })
    }

    /// Number of declared business columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Declared column names.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column list for the load SQL: declared columns plus the two
    /// synthetic tag columns.
    pub fn load_columns(&self) -> Vec<String> {
        let mut cols = self.column_names();
        cols.push(SOURCE_ROW_COLUMN.to_string());
        cols.push(SPLIT_ID_COLUMN.to_string());
        cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_descriptor() {
        let ddl = DdlFile::parse(
            "accounts",
            "acct_no,varchar(20)\nbalance,numeric(18,2)\nopened_at,timestamp\n",
        )
        .unwrap();
        assert_eq!(ddl.table, "accounts");
        assert_eq!(ddl.column_count(), 3);
        assert_eq!(ddl.columns[0].name, "acct_no");
        assert_eq!(ddl.columns[1].class(), ColumnClass::Numeric);
        assert_eq!(ddl.columns[2].class(), ColumnClass::Timestamp);
        assert_eq!(ddl.columns[0].class(), ColumnClass::Text);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let ddl = DdlFile::parse("t", "a,int\n\n\nb,text\n").unwrap();
        assert_eq!(ddl.column_count(), 2);
    }

    #[test]
    fn test_name_only_lines_allowed() {
        let ddl = DdlFile::parse("t", "a\nb\n").unwrap();
        assert_eq!(ddl.column_count(), 2);
        assert_eq!(ddl.columns[0].class(), ColumnClass::Text);
    }

    #[test]
    fn test_empty_descriptor_rejected() {
        assert!(DdlFile::parse("t", "\n\n").is_err());
    }

    #[test]
    fn test_load_columns_append_synthetics() {
        let ddl = DdlFile::parse("t", "a,int\nb,text\n").unwrap();
        assert_eq!(
            ddl.load_columns(),
            vec!["a", "b", SOURCE_ROW_COLUMN, SPLIT_ID_COLUMN]
        );
    }

    #[test]
    fn test_lookalike_type_names_stay_text() {
        let ddl = DdlFile::parse("t", "a,point\nb,interval\nc,validate_date\n").unwrap();
        assert!(ddl.columns.iter().all(|c| c.class() == ColumnClass::Text));
    }

    #[test]
    fn test_base_type_word_drives_class() {
        let ddl = DdlFile::parse(
            "t",
            "a,double precision\nb,bigint\nc,timestamptz\nd,date\n",
        )
        .unwrap();
        assert_eq!(ddl.columns[0].class(), ColumnClass::Numeric);
        assert_eq!(ddl.columns[1].class(), ColumnClass::Numeric);
        assert_eq!(ddl.columns[2].class(), ColumnClass::Timestamp);
        assert_eq!(ddl.columns[3].class(), ColumnClass::Timestamp);
    }

    #[test]
    fn test_extra_fields_ignored() {
        let ddl = DdlFile::parse("t", "a,int,not null,identity\n").unwrap();
        assert_eq!(ddl.columns[0].data_type, "int");
    }
}
