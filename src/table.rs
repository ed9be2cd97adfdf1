//! In-memory tables keyed by a timestamp (or by row position) with declared column types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Join key shared by monitoring, soil and yield-history tables.
pub const PARCEL_ID_COLUMN: &str = "parcelle_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Text,
}

/// Declared column of a source schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

impl ColumnSpec {
    pub const fn required(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Numeric(_) => ColumnKind::Numeric,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, rows: &[Option<usize>]) -> Self {
        match self {
            Self::Numeric(values) => {
                Self::Numeric(rows.iter().map(|row| row.and_then(|r| values[r])).collect())
            }
            Self::Text(values) => Self::Text(
                rows.iter()
                    .map(|row| row.and_then(|r| values[r].clone()))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIndex {
    /// Row position only; used by static reference tables.
    Positional(usize),
    /// Millisecond UTC timestamps; `None` marks a row whose timestamp is unusable.
    Temporal(Vec<Option<i64>>),
}

impl RowIndex {
    pub fn len(&self) -> usize {
        match self {
            Self::Positional(len) => *len,
            Self::Temporal(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, rows: &[Option<usize>]) -> Self {
        match self {
            Self::Positional(_) => Self::Positional(rows.len()),
            Self::Temporal(ts) => {
                Self::Temporal(rows.iter().map(|row| row.and_then(|r| ts[r])).collect())
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("column {column} in table {table} has {found} rows, expected {expected}")]
    LengthMismatch {
        table: String,
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column {column} in table {table}")]
    DuplicateColumn { table: String, column: String },
    #[error("table {table} is missing column {column}")]
    MissingColumn { table: String, column: String },
    #[error("column {column} in table {table} is {found:?}, expected {expected:?}")]
    KindMismatch {
        table: String,
        column: String,
        expected: ColumnKind,
        found: ColumnKind,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    index: RowIndex,
    columns: Vec<Column>,
}

impl Table {
    pub fn temporal(name: impl Into<String>, timestamps: Vec<Option<i64>>) -> Self {
        Self {
            name: name.into(),
            index: RowIndex::Temporal(timestamps),
            columns: Vec::new(),
        }
    }

    pub fn positional(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            index: RowIndex::Positional(len),
            columns: Vec::new(),
        }
    }

    pub fn with_numeric(
        mut self,
        name: impl Into<String>,
        values: Vec<Option<f64>>,
    ) -> Result<Self, TableError> {
        self.push_column(Column {
            name: name.into(),
            data: ColumnData::Numeric(values),
        })?;
        Ok(self)
    }

    pub fn with_text<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        values: Vec<Option<S>>,
    ) -> Result<Self, TableError> {
        self.push_column(Column {
            name: name.into(),
            data: ColumnData::Text(values.into_iter().map(|v| v.map(Into::into)).collect()),
        })?;
        Ok(self)
    }

    pub fn push_column(&mut self, column: Column) -> Result<(), TableError> {
        if column.data.len() != self.len() {
            return Err(TableError::LengthMismatch {
                table: self.name.clone(),
                column: column.name,
                expected: self.len(),
                found: column.data.len(),
            });
        }
        if self.has_column(&column.name) {
            return Err(TableError::DuplicateColumn {
                table: self.name.clone(),
                column: column.name,
            });
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &RowIndex {
        &self.index
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn numeric(&self, name: &str) -> Result<&[Option<f64>], TableError> {
        match &self.require(name)?.data {
            ColumnData::Numeric(values) => Ok(values),
            ColumnData::Text(_) => Err(self.kind_mismatch(name, ColumnKind::Numeric)),
        }
    }

    pub fn text(&self, name: &str) -> Result<&[Option<String>], TableError> {
        match &self.require(name)?.data {
            ColumnData::Text(values) => Ok(values),
            ColumnData::Numeric(_) => Err(self.kind_mismatch(name, ColumnKind::Text)),
        }
    }

    pub fn numeric_column_names(&self) -> Vec<String> {
        self.column_names_of(ColumnKind::Numeric)
    }

    pub fn text_column_names(&self) -> Vec<String> {
        self.column_names_of(ColumnKind::Text)
    }

    /// New table holding `rows` in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Table {
        let rows: Vec<Option<usize>> = rows.iter().copied().map(Some).collect();
        self.gather(&rows)
    }

    /// New table keeping only rows whose text column equals `value`.
    pub fn filter_text_eq(&self, column: &str, value: &str) -> Result<Table, TableError> {
        let values = self.text(column)?;
        let rows: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.as_deref() == Some(value))
            .map(|(row, _)| row)
            .collect();
        Ok(self.take_rows(&rows))
    }

    /// Distinct non-missing values of a text column, sorted lexicographically.
    pub fn distinct_text(&self, column: &str) -> Result<Vec<String>, TableError> {
        let values: BTreeSet<&str> = self
            .text(column)?
            .iter()
            .filter_map(|v| v.as_deref())
            .collect();
        Ok(values.into_iter().map(str::to_string).collect())
    }

    pub fn without_columns(&self, names: &[String]) -> Table {
        Table {
            name: self.name.clone(),
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .filter(|column| !names.contains(&column.name))
                .cloned()
                .collect(),
        }
    }

    pub fn with_replaced_numeric(
        &self,
        name: &str,
        values: Vec<Option<f64>>,
    ) -> Result<Table, TableError> {
        self.numeric(name)?;
        if values.len() != self.len() {
            return Err(TableError::LengthMismatch {
                table: self.name.clone(),
                column: name.to_string(),
                expected: self.len(),
                found: values.len(),
            });
        }
        let mut out = self.clone();
        if let Some(column) = out.columns.iter_mut().find(|c| c.name == name) {
            column.data = ColumnData::Numeric(values);
        }
        Ok(out)
    }

    /// Widens this table with every column of `right` except `exclude`.
    ///
    /// `matches[i]` is the `right` row attached to row `i`; `None` yields nulls. Name
    /// collisions get a `_<right table name>` suffix.
    pub fn join_columns(
        &self,
        right: &Table,
        matches: &[Option<usize>],
        exclude: &[&str],
    ) -> Result<Table, TableError> {
        if matches.len() != self.len() {
            return Err(TableError::LengthMismatch {
                table: self.name.clone(),
                column: format!("<{} matches>", right.name),
                expected: self.len(),
                found: matches.len(),
            });
        }

        let mut out = self.clone();
        for column in &right.columns {
            if exclude.contains(&column.name.as_str()) {
                continue;
            }
            let name = if out.has_column(&column.name) {
                format!("{}_{}", column.name, right.name)
            } else {
                column.name.clone()
            };
            out.push_column(Column {
                name,
                data: column.data.gather(matches),
            })?;
        }
        Ok(out)
    }

    /// Checks declared columns: required ones must exist and every present one must
    /// have the declared kind.
    pub fn conform(&self, schema: &[ColumnSpec]) -> Result<(), TableError> {
        for spec in schema {
            match self.column(spec.name) {
                Some(column) if column.data.kind() != spec.kind => {
                    return Err(TableError::KindMismatch {
                        table: self.name.clone(),
                        column: spec.name.to_string(),
                        expected: spec.kind,
                        found: column.data.kind(),
                    });
                }
                Some(_) => {}
                None if spec.required => {
                    return Err(TableError::MissingColumn {
                        table: self.name.clone(),
                        column: spec.name.to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// SHA-256 over index and column contents; stable across runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.index {
            RowIndex::Positional(len) => hasher.update(format!("positional:{len};")),
            RowIndex::Temporal(ts) => {
                hasher.update("temporal:");
                for t in ts {
                    match t {
                        Some(t) => hasher.update(format!("{t},")),
                        None => hasher.update("-,"),
                    }
                }
                hasher.update(";");
            }
        }
        for column in &self.columns {
            hasher.update(format!("column:{}:{:?}:", column.name, column.data.kind()));
            match &column.data {
                ColumnData::Numeric(values) => {
                    for v in values {
                        hasher.update(format!("{v:?},"));
                    }
                }
                ColumnData::Text(values) => {
                    for v in values {
                        hasher.update(format!("{v:?},"));
                    }
                }
            }
            hasher.update(";");
        }
        hex::encode(hasher.finalize())
    }

    pub(crate) fn gather(&self, rows: &[Option<usize>]) -> Table {
        Table {
            name: self.name.clone(),
            index: self.index.gather(rows),
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    data: column.data.gather(rows),
                })
                .collect(),
        }
    }

    fn column_names_of(&self, kind: ColumnKind) -> Vec<String> {
        self.columns
            .iter()
            .filter(|column| column.data.kind() == kind)
            .map(|column| column.name.clone())
            .collect()
    }

    fn require(&self, name: &str) -> Result<&Column, TableError> {
        self.column(name).ok_or_else(|| TableError::MissingColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    fn kind_mismatch(&self, name: &str, expected: ColumnKind) -> TableError {
        TableError::KindMismatch {
            table: self.name.clone(),
            column: name.to_string(),
            expected,
            found: match expected {
                ColumnKind::Numeric => ColumnKind::Text,
                ColumnKind::Text => ColumnKind::Numeric,
            },
        }
    }
}

/// Distinct parcel ids of a monitoring table in lexicographic order.
pub fn list_parcels(monitoring: &Table) -> Result<Vec<String>, TableError> {
    monitoring.distinct_text(PARCEL_ID_COLUMN)
}

pub(crate) fn is_missing(value: Option<f64>) -> bool {
    value.map_or(true, f64::is_nan)
}

pub(crate) fn observed(values: &[Option<f64>]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().flatten().filter(|v| !v.is_nan())
}
