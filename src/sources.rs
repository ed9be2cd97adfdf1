//! Loading and validation of the four input sources.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::observability::log_sources_loaded;
use crate::table::{Column, ColumnData, ColumnKind, ColumnSpec, Table, TableError, PARCEL_ID_COLUMN};
use crate::temporal::{validate_temporal_index, TemporalError};

pub const DATE_COLUMN: &str = "date";

pub const MONITORING_SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(PARCEL_ID_COLUMN, ColumnKind::Text),
    ColumnSpec::required("NDVI", ColumnKind::Numeric),
    ColumnSpec::required("LAI", ColumnKind::Numeric),
    ColumnSpec::required("biomasse", ColumnKind::Numeric),
    ColumnSpec::optional("stress_hydrique", ColumnKind::Numeric),
    ColumnSpec::optional("rendement_estime", ColumnKind::Numeric),
];

pub const WEATHER_SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required("temperature", ColumnKind::Numeric),
    ColumnSpec::optional("humidity", ColumnKind::Numeric),
    ColumnSpec::optional("precipitation", ColumnKind::Numeric),
    ColumnSpec::optional("wind_speed", ColumnKind::Numeric),
];

pub const SOIL_SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(PARCEL_ID_COLUMN, ColumnKind::Text),
    ColumnSpec::optional("type_sol", ColumnKind::Text),
    ColumnSpec::optional("ph", ColumnKind::Numeric),
    ColumnSpec::optional("matiere_organique", ColumnKind::Numeric),
];

pub const YIELD_HISTORY_SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(PARCEL_ID_COLUMN, ColumnKind::Text),
    ColumnSpec::required("rendement", ColumnKind::Numeric),
    ColumnSpec::optional("culture", ColumnKind::Text),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    Monitoring,
    Weather,
    Soil,
    YieldHistory,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        Self::Monitoring,
        Self::Weather,
        Self::Soil,
        Self::YieldHistory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Weather => "weather",
            Self::Soil => "soil",
            Self::YieldHistory => "yield_history",
        }
    }

    pub fn schema(self) -> &'static [ColumnSpec] {
        match self {
            Self::Monitoring => MONITORING_SCHEMA,
            Self::Weather => WEATHER_SCHEMA,
            Self::Soil => SOIL_SCHEMA,
            Self::YieldHistory => YIELD_HISTORY_SCHEMA,
        }
    }

    /// Soil is static reference data keyed by parcel only.
    pub fn is_temporal(self) -> bool {
        !matches!(self, Self::Soil)
    }

    fn default_file_name(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring_cultures.csv",
            Self::Weather => "meteo_detaillee.csv",
            Self::Soil => "sols.csv",
            Self::YieldHistory => "historique_rendements.csv",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceTables {
    pub monitoring: Table,
    pub weather: Table,
    pub soil: Table,
    pub yield_history: Table,
}

impl SourceTables {
    pub fn get(&self, kind: SourceKind) -> &Table {
        match kind {
            SourceKind::Monitoring => &self.monitoring,
            SourceKind::Weather => &self.weather,
            SourceKind::Soil => &self.soil,
            SourceKind::YieldHistory => &self.yield_history,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no 'date' column")]
    MissingDateColumn { path: PathBuf },
    #[error("{path} row {row}: failed to parse {column} value '{value}'")]
    ParseField {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },
    #[error("{kind} source failed schema validation: {source}")]
    Schema {
        kind: SourceKind,
        #[source]
        source: TableError,
    },
    #[error("{kind} source has an invalid temporal index: {source}")]
    Temporal {
        kind: SourceKind,
        #[source]
        source: TemporalError,
    },
}

pub trait SourceLoader {
    /// Returns the four source tables, validated against their declared schemas.
    fn load_sources(&self) -> Result<SourceTables, SourceError>;
}

/// Checks every table against its schema and every time-indexed table for a valid index.
pub fn validate_sources(tables: &SourceTables) -> Result<(), SourceError> {
    for kind in SourceKind::ALL {
        let table = tables.get(kind);
        table
            .conform(kind.schema())
            .map_err(|source| SourceError::Schema { kind, source })?;
        if kind.is_temporal() {
            validate_temporal_index(table)
                .map_err(|source| SourceError::Temporal { kind, source })?;
        }
    }
    Ok(())
}

/// Tables already built in memory, e.g. by an embedding application or a test.
#[derive(Debug, Clone)]
pub struct InMemorySources {
    tables: SourceTables,
}

impl InMemorySources {
    pub fn new(tables: SourceTables) -> Self {
        Self { tables }
    }
}

impl SourceLoader for InMemorySources {
    fn load_sources(&self) -> Result<SourceTables, SourceError> {
        validate_sources(&self.tables)?;
        log_sources_loaded("memory", &self.tables);
        Ok(self.tables.clone())
    }
}

/// Reads one CSV file per source from a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvDirectoryLoader {
    pub root: PathBuf,
    pub file_names: HashMap<SourceKind, String>,
}

impl CsvDirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_names: SourceKind::ALL
                .into_iter()
                .map(|kind| (kind, kind.default_file_name().to_string()))
                .collect(),
        }
    }

    pub fn with_file_name(mut self, kind: SourceKind, file_name: impl Into<String>) -> Self {
        self.file_names.insert(kind, file_name.into());
        self
    }

    pub fn path_for(&self, kind: SourceKind) -> PathBuf {
        let name = self
            .file_names
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_file_name());
        self.root.join(name)
    }
}

impl SourceLoader for CsvDirectoryLoader {
    fn load_sources(&self) -> Result<SourceTables, SourceError> {
        let load = |kind: SourceKind| read_csv_table(&self.path_for(kind), kind);
        let tables = SourceTables {
            monitoring: load(SourceKind::Monitoring)?,
            weather: load(SourceKind::Weather)?,
            soil: load(SourceKind::Soil)?,
            yield_history: load(SourceKind::YieldHistory)?,
        };
        validate_sources(&tables)?;
        log_sources_loaded(&self.root.display().to_string(), &tables);
        Ok(tables)
    }
}

/// Parses one source file into a table typed by the source's declared schema.
///
/// Time-indexed sources take their index from the `date` column; an unparseable date
/// leaves that row without a timestamp so index validation can name it. Columns not in
/// the schema are skipped.
pub fn read_csv_table(path: &Path, kind: SourceKind) -> Result<Table, SourceError> {
    let raw = fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let csv_err = |source| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(raw.as_slice());
    let headers = reader.headers().map_err(csv_err)?.clone();
    let records = reader
        .records()
        .collect::<Result<Vec<StringRecord>, _>>()
        .map_err(csv_err)?;

    let mut table = if kind.is_temporal() {
        let date_idx = headers
            .iter()
            .position(|h| h == DATE_COLUMN)
            .ok_or_else(|| SourceError::MissingDateColumn {
                path: path.to_path_buf(),
            })?;
        let timestamps = records
            .iter()
            .map(|record| record.get(date_idx).and_then(parse_timestamp_ms))
            .collect();
        Table::temporal(kind.as_str(), timestamps)
    } else {
        Table::positional(kind.as_str(), records.len())
    };

    for (idx, header) in headers.iter().enumerate() {
        if kind.is_temporal() && header == DATE_COLUMN {
            continue;
        }
        let Some(spec) = kind.schema().iter().find(|spec| spec.name == header) else {
            warn!(
                component = "sources",
                event = "sources.column.skipped",
                source = kind.as_str(),
                column = header
            );
            continue;
        };

        let data = match spec.kind {
            ColumnKind::Numeric => ColumnData::Numeric(
                records
                    .iter()
                    .enumerate()
                    .map(|(row, record)| parse_numeric(path, row, header, record.get(idx)))
                    .collect::<Result<_, _>>()?,
            ),
            ColumnKind::Text => ColumnData::Text(
                records
                    .iter()
                    .map(|record| {
                        record
                            .get(idx)
                            .filter(|raw| !raw.is_empty())
                            .map(str::to_string)
                    })
                    .collect(),
            ),
        };
        table
            .push_column(Column {
                name: header.to_string(),
                data,
            })
            .map_err(|source| SourceError::Schema { kind, source })?;
    }

    info!(
        component = "sources",
        event = "sources.file.loaded",
        source = kind.as_str(),
        path = %path.display(),
        rows = table.len(),
        columns = table.columns().len()
    );
    Ok(table)
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`, RFC 3339, `YYYY-MM-DD` and a
/// bare year (1 January). Naive values are read as UTC.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i32>()
            .ok()
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    None
}

fn parse_numeric(
    path: &Path,
    row: usize,
    column: &str,
    raw: Option<&str>,
) -> Result<Option<f64>, SourceError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) if raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("na") => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| SourceError::ParseField {
                path: path.to_path_buf(),
                row,
                column: column.to_string(),
                value: raw.to_string(),
            }),
    }
}
