//! Fusion of monitoring, weather and soil tables into one scaled feature table.
//!
//! Flow for one preparation call:
//! - harmonize weather units, optionally resample weather to a fixed frequency
//! - order the monitoring subset and weather by time, impute monitoring gaps
//! - asof-join weather onto monitoring (latest weather row at or before each
//!   observation, within tolerance; unmatched rows keep null weather columns)
//! - left-join soil on the parcel key
//! - standardize every numeric column with statistics fit on this call's data

use std::collections::HashMap;
use std::thread;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::impute::{ImputeError, MedianImputer};
use crate::scaler::{ScaleError, ScalerStats, StandardScaler};
use crate::sources::{SourceKind, SourceTables};
use crate::table::{ColumnKind, RowIndex, Table, TableError, PARCEL_ID_COLUMN};
use crate::temporal::{
    resample, sort_by_time, validate_temporal_index, Frequency, TemporalError,
};
use crate::units::{apply_unit_rule, UnitConversion, UnitError, UnitRule, KELVIN_TO_CELSIUS};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_ASOF_TOLERANCE_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegeneratePolicy {
    /// Zero-variance columns fail the preparation call.
    Strict,
    /// Zero-variance columns are removed from the feature table and listed in the report.
    DropAndReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionConfig {
    pub asof_tolerance_ms: i64,
    pub join_key: String,
    pub unit_rules: Vec<UnitRule>,
    pub weather_frequency: Option<Frequency>,
    pub impute_monitoring: bool,
    pub degenerate_policy: DegeneratePolicy,
    pub schema_version: u32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            asof_tolerance_ms: DEFAULT_ASOF_TOLERANCE_MS,
            join_key: PARCEL_ID_COLUMN.to_string(),
            unit_rules: vec![KELVIN_TO_CELSIUS],
            weather_frequency: None,
            impute_monitoring: true,
            degenerate_policy: DegeneratePolicy::Strict,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub scaled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedConversion {
    pub column: String,
    pub conversion: UnitConversion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparationReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub weather_matched_rows: u64,
    pub soil_matched_rows: u64,
    pub imputed_values: u64,
    pub unit_conversions: Vec<AppliedConversion>,
    pub dropped_columns: Vec<String>,
    /// Numeric columns with no observed value in this call, kept as nulls and unscaled.
    pub null_columns: Vec<String>,
    /// Content fingerprint of the monitoring subset the statistics were fit on.
    pub input_fingerprint: String,
}

/// Output of one preparation call. Owned by the caller; nothing is shared with the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub table: Table,
    pub schema: FeatureSchema,
    pub scaler: ScalerStats,
    pub report: PreparationReport,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Column values in their original units (scaling undone).
    pub fn raw_numeric(&self, column: &str) -> Result<Vec<Option<f64>>, TableError> {
        let values = self.table.numeric(column)?;
        Ok(values
            .iter()
            .map(|v| v.map(|v| self.scaler.inverse(column, v).unwrap_or(v)))
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("insufficient data: {missing} table is not loaded or empty")]
    InsufficientData { missing: SourceKind },
    #[error("table {table} lacks join key column {key}")]
    MissingJoinKey { table: String, key: String },
    #[error("no scalable numeric feature columns in fused table")]
    NoNumericFeatures,
    #[error(transparent)]
    Temporal(#[from] TemporalError),
    #[error(transparent)]
    Units(#[from] UnitError),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Single error surface of [`FusionEngine::prepare_features`].
#[derive(Debug, Error)]
#[error("feature preparation failed: {cause}")]
pub struct FeaturePreparationError {
    #[source]
    pub cause: FusionError,
}

impl FeaturePreparationError {
    pub fn cause(&self) -> &FusionError {
        &self.cause
    }
}

impl From<FusionError> for FeaturePreparationError {
    fn from(cause: FusionError) -> Self {
        Self { cause }
    }
}

#[derive(Debug)]
pub struct ParcelFeatures {
    pub parcel_id: String,
    pub result: Result<FeatureTable, FeaturePreparationError>,
}

#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    cfg: FusionConfig,
    monitoring: Option<Table>,
    weather: Option<Table>,
    soil: Option<Table>,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Self {
        Self {
            cfg,
            monitoring: None,
            weather: None,
            soil: None,
        }
    }

    pub fn from_sources(sources: &SourceTables, cfg: FusionConfig) -> Self {
        Self::new(cfg)
            .with_monitoring(sources.monitoring.clone())
            .with_weather(sources.weather.clone())
            .with_soil(sources.soil.clone())
    }

    pub fn with_monitoring(mut self, monitoring: Table) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn with_weather(mut self, weather: Table) -> Self {
        self.weather = Some(weather);
        self
    }

    pub fn with_soil(mut self, soil: Table) -> Self {
        self.soil = Some(soil);
        self
    }

    pub fn monitoring(&self) -> Option<&Table> {
        self.monitoring.as_ref()
    }

    /// Fuses `monitoring_subset` with the loaded weather and soil tables.
    ///
    /// The result has exactly one row per subset row, ordered by timestamp. Either the
    /// whole table is returned or an error; inputs are never modified.
    pub fn prepare_features(
        &self,
        monitoring_subset: &Table,
    ) -> Result<FeatureTable, FeaturePreparationError> {
        self.prepare(monitoring_subset, self.cfg.degenerate_policy)
            .map_err(|cause| preparation_failed(monitoring_subset, cause))
    }

    /// Like [`prepare_features`](Self::prepare_features) for the rows of one parcel.
    ///
    /// Soil attributes are constant within a parcel, so under `Strict` a
    /// degenerate-column failure is retried once with `DropAndReport`; the dropped
    /// columns are listed in the report.
    pub fn prepare_parcel_features(
        &self,
        parcel_subset: &Table,
    ) -> Result<FeatureTable, FeaturePreparationError> {
        let result = match self.prepare(parcel_subset, self.cfg.degenerate_policy) {
            Err(FusionError::Scale(ScaleError::DegenerateColumn { columns }))
                if self.cfg.degenerate_policy == DegeneratePolicy::Strict =>
            {
                info!(
                    component = "fusion",
                    event = "fusion.prepare.degenerate_retry",
                    subset = parcel_subset.name(),
                    columns = ?columns
                );
                self.prepare(parcel_subset, DegeneratePolicy::DropAndReport)
            }
            other => other,
        };
        result.map_err(|cause| preparation_failed(parcel_subset, cause))
    }

    /// Prepares each parcel of `monitoring_subset` independently on its own worker
    /// thread with [`prepare_parcel_features`](Self::prepare_parcel_features).
    /// Results come back in lexicographic parcel order.
    pub fn prepare_features_by_parcel(
        &self,
        monitoring_subset: &Table,
    ) -> Result<Vec<ParcelFeatures>, FeaturePreparationError> {
        let key = self.cfg.join_key.as_str();
        if !monitoring_subset.has_column(key) {
            return Err(FusionError::MissingJoinKey {
                table: monitoring_subset.name().to_string(),
                key: key.to_string(),
            }
            .into());
        }

        let parcels = monitoring_subset
            .distinct_text(key)
            .map_err(FusionError::from)?;
        let subsets = parcels
            .into_iter()
            .map(|parcel| {
                let subset = monitoring_subset.filter_text_eq(key, &parcel)?;
                Ok((parcel, subset))
            })
            .collect::<Result<Vec<_>, TableError>>()
            .map_err(FusionError::from)?;

        info!(
            component = "fusion",
            event = "fusion.prepare_by_parcel.start",
            parcels = subsets.len()
        );

        let results: Vec<ParcelFeatures> = thread::scope(|scope| {
            let handles: Vec<_> = subsets
                .iter()
                .map(|(parcel, subset)| {
                    (
                        parcel.clone(),
                        scope.spawn(move || self.prepare_parcel_features(subset)),
                    )
                })
                .collect();

            handles
                .into_iter()
                .map(|(parcel_id, handle)| ParcelFeatures {
                    parcel_id,
                    result: handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                })
                .collect()
        });

        Ok(results)
    }

    fn prepare(
        &self,
        monitoring_subset: &Table,
        degenerate_policy: DegeneratePolicy,
    ) -> Result<FeatureTable, FusionError> {
        loaded(self.monitoring.as_ref(), SourceKind::Monitoring)?;
        let weather = loaded(self.weather.as_ref(), SourceKind::Weather)?;
        let soil = loaded(self.soil.as_ref(), SourceKind::Soil)?;
        if monitoring_subset.is_empty() {
            return Err(FusionError::InsufficientData {
                missing: SourceKind::Monitoring,
            });
        }

        let key = self.cfg.join_key.as_str();
        require_join_key(monitoring_subset, key)?;
        require_join_key(soil, key)?;

        info!(
            component = "fusion",
            event = "fusion.prepare.start",
            subset = monitoring_subset.name(),
            rows = monitoring_subset.len(),
            asof_tolerance_ms = self.cfg.asof_tolerance_ms,
            join_key = key,
            degenerate_policy = ?degenerate_policy
        );

        let input_fingerprint = monitoring_subset.fingerprint();

        let (weather, unit_conversions) = self.harmonize_weather(weather)?;
        let weather = sort_by_time(&weather)?;

        let mut observations = sort_by_time(monitoring_subset)?;
        let mut imputed_values = 0usize;
        if self.cfg.impute_monitoring {
            let numeric = observations.numeric_column_names();
            if !numeric.is_empty() {
                let stats = MedianImputer::fit(&observations, &numeric)?;
                let (filled, count) = stats.apply(&observations)?;
                observations = filled;
                imputed_values = count;
            }
        }

        let observed_ts = validate_temporal_index(&observations)?;
        let weather_ts = validate_temporal_index(&weather)?;
        let weather_matches = asof_matches(&observed_ts, &weather_ts, self.cfg.asof_tolerance_ms);
        let weather_matched_rows = weather_matches.iter().filter(|m| m.is_some()).count();
        if weather_matched_rows < observations.len() {
            warn!(
                component = "fusion",
                event = "fusion.asof.unmatched",
                unmatched_rows = observations.len() - weather_matched_rows,
                asof_tolerance_ms = self.cfg.asof_tolerance_ms
            );
        }
        let fused = observations.join_columns(&weather, &weather_matches, &[])?;

        let soil_matches = key_matches(&fused, soil, key)?;
        let soil_matched_rows = soil_matches.iter().filter(|m| m.is_some()).count();
        if soil_matched_rows < fused.len() {
            warn!(
                component = "fusion",
                event = "fusion.soil.unmatched",
                unmatched_rows = fused.len() - soil_matched_rows
            );
        }
        let joined = fused.join_columns(soil, &soil_matches, &[key])?;
        debug_assert_eq!(joined.len(), monitoring_subset.len());

        let numeric = joined.numeric_column_names();
        if numeric.is_empty() {
            return Err(FusionError::NoNumericFeatures);
        }

        let (table, scaler, dropped_columns) = scale(&joined, &numeric, degenerate_policy)?;
        let schema = build_feature_schema(&self.cfg, &table, &scaler);

        let report = PreparationReport {
            input_rows: monitoring_subset.len() as u64,
            output_rows: table.len() as u64,
            weather_matched_rows: weather_matched_rows as u64,
            soil_matched_rows: soil_matched_rows as u64,
            imputed_values: imputed_values as u64,
            unit_conversions,
            dropped_columns,
            null_columns: scaler.unobserved.clone(),
            input_fingerprint,
        };

        info!(
            component = "fusion",
            event = "fusion.prepare.finish",
            input_rows = report.input_rows,
            output_rows = report.output_rows,
            weather_matched_rows = report.weather_matched_rows,
            soil_matched_rows = report.soil_matched_rows,
            imputed_values = report.imputed_values,
            scaled_columns = scaler.columns.len(),
            dropped_columns = ?report.dropped_columns,
            null_columns = ?report.null_columns,
            fingerprint = %schema.fingerprint
        );

        Ok(FeatureTable {
            table,
            schema,
            scaler,
            report,
        })
    }

    fn harmonize_weather(
        &self,
        weather: &Table,
    ) -> Result<(Table, Vec<AppliedConversion>), FusionError> {
        let mut out = weather.clone();
        let mut conversions = Vec::new();
        for rule in &self.cfg.unit_rules {
            if !out.has_column(rule.column) {
                debug!(
                    component = "fusion",
                    event = "fusion.units.rule_skipped",
                    column = rule.column
                );
                continue;
            }
            let (converted, conversion) = apply_unit_rule(&out, rule)?;
            out = converted;
            conversions.push(AppliedConversion {
                column: rule.column.to_string(),
                conversion,
            });
        }

        if let Some(frequency) = self.cfg.weather_frequency {
            out = resample(&out, frequency)?;
        }
        Ok((out, conversions))
    }
}

/// Standardizes `numeric`; fails with `NoNumericFeatures` when no column is left to scale.
fn scale(
    joined: &Table,
    numeric: &[String],
    policy: DegeneratePolicy,
) -> Result<(Table, ScalerStats, Vec<String>), FusionError> {
    let (reduced, stats, dropped) = match StandardScaler::fit(joined, numeric) {
        Ok(stats) => (joined.clone(), stats, Vec::new()),
        Err(ScaleError::DegenerateColumn { columns })
            if policy == DegeneratePolicy::DropAndReport =>
        {
            warn!(
                component = "fusion",
                event = "fusion.scale.degenerate_dropped",
                columns = ?columns
            );
            let kept: Vec<String> = numeric
                .iter()
                .filter(|name| !columns.contains(name))
                .cloned()
                .collect();
            let reduced = joined.without_columns(&columns);
            let stats = StandardScaler::fit(&reduced, &kept)?;
            (reduced, stats, columns)
        }
        Err(err) => return Err(err.into()),
    };

    if stats.columns.is_empty() {
        return Err(FusionError::NoNumericFeatures);
    }
    Ok((stats.transform(&reduced)?, stats, dropped))
}

fn preparation_failed(subset: &Table, cause: FusionError) -> FeaturePreparationError {
    warn!(
        component = "fusion",
        event = "fusion.prepare.error",
        subset = subset.name(),
        error = %cause
    );
    FeaturePreparationError::from(cause)
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FusionError> {
    if expected_version != actual.version {
        return Err(FusionError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FusionError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// For each left timestamp, the last right row with `ts <= left` and
/// `left - ts <= tolerance_ms`. Both slices must be sorted ascending.
fn asof_matches(left: &[i64], right: &[i64], tolerance_ms: i64) -> Vec<Option<usize>> {
    let mut out = Vec::with_capacity(left.len());
    let mut next = 0usize;
    for &ts in left {
        while next < right.len() && right[next] <= ts {
            next += 1;
        }
        let matched = next
            .checked_sub(1)
            .filter(|&candidate| ts - right[candidate] <= tolerance_ms);
        out.push(matched);
    }
    out
}

fn key_matches(left: &Table, right: &Table, key: &str) -> Result<Vec<Option<usize>>, FusionError> {
    let right_keys = right.text(key)?;
    let mut lookup: HashMap<&str, usize> = HashMap::with_capacity(right_keys.len());
    for (row, id) in right_keys.iter().enumerate() {
        let Some(id) = id.as_deref() else {
            continue;
        };
        if lookup.contains_key(id) {
            warn!(
                component = "fusion",
                event = "fusion.soil.duplicate_key",
                table = right.name(),
                key = id,
                row
            );
            continue;
        }
        lookup.insert(id, row);
    }

    Ok(left
        .text(key)?
        .iter()
        .map(|id| id.as_deref().and_then(|id| lookup.get(id).copied()))
        .collect())
}

fn loaded(table: Option<&Table>, kind: SourceKind) -> Result<&Table, FusionError> {
    table
        .filter(|table| !table.is_empty())
        .ok_or(FusionError::InsufficientData { missing: kind })
}

fn require_join_key(table: &Table, key: &str) -> Result<(), FusionError> {
    if table.has_column(key) {
        Ok(())
    } else {
        Err(FusionError::MissingJoinKey {
            table: table.name().to_string(),
            key: key.to_string(),
        })
    }
}

fn build_feature_schema(cfg: &FusionConfig, table: &Table, scaler: &ScalerStats) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = table
        .columns()
        .iter()
        .map(|column| FeatureColumn {
            name: column.name.clone(),
            kind: column.data.kind(),
            scaled: scaler.is_scaled(&column.name),
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("asof_tolerance_ms:{};", cfg.asof_tolerance_ms));
    hasher.update(format!("join_key:{};", cfg.join_key));
    hasher.update(match table.index() {
        RowIndex::Temporal(_) => "index:temporal;",
        RowIndex::Positional(_) => "index:positional;",
    });
    hasher.update("columns:");
    for column in &columns {
        hasher.update(format!(
            "{}:{:?}:{};",
            column.name, column.kind, column.scaled
        ));
    }

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint: hex::encode(hasher.finalize()),
        columns,
    }
}
