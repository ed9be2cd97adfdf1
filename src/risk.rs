//! Yield-risk scoring against per-parcel historical yield baselines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::fusion::FeatureTable;
use crate::table::{Table, TableError, PARCEL_ID_COLUMN};
use crate::temporal::{validate_temporal_index, TemporalError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Feature column scored against the baseline, read in its original units.
    pub target_column: String,
    pub parcel_column: String,
    /// Yield column of the history table.
    pub yield_column: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            target_column: "rendement_estime".to_string(),
            parcel_column: PARCEL_ID_COLUMN.to_string(),
            yield_column: "rendement".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParcelYieldStats {
    pub mean: f64,
    /// Sample standard deviation; 0 when fewer than two records exist.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRow {
    pub ts_ms_utc: i64,
    pub parcel_id: String,
    pub target_value: Option<f64>,
    pub deviation_from_mean: Option<f64>,
    pub risk_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTable {
    pub rows: Vec<RiskRow>,
    pub baselines: BTreeMap<String, ParcelYieldStats>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("parcel {parcel_id} has no historical yield records")]
    NoHistoricalData { parcel_id: String },
    #[error("parcel {parcel_id} yield history cannot define a deviation ({count} records, std {std})")]
    DegenerateHistory {
        parcel_id: String,
        count: u64,
        std: f64,
    },
    #[error("feature row {row} has no parcel id")]
    MissingParcelId { row: usize },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Temporal(#[from] TemporalError),
}

/// `1 / (1 + e^-x)`, kept strictly inside (0, 1) even where f64 rounding would reach
/// an endpoint.
pub fn logistic(x: f64) -> f64 {
    let score = 1.0 / (1.0 + (-x).exp());
    score.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON)
}

/// Mean, sample deviation and range of yield per parcel. Rows missing either the
/// parcel id or the yield value are ignored.
pub fn fit_yield_baselines(
    yield_history: &Table,
    cfg: &RiskConfig,
) -> Result<BTreeMap<String, ParcelYieldStats>, RiskError> {
    let parcels = yield_history.text(&cfg.parcel_column)?;
    let yields = yield_history.numeric(&cfg.yield_column)?;

    let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for (parcel, value) in parcels.iter().zip(yields) {
        if let (Some(parcel), Some(value)) = (parcel.as_deref(), value.filter(|v| !v.is_nan())) {
            grouped.entry(parcel).or_default().push(value);
        }
    }

    let baselines: BTreeMap<String, ParcelYieldStats> = grouped
        .into_iter()
        .map(|(parcel, values)| (parcel.to_string(), yield_stats(&values)))
        .collect();

    info!(
        component = "risk",
        event = "risk.baselines.fit",
        table = yield_history.name(),
        parcels = baselines.len()
    );
    Ok(baselines)
}

/// Scores every feature row: `deviation = (v - mean) / std` against the row's parcel
/// baseline and `risk = logistic(deviation)`. Rows whose target is missing get no score.
pub fn compute_risk(
    features: &FeatureTable,
    yield_history: &Table,
    cfg: &RiskConfig,
) -> Result<RiskTable, RiskError> {
    let baselines = fit_yield_baselines(yield_history, cfg)?;
    let timestamps = validate_temporal_index(&features.table)?;
    let parcels = features.table.text(&cfg.parcel_column)?;
    let targets = features.raw_numeric(&cfg.target_column)?;

    let mut rows = Vec::with_capacity(features.len());
    for (row, ((ts, parcel), target)) in timestamps.iter().zip(parcels).zip(targets).enumerate() {
        let parcel_id = parcel
            .as_deref()
            .ok_or(RiskError::MissingParcelId { row })?;
        let stats = baselines
            .get(parcel_id)
            .ok_or_else(|| RiskError::NoHistoricalData {
                parcel_id: parcel_id.to_string(),
            })?;
        if stats.count < 2 || stats.std <= 0.0 {
            return Err(RiskError::DegenerateHistory {
                parcel_id: parcel_id.to_string(),
                count: stats.count,
                std: stats.std,
            });
        }

        let target_value = target.filter(|v| !v.is_nan());
        let deviation = target_value.map(|v| (v - stats.mean) / stats.std);
        rows.push(RiskRow {
            ts_ms_utc: *ts,
            parcel_id: parcel_id.to_string(),
            target_value,
            deviation_from_mean: deviation,
            risk_score: deviation.map(logistic),
        });
    }

    let unscored = rows.iter().filter(|row| row.risk_score.is_none()).count();
    if unscored > 0 {
        warn!(
            component = "risk",
            event = "risk.rows.unscored",
            target_column = cfg.target_column.as_str(),
            unscored
        );
    }
    info!(
        component = "risk",
        event = "risk.compute.finish",
        rows = rows.len(),
        parcels = baselines.len()
    );

    Ok(RiskTable { rows, baselines })
}

/// Left-joins `yield_mean`, `yield_std`, `yield_min` and `yield_max` onto a
/// parcel-keyed table. Parcels without history get missing values.
pub fn enrich_with_yield_history(
    table: &Table,
    yield_history: &Table,
    cfg: &RiskConfig,
) -> Result<Table, RiskError> {
    let baselines = fit_yield_baselines(yield_history, cfg)?;
    let matched: Vec<Option<&ParcelYieldStats>> = table
        .text(&cfg.parcel_column)?
        .iter()
        .map(|parcel| parcel.as_deref().and_then(|p| baselines.get(p)))
        .collect();

    let column = |pick: fn(&ParcelYieldStats) -> f64| -> Vec<Option<f64>> {
        matched.iter().map(|stats| stats.map(pick)).collect()
    };
    let out = table
        .clone()
        .with_numeric("yield_mean", column(|s| s.mean))?
        .with_numeric("yield_std", column(|s| s.std))?
        .with_numeric("yield_min", column(|s| s.min))?
        .with_numeric("yield_max", column(|s| s.max))?;
    Ok(out)
}

fn yield_stats(values: &[f64]) -> ParcelYieldStats {
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count < 2 {
        0.0
    } else {
        let ss = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        (ss / (count - 1) as f64).sqrt()
    };
    ParcelYieldStats {
        mean,
        std,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        count: count as u64,
    }
}
