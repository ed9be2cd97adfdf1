//! Water-stress severity counts for presentation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fusion::FeatureTable;
use crate::table::{observed, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeverityLevel {
    Low,
    Moderate,
    High,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 3] = [Self::Low, Self::Moderate, Self::High];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StressType {
    /// Temperature outside the comfort band.
    WeatherDriven,
    WaterDriven,
}

impl StressType {
    pub const ALL: [StressType; 2] = [Self::WeatherDriven, Self::WaterDriven];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressConfig {
    pub stress_column: String,
    pub temperature_column: String,
    /// Bucket edges; level `i` covers `(breakpoints[i], breakpoints[i + 1]]`.
    pub breakpoints: [f64; 4],
    /// Inclusive temperature range (°C) treated as water-driven stress.
    pub comfort_band: (f64, f64),
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            stress_column: "stress_hydrique".to_string(),
            temperature_column: "temperature".to_string(),
            breakpoints: [0.0, 0.05, 0.1, 1.0],
            comfort_band: (5.0, 30.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressCell {
    pub level: SeverityLevel,
    pub stress_type: StressType,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StressSummary {
    pub counts: BTreeMap<(SeverityLevel, StressType), u64>,
    /// Rows whose stress value is missing or outside the breakpoints.
    pub unbucketed: u64,
}

impl StressSummary {
    pub fn count(&self, level: SeverityLevel, stress_type: StressType) -> u64 {
        self.counts
            .get(&(level, stress_type))
            .copied()
            .unwrap_or(0)
    }

    /// Every (level, type) pair in order, zero counts included.
    pub fn cells(&self) -> Vec<StressCell> {
        SeverityLevel::ALL
            .into_iter()
            .flat_map(|level| {
                StressType::ALL.into_iter().map(move |stress_type| StressCell {
                    level,
                    stress_type,
                    count: self.count(level, stress_type),
                })
            })
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StressError {
    #[error("stress breakpoints must be strictly increasing: {breakpoints:?}")]
    InvalidBreakpoints { breakpoints: [f64; 4] },
    #[error("comfort band lower bound {0} is above upper bound {1}")]
    InvalidComfortBand(f64, f64),
    #[error("column {column} has no observed temperatures")]
    NoTemperatureData { column: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Counts feature rows per (severity level, stress type), reading both columns in
/// their original units.
pub fn summarize_stress(
    features: &FeatureTable,
    cfg: &StressConfig,
) -> Result<StressSummary, StressError> {
    if !cfg.breakpoints.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(StressError::InvalidBreakpoints {
            breakpoints: cfg.breakpoints,
        });
    }
    let (low, high) = cfg.comfort_band;
    if low > high {
        return Err(StressError::InvalidComfortBand(low, high));
    }

    let stress = features.raw_numeric(&cfg.stress_column)?;
    let temperature = features.raw_numeric(&cfg.temperature_column)?;

    let observed_temps: Vec<f64> = observed(&temperature).collect();
    if observed_temps.is_empty() {
        return Err(StressError::NoTemperatureData {
            column: cfg.temperature_column.clone(),
        });
    }
    let mean_temp = observed_temps.iter().sum::<f64>() / observed_temps.len() as f64;

    let mut summary = StressSummary::default();
    for (value, temp) in stress.iter().zip(&temperature) {
        let Some(level) = value.and_then(|v| severity(v, &cfg.breakpoints)) else {
            summary.unbucketed += 1;
            continue;
        };
        let temp = temp.filter(|t| !t.is_nan()).unwrap_or(mean_temp);
        let stress_type = if temp < low || temp > high {
            StressType::WeatherDriven
        } else {
            StressType::WaterDriven
        };
        *summary.counts.entry((level, stress_type)).or_insert(0) += 1;
    }

    if summary.unbucketed > 0 {
        debug!(
            component = "stress",
            event = "stress.rows.unbucketed",
            unbucketed = summary.unbucketed
        );
    }
    info!(
        component = "stress",
        event = "stress.summarize.finish",
        rows = features.len(),
        bucketed = summary.total(),
        unbucketed = summary.unbucketed
    );
    Ok(summary)
}

fn severity(value: f64, breakpoints: &[f64; 4]) -> Option<SeverityLevel> {
    SeverityLevel::ALL
        .into_iter()
        .zip(breakpoints.windows(2))
        .find(|(_, edges)| value > edges[0] && value <= edges[1])
        .map(|(level, _)| level)
}
