//! Standardization of numeric feature columns to zero mean and unit variance.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::table::{observed, Table, TableError};

/// Deviations at or below this fraction of `1 + |mean|` count as zero variance.
const DEGENERATE_STD_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColumnMoments {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScalerStats {
    pub columns: BTreeMap<String, ColumnMoments>,
    /// Requested columns without a single observed value; left as nulls.
    pub unobserved: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScaleError {
    #[error("degenerate columns with zero variance: {columns:?}")]
    DegenerateColumn { columns: Vec<String> },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardScaler;

impl StandardScaler {
    /// Population mean and standard deviation over observed values of each column.
    /// All zero-variance columns are reported together. Columns with no observed
    /// value are not degenerate: they stay unscaled and are listed in `unobserved`.
    pub fn fit(table: &Table, columns: &[String]) -> Result<ScalerStats, ScaleError> {
        let mut stats = ScalerStats::default();
        let mut degenerate = Vec::new();

        for column in columns {
            let values: Vec<f64> = observed(table.numeric(column)?).collect();
            match moments(&values) {
                None => {
                    debug!(
                        component = "scaler",
                        event = "scaler.column_unobserved",
                        table = table.name(),
                        column = column.as_str()
                    );
                    stats.unobserved.push(column.clone());
                }
                Some(m) if m.std > DEGENERATE_STD_EPSILON * (1.0 + m.mean.abs()) => {
                    stats.columns.insert(column.clone(), m);
                }
                Some(_) => degenerate.push(column.clone()),
            }
        }

        if !degenerate.is_empty() {
            return Err(ScaleError::DegenerateColumn {
                columns: degenerate,
            });
        }
        Ok(stats)
    }

    pub fn fit_transform(
        table: &Table,
        columns: &[String],
    ) -> Result<(Table, ScalerStats), ScaleError> {
        let stats = Self::fit(table, columns)?;
        let out = stats.transform(table)?;
        Ok((out, stats))
    }
}

impl ScalerStats {
    pub fn transform(&self, table: &Table) -> Result<Table, ScaleError> {
        let mut out = table.clone();
        for (column, m) in &self.columns {
            let scaled = out
                .numeric(column)?
                .iter()
                .map(|v| v.map(|v| (v - m.mean) / m.std))
                .collect();
            out = out.with_replaced_numeric(column, scaled)?;
            debug!(
                component = "scaler",
                event = "scaler.column_scaled",
                table = table.name(),
                column = column.as_str(),
                mean = m.mean,
                std = m.std
            );
        }
        Ok(out)
    }

    pub fn moments(&self, column: &str) -> Option<ColumnMoments> {
        self.columns.get(column).copied()
    }

    pub fn is_scaled(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Maps a scaled value back to its original unit; `None` for unscaled columns.
    pub fn inverse(&self, column: &str, value: f64) -> Option<f64> {
        self.moments(column).map(|m| value * m.std + m.mean)
    }
}

fn moments(values: &[f64]) -> Option<ColumnMoments> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Some(ColumnMoments {
        mean,
        std: variance.sqrt(),
    })
}
