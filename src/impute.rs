//! Column-wise median imputation, fit and applied within a single call.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::table::{is_missing, observed, Table, TableError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImputeError {
    #[error("column {column} in table {table} has no observed values to impute from")]
    EmptyColumn { table: String, column: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputerStats {
    pub medians: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MedianImputer;

impl MedianImputer {
    pub fn fit(table: &Table, columns: &[String]) -> Result<ImputerStats, ImputeError> {
        let mut medians = BTreeMap::new();
        for column in columns {
            let mut values: Vec<f64> = observed(table.numeric(column)?).collect();
            let median = median(&mut values).ok_or_else(|| ImputeError::EmptyColumn {
                table: table.name().to_string(),
                column: column.clone(),
            })?;
            medians.insert(column.clone(), median);
        }
        Ok(ImputerStats { medians })
    }
}

impl ImputerStats {
    /// Returns the filled table and how many values were replaced.
    pub fn apply(&self, table: &Table) -> Result<(Table, usize), ImputeError> {
        let mut out = table.clone();
        let mut filled = 0usize;
        for (column, median) in &self.medians {
            let values = out.numeric(column)?;
            let missing = values.iter().filter(|v| is_missing(**v)).count();
            if missing == 0 {
                continue;
            }
            let replaced = values
                .iter()
                .map(|v| if is_missing(*v) { Some(*median) } else { *v })
                .collect();
            out = out.with_replaced_numeric(column, replaced)?;
            filled += missing;

            debug!(
                component = "impute",
                event = "impute.column_filled",
                table = table.name(),
                column = column.as_str(),
                median = *median,
                filled = missing
            );
        }
        Ok((out, filled))
    }
}

/// Fits medians over every numeric column of `table` and fills its gaps.
pub fn impute_median(table: &Table) -> Result<(Table, ImputerStats, usize), ImputeError> {
    let stats = MedianImputer::fit(table, &table.numeric_column_names())?;
    let (out, filled) = stats.apply(table)?;
    Ok((out, stats, filled))
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
