//! Threshold-triggered unit harmonization.
//!
//! A rule inspects the maximum of one column and, when it exceeds the rule's
//! threshold, shifts every value of that column by a fixed offset. The check runs on
//! every application, so converted data (whose maximum is now below the threshold) is
//! left untouched.
//!
//! Known limitation: the rule reads magnitude, not provenance. For
//! [`KELVIN_TO_CELSIUS`] a Celsius series peaking above 100 or a Fahrenheit series
//! peaking above 100 is misread as Kelvin and shifted by -273.15.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::table::{observed, Table, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnitRule {
    pub column: &'static str,
    pub threshold: f64,
    pub offset: f64,
    pub from_unit: &'static str,
    pub to_unit: &'static str,
}

pub const KELVIN_TO_CELSIUS: UnitRule = UnitRule {
    column: "temperature",
    threshold: 100.0,
    offset: -273.15,
    from_unit: "K",
    to_unit: "°C",
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum UnitConversion {
    Applied { max_before: f64 },
    Skipped { max: Option<f64> },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnitError {
    #[error("unit rule {from_unit}->{to_unit} cannot be applied: {source}")]
    Column {
        from_unit: &'static str,
        to_unit: &'static str,
        #[source]
        source: TableError,
    },
}

pub fn apply_unit_rule(
    table: &Table,
    rule: &UnitRule,
) -> Result<(Table, UnitConversion), UnitError> {
    let values = table.numeric(rule.column).map_err(|source| UnitError::Column {
        from_unit: rule.from_unit,
        to_unit: rule.to_unit,
        source,
    })?;

    let max = observed(values).fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |current| current.max(v)))
    });

    match max {
        Some(max_before) if max_before > rule.threshold => {
            let converted = values.iter().map(|v| v.map(|v| v + rule.offset)).collect();
            let out = table
                .with_replaced_numeric(rule.column, converted)
                .map_err(|source| UnitError::Column {
                    from_unit: rule.from_unit,
                    to_unit: rule.to_unit,
                    source,
                })?;

            info!(
                component = "units",
                event = "units.converted",
                table = table.name(),
                column = rule.column,
                from_unit = rule.from_unit,
                to_unit = rule.to_unit,
                max_before
            );
            Ok((out, UnitConversion::Applied { max_before }))
        }
        max => {
            debug!(
                component = "units",
                event = "units.skipped",
                table = table.name(),
                column = rule.column,
                max = ?max
            );
            Ok((table.clone(), UnitConversion::Skipped { max }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather(temps: Vec<Option<f64>>) -> Table {
        let index = (0..temps.len() as i64).map(Some).collect();
        Table::temporal("weather", index)
            .with_numeric("temperature", temps)
            .unwrap()
    }

    #[test]
    fn converts_kelvin_series() {
        let table = weather(vec![Some(283.15), None, Some(300.15)]);
        let (out, conversion) = apply_unit_rule(&table, &KELVIN_TO_CELSIUS).unwrap();

        assert_eq!(conversion, UnitConversion::Applied { max_before: 300.15 });
        let temps = out.numeric("temperature").unwrap();
        assert!((temps[0].unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(temps[1], None);
        assert!((temps[2].unwrap() - 27.0).abs() < 1e-9);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let table = weather(vec![Some(283.15), Some(300.15)]);
        let (once, _) = apply_unit_rule(&table, &KELVIN_TO_CELSIUS).unwrap();
        let (twice, conversion) = apply_unit_rule(&once, &KELVIN_TO_CELSIUS).unwrap();

        assert!(matches!(conversion, UnitConversion::Skipped { .. }));
        assert_eq!(once, twice);
    }

    #[test]
    fn threshold_is_exclusive_and_all_missing_is_skipped() {
        let (_, conversion) =
            apply_unit_rule(&weather(vec![Some(100.0)]), &KELVIN_TO_CELSIUS).unwrap();
        assert_eq!(conversion, UnitConversion::Skipped { max: Some(100.0) });

        let (_, conversion) = apply_unit_rule(&weather(vec![None]), &KELVIN_TO_CELSIUS).unwrap();
        assert_eq!(conversion, UnitConversion::Skipped { max: None });
    }

    #[test]
    fn missing_column_is_reported() {
        let table = Table::temporal("weather", vec![Some(0)]);
        let err = apply_unit_rule(&table, &KELVIN_TO_CELSIUS).unwrap_err();
        assert!(matches!(
            err,
            UnitError::Column {
                source: TableError::MissingColumn { .. },
                ..
            }
        ));
    }
}
