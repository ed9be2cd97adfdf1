//! Temporal index validation, stable ordering and fixed-frequency resampling.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::table::{Column, ColumnData, RowIndex, Table};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
/// Upper bound on the number of grid labels one resample call may produce.
pub const MAX_RESAMPLE_BUCKETS: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Hourly,
    Daily,
    Minutes(u32),
}

impl Frequency {
    pub fn step_ms(self) -> i64 {
        match self {
            Self::Hourly => HOUR_MS,
            Self::Daily => DAY_MS,
            Self::Minutes(minutes) => i64::from(minutes) * MINUTE_MS,
        }
    }

    /// Accepts `hourly`/`1h`, `daily`/`1d` and `<n>min`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "hourly" | "h" | "1h" => Some(Self::Hourly),
            "daily" | "d" | "1d" => Some(Self::Daily),
            other => other
                .strip_suffix("min")
                .and_then(|minutes| minutes.parse::<u32>().ok())
                .filter(|minutes| *minutes > 0)
                .map(Self::Minutes),
        }
    }
}

/// Inclusive millisecond range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemporalError {
    #[error("table {table} has no valid temporal index (first offending row: {row:?})")]
    MissingTemporalIndex { table: String, row: Option<usize> },
    #[error("cannot resample table {table}: non-numeric columns {columns:?}")]
    UnsupportedResample { table: String, columns: Vec<String> },
    #[error("invalid resample frequency: {0:?}")]
    InvalidFrequency(Frequency),
    #[error("resampling table {table} at {frequency:?} needs {buckets} buckets (max {max})")]
    ResampleTooLarge {
        table: String,
        frequency: Frequency,
        buckets: i64,
        max: i64,
    },
    #[error(
        "temporal ranges do not overlap: latest start {latest_start_ts_ms_utc} is after earliest end {earliest_end_ts_ms_utc}"
    )]
    NoTemporalOverlap {
        latest_start_ts_ms_utc: i64,
        earliest_end_ts_ms_utc: i64,
    },
    #[error("temporal overlap check needs at least one non-empty table")]
    EmptyOverlapInput,
}

/// Returns the timestamps of `table` if every row carries a representable UTC instant.
pub fn validate_temporal_index(table: &Table) -> Result<Vec<i64>, TemporalError> {
    let timestamps = match table.index() {
        RowIndex::Temporal(timestamps) => timestamps,
        RowIndex::Positional(_) => {
            return Err(TemporalError::MissingTemporalIndex {
                table: table.name().to_string(),
                row: None,
            })
        }
    };

    timestamps
        .iter()
        .enumerate()
        .map(|(row, ts)| {
            ts.filter(|ts| Utc.timestamp_millis_opt(*ts).single().is_some())
                .ok_or_else(|| TemporalError::MissingTemporalIndex {
                    table: table.name().to_string(),
                    row: Some(row),
                })
        })
        .collect()
}

/// Ascending by timestamp; equal timestamps keep their original order.
pub fn sort_by_time(table: &Table) -> Result<Table, TemporalError> {
    let timestamps = validate_temporal_index(table)?;
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    order.sort_by_key(|&row| timestamps[row]);

    debug!(
        component = "temporal",
        event = "temporal.sort",
        table = table.name(),
        rows = order.len()
    );

    Ok(table.take_rows(&order))
}

/// Buckets rows onto a grid anchored at the first timestamp and averages each numeric
/// column per bucket. Empty buckets are linearly interpolated between neighbours,
/// leading gaps take the first value and trailing gaps the last one.
pub fn resample(table: &Table, frequency: Frequency) -> Result<Table, TemporalError> {
    let timestamps = validate_temporal_index(table)?;

    let unsupported = table.text_column_names();
    if !unsupported.is_empty() {
        return Err(TemporalError::UnsupportedResample {
            table: table.name().to_string(),
            columns: unsupported,
        });
    }

    let step = frequency.step_ms();
    if step <= 0 {
        return Err(TemporalError::InvalidFrequency(frequency));
    }

    let (Some(&min_ts), Some(&max_ts)) = (timestamps.iter().min(), timestamps.iter().max())
    else {
        return Ok(table.clone());
    };

    let buckets_needed = (max_ts - min_ts) / step + 1;
    if buckets_needed > MAX_RESAMPLE_BUCKETS {
        return Err(TemporalError::ResampleTooLarge {
            table: table.name().to_string(),
            frequency,
            buckets: buckets_needed,
            max: MAX_RESAMPLE_BUCKETS,
        });
    }
    let bucket_count = buckets_needed as usize;
    let buckets: Vec<usize> = timestamps
        .iter()
        .map(|ts| ((ts - min_ts) / step) as usize)
        .collect();
    let labels: Vec<Option<i64>> = (0..bucket_count)
        .map(|k| Some(min_ts + k as i64 * step))
        .collect();

    let mut out = Table::temporal(table.name(), labels);
    for column in table.columns() {
        let ColumnData::Numeric(values) = &column.data else {
            continue;
        };
        let mut sums = vec![0.0; bucket_count];
        let mut counts = vec![0usize; bucket_count];
        for (row, value) in values.iter().enumerate() {
            if let Some(v) = value.filter(|v| !v.is_nan()) {
                sums[buckets[row]] += v;
                counts[buckets[row]] += 1;
            }
        }
        let mut means: Vec<Option<f64>> = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| (*count > 0).then(|| sum / *count as f64))
            .collect();
        fill_gaps(&mut means);

        out.push_column(Column {
            name: column.name.clone(),
            data: ColumnData::Numeric(means),
        })
        .expect("resampled columns share the bucket grid");
    }

    info!(
        component = "temporal",
        event = "temporal.resample",
        table = table.name(),
        frequency = ?frequency,
        input_rows = table.len(),
        output_rows = out.len()
    );

    Ok(out)
}

/// Intersection of the covered periods of all non-empty tables.
pub fn verify_temporal_overlap(tables: &[&Table]) -> Result<TimeRange, TemporalError> {
    let mut latest_start: Option<i64> = None;
    let mut earliest_end: Option<i64> = None;

    for table in tables {
        let timestamps = validate_temporal_index(table)?;
        let (Some(&start), Some(&end)) = (timestamps.iter().min(), timestamps.iter().max())
        else {
            continue;
        };
        latest_start = Some(latest_start.map_or(start, |current| current.max(start)));
        earliest_end = Some(earliest_end.map_or(end, |current| current.min(end)));
    }

    let (Some(start), Some(end)) = (latest_start, earliest_end) else {
        return Err(TemporalError::EmptyOverlapInput);
    };
    if start > end {
        return Err(TemporalError::NoTemporalOverlap {
            latest_start_ts_ms_utc: start,
            earliest_end_ts_ms_utc: end,
        });
    }

    Ok(TimeRange {
        start_ts_ms_utc: start,
        end_ts_ms_utc: end,
    })
}

fn fill_gaps(values: &mut [Option<f64>]) {
    let known: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_some())
        .map(|(idx, _)| idx)
        .collect();
    let (Some(&first), Some(&last)) = (known.first(), known.last()) else {
        return;
    };

    let head = values[first];
    let tail = values[last];
    for value in &mut values[..first] {
        *value = head;
    }
    for value in &mut values[last + 1..] {
        *value = tail;
    }

    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a < 2 {
            continue;
        }
        let (Some(va), Some(vb)) = (values[a], values[b]) else {
            continue;
        };
        for idx in a + 1..b {
            let t = (idx - a) as f64 / (b - a) as f64;
            values[idx] = Some(va + (vb - va) * t);
        }
    }
}
