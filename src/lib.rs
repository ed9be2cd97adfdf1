//! Agricultural data fusion core.
//!
//! Loads crop monitoring, weather, soil and yield-history tables, fuses them into one
//! time-aligned, standardized feature table per call, and derives yield-risk scores and
//! water-stress summaries from it.
//!
//! - `table`: typed in-memory tables with a timestamp or positional index
//! - `temporal`: index validation, stable time ordering, resampling
//! - `units`, `impute`, `scaler`: per-call column transforms
//! - `fusion`: asof weather join, soil key join, feature preparation
//! - `risk`, `stress`: consumers of a prepared feature table
//! - `sources`, `config`, `observability`: loading, env configuration, logging

mod config;
mod fusion;
mod impute;
mod observability;
mod risk;
mod scaler;
mod sources;
mod stress;
mod table;
mod temporal;
mod units;

pub use config::{
    pipeline_config_from_env, ConfigError, PipelineConfig, ASOF_TOLERANCE_ENV, DATA_DIR_ENV,
    DEGENERATE_POLICY_ENV, PARCEL_ENV, WEATHER_FREQUENCY_ENV,
};
pub use fusion::{
    assert_schema_compatible, AppliedConversion, DegeneratePolicy, FeatureColumn,
    FeaturePreparationError, FeatureSchema, FeatureTable, FusionConfig, FusionEngine,
    FusionError, ParcelFeatures, PreparationReport, DEFAULT_ASOF_TOLERANCE_MS,
    FEATURE_SCHEMA_VERSION,
};
pub use impute::{impute_median, ImputeError, ImputerStats, MedianImputer};
pub use observability::{
    init_logging, log_app_start, log_sources_loaded, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError, LOG_FORMAT_ENV, LOG_LEVEL_ENV, LOG_TARGET_ENV,
};
pub use risk::{
    compute_risk, enrich_with_yield_history, fit_yield_baselines, logistic, ParcelYieldStats,
    RiskConfig, RiskError, RiskRow, RiskTable,
};
pub use scaler::{ColumnMoments, ScaleError, ScalerStats, StandardScaler};
pub use sources::{
    parse_timestamp_ms, read_csv_table, validate_sources, CsvDirectoryLoader, InMemorySources,
    SourceError, SourceKind, SourceLoader, SourceTables, DATE_COLUMN, MONITORING_SCHEMA,
    SOIL_SCHEMA, WEATHER_SCHEMA, YIELD_HISTORY_SCHEMA,
};
pub use stress::{
    summarize_stress, SeverityLevel, StressCell, StressConfig, StressError, StressSummary,
    StressType,
};
pub use table::{
    list_parcels, Column, ColumnData, ColumnKind, ColumnSpec, RowIndex, Table, TableError,
    PARCEL_ID_COLUMN,
};
pub use temporal::{
    resample, sort_by_time, validate_temporal_index, verify_temporal_overlap, Frequency,
    TemporalError, TimeRange, MAX_RESAMPLE_BUCKETS,
};
pub use units::{apply_unit_rule, UnitConversion, UnitError, UnitRule, KELVIN_TO_CELSIUS};
