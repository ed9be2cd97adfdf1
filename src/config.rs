//! Pipeline configuration read from `AGRIFUSION_*` environment variables.

use std::env;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::fusion::{DegeneratePolicy, FusionConfig};
use crate::risk::RiskConfig;
use crate::stress::StressConfig;
use crate::temporal::Frequency;

pub const DATA_DIR_ENV: &str = "AGRIFUSION_DATA_DIR";
pub const ASOF_TOLERANCE_ENV: &str = "AGRIFUSION_ASOF_TOLERANCE_MS";
pub const WEATHER_FREQUENCY_ENV: &str = "AGRIFUSION_WEATHER_FREQUENCY";
pub const DEGENERATE_POLICY_ENV: &str = "AGRIFUSION_DEGENERATE_POLICY";
pub const PARCEL_ENV: &str = "AGRIFUSION_PARCEL";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Restricts preparation to one parcel when set.
    pub parcel: Option<String>,
    pub fusion: FusionConfig,
    pub risk: RiskConfig,
    pub stress: StressConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            parcel: None,
            fusion: FusionConfig::default(),
            risk: RiskConfig::default(),
            stress: StressConfig::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}='{value}' is invalid, expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Unset or blank variables keep their defaults; malformed values are rejected.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(dir) = env_trimmed(DATA_DIR_ENV) {
        config.data_dir = PathBuf::from(dir);
    }
    config.parcel = env_trimmed(PARCEL_ENV);

    if let Some(raw) = env_trimmed(ASOF_TOLERANCE_ENV) {
        config.fusion.asof_tolerance_ms = raw
            .parse::<i64>()
            .ok()
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| invalid(ASOF_TOLERANCE_ENV, &raw, "a non-negative integer"))?;
    }

    if let Some(raw) = env_trimmed(WEATHER_FREQUENCY_ENV) {
        config.fusion.weather_frequency = match raw.to_ascii_lowercase().as_str() {
            "none" | "off" => None,
            other => Some(Frequency::parse(other).ok_or_else(|| {
                invalid(WEATHER_FREQUENCY_ENV, &raw, "none, hourly, daily or <n>min")
            })?),
        };
    }

    if let Some(raw) = env_trimmed(DEGENERATE_POLICY_ENV) {
        config.fusion.degenerate_policy = match raw.to_ascii_lowercase().as_str() {
            "strict" => DegeneratePolicy::Strict,
            "drop" | "drop_and_report" => DegeneratePolicy::DropAndReport,
            _ => return Err(invalid(DEGENERATE_POLICY_ENV, &raw, "strict or drop")),
        };
    }

    Ok(config)
}

pub(crate) fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(key: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        expected,
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Runs `f` with the given variables set (or removed), restoring them afterwards.
    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(&key, v),
                None => env::remove_var(&key),
            }
        }

        output
    }
}
