use agrifusion::{
    compute_risk, init_logging, list_parcels, log_app_start, logging_config_from_env,
    pipeline_config_from_env, summarize_stress, verify_temporal_overlap, CsvDirectoryLoader,
    FeatureSchema, FusionEngine, PipelineConfig, PreparationReport, RiskTable, SourceLoader,
    StressCell, TimeRange, PARCEL_ID_COLUMN,
};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct FusionReport<'a> {
    config: &'a PipelineConfig,
    parcels: Vec<String>,
    monitoring_weather_overlap: Option<TimeRange>,
    schema: FeatureSchema,
    preparation: PreparationReport,
    risk: Option<RiskTable>,
    stress: Option<StressReport>,
    warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StressReport {
    cells: Vec<StressCell>,
    unbucketed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging);

    let cfg = pipeline_config_from_env()?;
    let sources = CsvDirectoryLoader::new(&cfg.data_dir).load_sources()?;
    let parcels = list_parcels(&sources.monitoring)?;
    let mut warnings = Vec::new();

    let overlap = match verify_temporal_overlap(&[&sources.monitoring, &sources.weather]) {
        Ok(range) => Some(range),
        Err(err) => {
            warn!(
                component = "fusion_report",
                event = "report.overlap.missing",
                error = %err
            );
            warnings.push(err.to_string());
            None
        }
    };

    let engine = FusionEngine::from_sources(&sources, cfg.fusion.clone());
    let features = match cfg.parcel.as_deref() {
        Some(parcel) => {
            let subset = sources
                .monitoring
                .filter_text_eq(PARCEL_ID_COLUMN, parcel)?;
            engine.prepare_parcel_features(&subset)?
        }
        None => engine.prepare_features(&sources.monitoring)?,
    };
    if !features.report.dropped_columns.is_empty() {
        warnings.push(format!(
            "dropped degenerate columns: {:?}",
            features.report.dropped_columns
        ));
    }

    // Risk and stress are optional outputs: the source data may lack their columns.
    let risk = match compute_risk(&features, &sources.yield_history, &cfg.risk) {
        Ok(risk) => Some(risk),
        Err(err) => {
            warnings.push(format!("risk: {err}"));
            None
        }
    };
    let stress = match summarize_stress(&features, &cfg.stress) {
        Ok(summary) => Some(StressReport {
            cells: summary.cells(),
            unbucketed: summary.unbucketed,
        }),
        Err(err) => {
            warnings.push(format!("stress: {err}"));
            None
        }
    };

    let report = FusionReport {
        config: &cfg,
        parcels,
        monitoring_weather_overlap: overlap,
        schema: features.schema,
        preparation: features.report,
        risk,
        stress,
        warnings,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
