use agrifusion::{
    assert_schema_compatible, compute_risk, list_parcels, logistic, summarize_stress,
    DegeneratePolicy, FeatureTable, Frequency, FusionConfig, FusionEngine, FusionError,
    InMemorySources, RiskConfig, RiskError, ScaleError, SeverityLevel, SourceKind, SourceLoader,
    SourceTables, StressConfig, StressType, Table, UnitConversion, FEATURE_SCHEMA_VERSION,
    PARCEL_ID_COLUMN,
};

const T0: i64 = 1_717_200_000_000; // 2024-06-01T00:00:00Z
const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

struct Obs {
    ts: i64,
    parcel: &'static str,
    ndvi: Option<f64>,
    lai: f64,
    biomasse: f64,
    stress: f64,
    rendement_estime: f64,
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "actual={actual} expected={expected}"
    );
}

fn observations() -> Vec<Obs> {
    let obs = |ts, parcel, ndvi, lai, biomasse, stress, rendement_estime| Obs {
        ts,
        parcel,
        ndvi,
        lai,
        biomasse,
        stress,
        rendement_estime,
    };
    // Deliberately out of time order.
    vec![
        obs(T0 + 8 * HOUR + 40 * MINUTE, "P3", Some(0.42), 1.2, 2.0, 0.5, 10.0),
        obs(T0 + DAY + 7 * HOUR + 40 * MINUTE, "P1", Some(0.63), 2.3, 3.4, 0.02, 8.5),
        obs(T0 + 7 * HOUR + 40 * MINUTE, "P1", Some(0.61), 2.1, 3.2, 0.02, 9.0),
        obs(T0 + DAY + 8 * HOUR + 10 * MINUTE, "P2", None, 1.7, 2.8, 0.07, 7.0),
        obs(T0 + 8 * HOUR + 10 * MINUTE, "P2", Some(0.55), 1.8, 2.9, 0.07, 6.5),
        obs(T0 + DAY + 8 * HOUR + 40 * MINUTE, "P3", Some(0.40), 1.1, 1.9, 0.5, 12.0),
    ]
}

fn monitoring() -> Table {
    let rows = observations();
    Table::temporal("monitoring", rows.iter().map(|r| Some(r.ts)).collect())
        .with_text(PARCEL_ID_COLUMN, rows.iter().map(|r| Some(r.parcel)).collect())
        .unwrap()
        .with_numeric("NDVI", rows.iter().map(|r| r.ndvi).collect())
        .unwrap()
        .with_numeric("LAI", rows.iter().map(|r| Some(r.lai)).collect())
        .unwrap()
        .with_numeric("biomasse", rows.iter().map(|r| Some(r.biomasse)).collect())
        .unwrap()
        .with_numeric("stress_hydrique", rows.iter().map(|r| Some(r.stress)).collect())
        .unwrap()
        .with_numeric(
            "rendement_estime",
            rows.iter().map(|r| Some(r.rendement_estime)).collect(),
        )
        .unwrap()
}

/// Kelvin readings; the last one is more than an hour before any day-two observation.
fn weather() -> Table {
    Table::temporal(
        "weather",
        vec![
            Some(T0 + 7 * HOUR + 30 * MINUTE),
            Some(T0 + 8 * HOUR),
            Some(T0 + 8 * HOUR + 30 * MINUTE),
            Some(T0 + DAY + 5 * HOUR),
        ],
    )
    .with_numeric(
        "temperature",
        vec![Some(288.15), Some(293.15), Some(308.15), Some(290.15)],
    )
    .unwrap()
    .with_numeric("humidity", vec![Some(60.0), Some(70.0), Some(80.0), Some(65.0)])
    .unwrap()
}

fn soil(ph: [f64; 2]) -> Table {
    Table::positional("soil", 2)
        .with_text(PARCEL_ID_COLUMN, vec![Some("P1"), Some("P2")])
        .unwrap()
        .with_text("type_sol", vec![Some("limon"), Some("argile")])
        .unwrap()
        .with_numeric("ph", vec![Some(ph[0]), Some(ph[1])])
        .unwrap()
        .with_numeric("matiere_organique", vec![Some(2.1), Some(3.4)])
        .unwrap()
}

fn yield_history(parcels: &[(&str, Vec<f64>)]) -> Table {
    let mut ids = Vec::new();
    let mut values = Vec::new();
    for (parcel, yields) in parcels {
        for y in yields {
            ids.push(Some(*parcel));
            values.push(Some(*y));
        }
    }
    let index = (0..ids.len() as i64).map(|year| Some(T0 - year * 365 * DAY)).collect();
    Table::temporal("yield_history", index)
        .with_text(PARCEL_ID_COLUMN, ids)
        .unwrap()
        .with_numeric("rendement", values)
        .unwrap()
}

fn full_history() -> Table {
    yield_history(&[
        ("P1", vec![6.0, 8.0, 10.0]),
        ("P2", vec![5.0, 7.0]),
        ("P3", vec![9.0, 11.0, 13.0]),
    ])
}

fn engine(cfg: FusionConfig) -> FusionEngine {
    FusionEngine::new(cfg)
        .with_monitoring(monitoring())
        .with_weather(weather())
        .with_soil(soil([6.5, 7.2]))
}

fn prepared() -> FeatureTable {
    engine(FusionConfig::default())
        .prepare_features(&monitoring())
        .unwrap()
}

fn timestamps(table: &Table) -> Vec<i64> {
    agrifusion::validate_temporal_index(table).unwrap()
}

#[test]
fn output_keeps_one_row_per_observation_in_time_order() {
    let features = prepared();

    assert_eq!(features.len(), 6);
    assert_eq!(features.report.input_rows, 6);
    assert_eq!(features.report.output_rows, 6);

    let ts = timestamps(&features.table);
    assert!(ts.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(
        features.table.text(PARCEL_ID_COLUMN).unwrap(),
        &[
            Some("P1".to_string()),
            Some("P2".to_string()),
            Some("P3".to_string()),
            Some("P1".to_string()),
            Some("P2".to_string()),
            Some("P3".to_string()),
        ]
    );
}

#[test]
fn weather_is_attached_from_latest_prior_reading_within_an_hour() {
    let features = prepared();
    assert_eq!(features.report.weather_matched_rows, 3);
    assert!(matches!(
        features.report.unit_conversions[0].conversion,
        UnitConversion::Applied { .. }
    ));

    let temperature = features.raw_numeric("temperature").unwrap();
    assert_close(temperature[0].unwrap(), 15.0);
    assert_close(temperature[1].unwrap(), 20.0);
    assert_close(temperature[2].unwrap(), 35.0);
    // Day-two rows have no reading within tolerance: null, never dropped.
    assert_eq!(&temperature[3..], &[None::<f64>; 3]);
    assert_eq!(&features.table.numeric("humidity").unwrap()[3..], &[None::<f64>; 3]);
}

#[test]
fn soil_join_is_left_preserving() {
    let features = prepared();
    assert_eq!(features.report.soil_matched_rows, 4);

    let ph = features.raw_numeric("ph").unwrap();
    assert_close(ph[0].unwrap(), 6.5);
    assert_close(ph[1].unwrap(), 7.2);
    assert_eq!(ph[2], None);
    assert_eq!(ph[5], None);
    assert_eq!(
        features.table.text("type_sol").unwrap()[2],
        None,
        "P3 has no soil record"
    );
    assert!(!features.table.has_column("parcelle_id_soil"));
}

#[test]
fn monitoring_gaps_are_imputed_before_scaling() {
    let features = prepared();
    assert_eq!(features.report.imputed_values, 1);

    // Median of 0.42, 0.63, 0.61, 0.55, 0.40.
    let ndvi = features.raw_numeric("NDVI").unwrap();
    assert_close(ndvi[4].unwrap(), 0.55);
}

#[test]
fn every_scaled_column_has_zero_mean_and_unit_std() {
    let features = prepared();
    assert!(features.report.dropped_columns.is_empty());

    for column in features.table.numeric_column_names() {
        assert!(features.scaler.is_scaled(&column), "{column} not scaled");
        let values: Vec<f64> = features
            .table
            .numeric(&column)
            .unwrap()
            .iter()
            .flatten()
            .copied()
            .collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!(mean.abs() < 1e-9, "{column} mean={mean}");
        assert!((std - 1.0).abs() < 1e-9, "{column} std={std}");
    }
}

#[test]
fn inputs_are_not_mutated() {
    let subset = monitoring();
    let engine = engine(FusionConfig::default());
    engine.prepare_features(&subset).unwrap();

    assert_eq!(subset, monitoring());
    assert_eq!(engine.monitoring(), Some(&monitoring()));
}

#[test]
fn soil_without_join_key_is_a_hard_error() {
    let keyless = Table::positional("soil", 1)
        .with_numeric("ph", vec![Some(6.8)])
        .unwrap();
    let engine = FusionEngine::new(FusionConfig::default())
        .with_monitoring(monitoring())
        .with_weather(weather())
        .with_soil(keyless);

    let err = engine.prepare_features(&monitoring()).unwrap_err();
    match err.cause() {
        FusionError::MissingJoinKey { table, key } => {
            assert_eq!(table, "soil");
            assert_eq!(key, PARCEL_ID_COLUMN);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn missing_or_empty_sources_are_named() {
    let no_soil = FusionEngine::new(FusionConfig::default())
        .with_monitoring(monitoring())
        .with_weather(weather());
    let err = no_soil.prepare_features(&monitoring()).unwrap_err();
    assert!(matches!(
        err.cause(),
        FusionError::InsufficientData {
            missing: SourceKind::Soil
        }
    ));

    let empty_subset = monitoring().take_rows(&[]);
    let err = engine(FusionConfig::default())
        .prepare_features(&empty_subset)
        .unwrap_err();
    assert!(matches!(
        err.cause(),
        FusionError::InsufficientData {
            missing: SourceKind::Monitoring
        }
    ));
}

#[test]
fn degenerate_columns_fail_strict_and_are_dropped_on_request() {
    let constant_ph = |cfg| {
        FusionEngine::new(cfg)
            .with_monitoring(monitoring())
            .with_weather(weather())
            .with_soil(soil([6.5, 6.5]))
    };

    let err = constant_ph(FusionConfig::default())
        .prepare_features(&monitoring())
        .unwrap_err();
    match err.cause() {
        FusionError::Scale(ScaleError::DegenerateColumn { columns }) => {
            assert_eq!(columns, &vec!["ph".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let cfg = FusionConfig {
        degenerate_policy: DegeneratePolicy::DropAndReport,
        ..FusionConfig::default()
    };
    let features = constant_ph(cfg).prepare_features(&monitoring()).unwrap();
    assert_eq!(features.report.dropped_columns, vec!["ph".to_string()]);
    assert!(!features.table.has_column("ph"));
    assert!(features.schema.columns.iter().all(|c| c.name != "ph"));
    assert_eq!(features.len(), 6);
}

#[test]
fn weather_outside_tolerance_leaves_null_unscaled_columns() {
    let stale_weather = Table::temporal(
        "weather",
        vec![Some(T0 - 10 * DAY), Some(T0 - 10 * DAY + HOUR)],
    )
    .with_numeric("temperature", vec![Some(288.15), Some(290.15)])
    .unwrap()
    .with_numeric("humidity", vec![Some(60.0), Some(62.0)])
    .unwrap();
    let engine = FusionEngine::new(FusionConfig::default())
        .with_monitoring(monitoring())
        .with_weather(stale_weather)
        .with_soil(soil([6.5, 7.2]));

    let features = engine.prepare_features(&monitoring()).unwrap();

    assert_eq!(features.len(), 6);
    assert_eq!(features.report.weather_matched_rows, 0);
    assert_eq!(
        features.report.null_columns,
        vec!["temperature".to_string(), "humidity".to_string()]
    );
    assert!(features.report.dropped_columns.is_empty());
    for column in ["temperature", "humidity"] {
        assert!(features
            .table
            .numeric(column)
            .unwrap()
            .iter()
            .all(Option::is_none));
        let schema_column = features
            .schema
            .columns
            .iter()
            .find(|c| c.name == column)
            .unwrap();
        assert!(!schema_column.scaled, "{column}");
    }
    assert!(features.scaler.is_scaled("NDVI"));
}

#[test]
fn fused_table_without_numeric_columns_is_rejected() {
    let monitoring = Table::temporal("monitoring", vec![Some(T0), Some(T0 + HOUR)])
        .with_text(PARCEL_ID_COLUMN, vec![Some("P1"), Some("P2")])
        .unwrap();
    let weather = Table::temporal("weather", vec![Some(T0)]);
    let soil = Table::positional("soil", 2)
        .with_text(PARCEL_ID_COLUMN, vec![Some("P1"), Some("P2")])
        .unwrap()
        .with_text("type_sol", vec![Some("limon"), Some("argile")])
        .unwrap();

    let err = FusionEngine::new(FusionConfig::default())
        .with_monitoring(monitoring.clone())
        .with_weather(weather)
        .with_soil(soil)
        .prepare_features(&monitoring)
        .unwrap_err();
    assert!(matches!(err.cause(), FusionError::NoNumericFeatures));
}

#[test]
fn dropping_every_degenerate_column_leaves_no_features() {
    let monitoring = Table::temporal("monitoring", vec![Some(T0), Some(T0 + HOUR)])
        .with_text(PARCEL_ID_COLUMN, vec![Some("P1"), Some("P2")])
        .unwrap()
        .with_numeric("NDVI", vec![Some(0.5), Some(0.5)])
        .unwrap();
    let weather = Table::temporal("weather", vec![Some(T0), Some(T0 + HOUR)])
        .with_numeric("temperature", vec![Some(20.0), Some(20.0)])
        .unwrap();
    let soil = Table::positional("soil", 2)
        .with_text(PARCEL_ID_COLUMN, vec![Some("P1"), Some("P2")])
        .unwrap()
        .with_numeric("ph", vec![Some(6.5), Some(6.5)])
        .unwrap();
    let cfg = FusionConfig {
        degenerate_policy: DegeneratePolicy::DropAndReport,
        ..FusionConfig::default()
    };

    let err = FusionEngine::new(cfg)
        .with_monitoring(monitoring.clone())
        .with_weather(weather)
        .with_soil(soil)
        .prepare_features(&monitoring)
        .unwrap_err();
    assert!(matches!(err.cause(), FusionError::NoNumericFeatures));
}

#[test]
fn hourly_weather_resampling_keeps_row_parity() {
    let cfg = FusionConfig {
        weather_frequency: Some(Frequency::Hourly),
        ..FusionConfig::default()
    };
    let features = engine(cfg).prepare_features(&monitoring()).unwrap();
    assert_eq!(features.len(), 6);
    assert_eq!(features.report.weather_matched_rows, 3);
}

#[test]
fn schema_fingerprint_is_stable_across_calls() {
    let first = prepared();
    let second = prepared();
    assert_eq!(first.schema, second.schema);
    assert_eq!(first.report.input_fingerprint, second.report.input_fingerprint);
    assert_eq!(first.schema.version, FEATURE_SCHEMA_VERSION);

    assert_schema_compatible(FEATURE_SCHEMA_VERSION, &first.schema.fingerprint, &second.schema)
        .unwrap();
    assert!(matches!(
        assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &first.schema.fingerprint, &second.schema),
        Err(FusionError::SchemaVersionMismatch { .. })
    ));
    assert!(matches!(
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, "deadbeef", &second.schema),
        Err(FusionError::SchemaFingerprintMismatch { .. })
    ));
}

#[test]
fn risk_scores_deviation_from_parcel_history() {
    let features = prepared();
    let risk = compute_risk(&features, &full_history(), &RiskConfig::default()).unwrap();

    assert_eq!(risk.rows.len(), features.len());
    assert_eq!(risk.baselines.len(), 3);
    for row in &risk.rows {
        let score = row.risk_score.unwrap();
        assert!(score > 0.0 && score < 1.0, "score={score}");
    }

    let p1 = &risk.rows[0];
    assert_eq!(p1.parcel_id, "P1");
    assert_close(p1.target_value.unwrap(), 9.0);
    assert_close(p1.deviation_from_mean.unwrap(), 0.5);
    assert_close(p1.risk_score.unwrap(), logistic(0.5));

    let p3 = &risk.rows[2];
    assert_close(p3.deviation_from_mean.unwrap(), -0.5);
    assert!(p3.risk_score.unwrap() < 0.5);
}

#[test]
fn risk_requires_history_for_every_scored_parcel() {
    let features = prepared();
    let partial = yield_history(&[("P1", vec![6.0, 8.0, 10.0]), ("P2", vec![5.0, 7.0])]);
    assert_eq!(
        compute_risk(&features, &partial, &RiskConfig::default()).unwrap_err(),
        RiskError::NoHistoricalData {
            parcel_id: "P3".to_string()
        }
    );

    let single = yield_history(&[("P1", vec![6.0, 8.0]), ("P2", vec![5.0, 7.0]), ("P3", vec![9.0])]);
    assert!(matches!(
        compute_risk(&features, &single, &RiskConfig::default()).unwrap_err(),
        RiskError::DegenerateHistory { count: 1, .. }
    ));
}

#[test]
fn stress_levels_and_types_are_counted() {
    let summary = summarize_stress(&prepared(), &StressConfig::default()).unwrap();

    assert_eq!(summary.unbucketed, 0);
    assert_eq!(summary.total(), 6);
    assert_eq!(summary.count(SeverityLevel::Low, StressType::WaterDriven), 2);
    assert_eq!(summary.count(SeverityLevel::Moderate, StressType::WaterDriven), 2);
    assert_eq!(summary.count(SeverityLevel::High, StressType::WeatherDriven), 1);
    assert_eq!(summary.count(SeverityLevel::High, StressType::WaterDriven), 1);
    assert_eq!(summary.count(SeverityLevel::Low, StressType::WeatherDriven), 0);
}

#[test]
fn parcels_are_prepared_independently() {
    let cfg = FusionConfig {
        degenerate_policy: DegeneratePolicy::DropAndReport,
        ..FusionConfig::default()
    };
    let results = engine(cfg).prepare_features_by_parcel(&monitoring()).unwrap();

    let ids: Vec<&str> = results.iter().map(|r| r.parcel_id.as_str()).collect();
    assert_eq!(ids, vec!["P1", "P2", "P3"]);
    for parcel in &results {
        let features = parcel.result.as_ref().unwrap();
        assert_eq!(features.len(), 2, "{}", parcel.parcel_id);
        // Stress is constant within a parcel.
        assert!(features
            .report
            .dropped_columns
            .contains(&"stress_hydrique".to_string()));
    }

    // Under the default strict policy each parcel falls back to dropping.
    let strict = engine(FusionConfig::default())
        .prepare_features_by_parcel(&monitoring())
        .unwrap();
    for parcel in &strict {
        let features = parcel.result.as_ref().unwrap();
        assert_eq!(features.len(), 2, "{}", parcel.parcel_id);
        assert!(!features.table.has_column("stress_hydrique"));
    }

    // P3 has no soil row: its soil columns come back null instead of dropped.
    let p3 = strict[2].result.as_ref().unwrap();
    assert!(p3.report.null_columns.contains(&"ph".to_string()));
    assert!(p3.table.numeric("ph").unwrap().iter().all(Option::is_none));
}

#[test]
fn in_memory_sources_feed_the_engine() {
    let tables = SourceTables {
        monitoring: monitoring(),
        weather: weather(),
        soil: soil([6.5, 7.2]),
        yield_history: full_history(),
    };
    let loaded = InMemorySources::new(tables).load_sources().unwrap();
    assert_eq!(list_parcels(&loaded.monitoring).unwrap(), vec!["P1", "P2", "P3"]);

    let engine = FusionEngine::from_sources(&loaded, FusionConfig::default());
    let subset = loaded
        .monitoring
        .filter_text_eq(PARCEL_ID_COLUMN, "P1")
        .unwrap();
    let err = engine.prepare_features(&subset).unwrap_err();
    // A single parcel over two days has constant stress.
    assert!(matches!(
        err.cause(),
        FusionError::Scale(ScaleError::DegenerateColumn { .. })
    ));

    let features = engine.prepare_parcel_features(&subset).unwrap();
    assert_eq!(features.len(), 2);
    assert!(features
        .report
        .dropped_columns
        .contains(&"stress_hydrique".to_string()));
}
