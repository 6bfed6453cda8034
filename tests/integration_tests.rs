/// End-to-end tests: raw telemetry tables -> per-lap features -> karma stream.
///
/// Run with: cargo test --test integration_tests -- --nocapture
use std::collections::BTreeSet;

use mechanical_karma::pivot::pivot_signals;
use mechanical_karma::{
    build_per_lap_dataset, compute_stream, Component, ComponentSpec, KarmaParams, PipelineConfig,
    PipelineInputs, Table,
};
use serde_json::{json, Value};

fn table(v: Value) -> Table {
    serde_json::from_value(v).expect("valid records")
}

/// Two cars, three laps each, long-format telemetry sampled every 10s with
/// out-lap and pit-lane samples that fall outside any lap window.
fn race() -> PipelineInputs {
    let mut telemetry = Vec::new();
    for (car, number, base_speed) in [("GR86-002", 2, 120.0), ("GR86-013", 13, 140.0)] {
        for s in 0..40 {
            let t = 90 + s * 10;
            let lap_factor = (t / 100) as f64;
            for (name, value) in [
                ("speed", base_speed + lap_factor * 5.0 + (s % 3) as f64),
                ("nmot", 6000.0 + lap_factor * 200.0),
                ("gear", 3.0 + (s % 2) as f64),
                ("accx_can", 0.1 * (s % 4) as f64),
                ("pbrake_f", 20.0 + (s % 5) as f64 * 10.0),
                ("pbrake_r", 15.0 + (s % 5) as f64 * 5.0),
                ("Steering_Angle", -30.0 + (s % 6) as f64 * 12.0),
            ] {
                telemetry.push(json!({
                    "vehicle_id": car,
                    "vehicle_number": number,
                    "timestamp": format!("2025-04-26T18:{:02}:{:02}Z", t / 60, t % 60),
                    "telemetry_name": name,
                    "telemetry_value": value,
                }));
            }
        }
    }

    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for car in ["GR86-002", "GR86-013"] {
        for lap in 1..=3 {
            let start = 100 * lap;
            starts.push(json!({"vehicle_id": car, "lap": lap, "value": format!("2025-04-26 18:{:02}:{:02}", start / 60, start % 60)}));
            let end = start + 95;
            ends.push(json!({"vehicle_id": car, "lap": lap, "value": format!("2025-04-26 18:{:02}:{:02}", end / 60, end % 60)}));
        }
    }
    // Duplicate emission of a start event, later than the real one.
    starts.push(json!({"vehicle_id": "GR86-002", "lap": 2, "value": "2025-04-26 18:03:30"}));

    PipelineInputs {
        telemetry: table(Value::Array(telemetry)),
        lap_start: Some(table(Value::Array(starts))),
        lap_end: Some(table(Value::Array(ends))),
        results: Some(table(json!([
            {"NUMBER": 2, "STATUS": "Classified"},
            {"NUMBER": 13, "STATUS": "DNF"}
        ]))),
    }
}

#[test]
fn test_per_lap_dataset_from_long_telemetry() {
    println!("\n=== Test: Per-Lap Dataset ===");
    let out = build_per_lap_dataset(&race(), &PipelineConfig::default()).expect("pipeline runs");

    let keys: BTreeSet<(String, i64)> = out.per_lap.iter().map(|r| (r.vehicle_id.clone(), r.lap)).collect();
    assert_eq!(keys.len(), 6);
    assert_eq!(out.per_lap.len(), 6);

    // Samples at t in [100, 195], [200, 295], [300, 395] on a 10s grid: 10 per lap.
    for row in &out.per_lap {
        assert_eq!(row.samples_per_lap, 10, "{} lap {}", row.vehicle_id, row.lap);
        assert_eq!(row.lap_duration_s, Some(95.0));
        assert!(row.feature("speed_mean").is_some());
        assert!(row.feature("accx_can_std").is_some());
    }
    // 40 timestamps per car, 30 inside windows.
    assert_eq!(out.diagnostics.samples_kept, 2 * 30 * 7);
    assert_eq!(out.diagnostics.samples_dropped, 2 * 10 * 7);
    assert_eq!(out.diagnostics.lap_windows, 6);
    assert_eq!(out.diagnostics.pivot_rows_skipped, 0);
    assert_eq!(out.diagnostics.aggregate_rows_skipped, 0);
    println!("✓ diagnostics: {:?}", out.diagnostics);

    let dnf: Vec<(String, Option<u8>)> = out
        .per_lap
        .iter()
        .map(|r| (r.vehicle_id.clone(), r.dnf_flag))
        .collect();
    assert!(dnf.iter().all(|(v, f)| *f == Some(u8::from(v == "GR86-013"))));
    println!("✓ DNF labels merged");
}

#[test]
fn test_intermediate_table_is_wide_and_stable_under_pivot() {
    let cfg = PipelineConfig::default();
    let out = build_per_lap_dataset(&race(), &cfg).unwrap();
    let wide = out.telemetry_with_laps;

    assert!(wide.has_column("speed") && wide.has_column("nmot"));
    assert!(!wide.has_column("telemetry_name"));
    assert!(wide.has_column("lap_start_time"));

    let again = pivot_signals(
        wide.clone(),
        &cfg.vehicle_column,
        &cfg.time_column,
        &cfg.signal_name_column,
        &cfg.signal_value_column,
    );
    assert_eq!(again.table, wide);
    assert_eq!(again.skipped_rows, 0);
}

#[test]
fn test_karma_stream_from_pipeline_output() {
    println!("\n=== Test: Karma Stream ===");
    let out = build_per_lap_dataset(&race(), &PipelineConfig::default()).unwrap();
    let specs = mechanical_karma::karma::default_component_specs();
    let records = compute_stream(&out.per_lap, &specs, &KarmaParams::default()).expect("karma runs");

    assert_eq!(records.len(), 6 * 4);
    for r in &records {
        assert!((0.0..=1.0).contains(&r.instant_score));
        assert!((0.0..=1.0).contains(&r.karma_score));
    }

    let components: BTreeSet<Component> = records.iter().map(|r| r.component).collect();
    assert_eq!(components.len(), 4);

    // Faster car carries more engine stress on every lap.
    for lap in 1..=3 {
        let engine = |car: &str| {
            records
                .iter()
                .find(|r| r.vehicle_id == car && r.lap == lap && r.component == Component::Engine)
                .map(|r| r.instant_score)
                .unwrap()
        };
        assert!(engine("GR86-013") > engine("GR86-002"));
    }

    let json = serde_json::to_value(&records[0]).unwrap();
    assert_eq!(json["component"], "engine");
    println!("✓ {} records, first: {}", records.len(), json);
}

#[test]
fn test_karma_scenario_single_feature_engine() {
    let rows: Vec<mechanical_karma::LapFeatureRow> = serde_json::from_value(json!([
        {"vehicle_id": "V1", "lap": 1, "speed_mean": 100.0, "samples_per_lap": 50},
        {"vehicle_id": "V2", "lap": 1, "speed_mean": 80.0, "samples_per_lap": 50},
        {"vehicle_id": "V3", "lap": 1, "speed_mean": 120.0, "samples_per_lap": 50}
    ]))
    .unwrap();
    let specs = vec![ComponentSpec::new(Component::Engine, &[("speed_mean", 1.0)], "")];
    let params = KarmaParams {
        smoothing: 0.6,
        wear_rate: 0.002,
    };

    let records = compute_stream(&rows, &specs, &params).unwrap();
    let v1 = records.iter().find(|r| r.vehicle_id == "V1").unwrap();
    let instant = 0.5;
    assert!((v1.instant_score - instant).abs() < 1e-12);
    let expected = instant + f64::min(0.5, 0.002 * 1.0) * (1.0 + 0.5 * instant);
    assert!((v1.karma_score - expected).abs() < 1e-12);
}
