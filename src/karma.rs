//! Per-component risk ("karma") scoring over a per-lap feature table.
//!
//! Each lap produces an instant stress score per component from globally
//! normalized features. The karma score adds exponential smoothing over the
//! vehicle's previous laps and a capped wear term that grows with laps driven.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::KarmaParams;
use crate::error::{KarmaError, Result};
use crate::types::{Component, ComponentScoreRecord, LapFeatureRow};

/// Wear saturates here regardless of distance driven.
pub const WEAR_CAP: f64 = 0.5;
/// Share by which full instant stress amplifies wear accrual.
pub const STRESS_WEAR_GAIN: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub component: Component,
    pub feature_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub description: String,
}

impl ComponentSpec {
    pub fn new(component: Component, weights: &[(&str, f64)], description: &str) -> Self {
        Self {
            component,
            feature_weights: weights.iter().map(|(f, w)| (f.to_string(), *w)).collect(),
            description: description.to_string(),
        }
    }
}

pub fn default_component_specs() -> Vec<ComponentSpec> {
    vec![
        ComponentSpec::new(
            Component::Engine,
            &[("speed_mean", 0.4), ("nmot_mean", 0.6)],
            "RPM and sustained speed stress",
        ),
        ComponentSpec::new(
            Component::Gearbox,
            &[("gear_mean", 0.5), ("accx_can_std", 0.5)],
            "Gear usage and longitudinal jolts",
        ),
        ComponentSpec::new(
            Component::Brakes,
            &[("pbrake_f_max", 0.6), ("pbrake_r_max", 0.4)],
            "Front/rear brake pressure spikes",
        ),
        ComponentSpec::new(
            Component::Tires,
            &[("speed_mean", 0.3), ("Steering_Angle_std", 0.7)],
            "Cornering and abrasion load",
        ),
    ]
}

/// Global (cross-vehicle) min/max per feature.
#[derive(Debug, Clone, Default)]
pub struct FeatureBounds(HashMap<String, (f64, f64)>);

impl FeatureBounds {
    pub fn compute<'a>(rows: &[LapFeatureRow], features: impl IntoIterator<Item = &'a str>) -> Self {
        let bounds = features
            .into_iter()
            .map(|f| {
                let range = rows
                    .iter()
                    .filter_map(|r| r.feature(f))
                    .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                        None => Some((v, v)),
                        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                    });
                (f.to_string(), range.unwrap_or((0.0, 0.0)))
            })
            .collect();
        FeatureBounds(bounds)
    }

    /// Linear map onto [0, 1], clamped. Flat or unknown features map to 0.
    pub fn normalize(&self, feature: &str, value: f64) -> f64 {
        match self.0.get(feature) {
            Some(&(lo, hi)) if hi > lo => ((value - lo) / (hi - lo)).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Weighted mean of normalized features over the weights whose feature is
/// non-null in `row`. Zero when none qualify.
pub fn instant_score(row: &LapFeatureRow, spec: &ComponentSpec, bounds: &FeatureBounds) -> f64 {
    let (weighted, total) = spec
        .feature_weights
        .iter()
        .filter_map(|(feature, &weight)| row.feature(feature).map(|v| (feature, weight, v)))
        .fold((0.0, 0.0), |(sum, total), (feature, weight, v)| {
            (sum + weight * bounds.normalize(feature, v), total + weight)
        });
    if total > 0.0 {
        weighted / total
    } else {
        0.0
    }
}

/// Running state carried from lap to lap, keyed by vehicle.
#[derive(Debug, Clone, Default)]
pub struct KarmaState {
    smoothed: HashMap<(String, Component), f64>,
    first_lap: HashMap<String, i64>,
}

impl KarmaState {
    /// Scores every component for `row`, which must come after all earlier
    /// laps of the same vehicle.
    pub fn advance(
        &mut self,
        row: &LapFeatureRow,
        specs: &[ComponentSpec],
        bounds: &FeatureBounds,
        params: &KarmaParams,
    ) -> Result<Vec<ComponentScoreRecord>> {
        let first = *self.first_lap.entry(row.vehicle_id.clone()).or_insert(row.lap);
        let relative_lap = row
            .lap
            .checked_sub(first)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(|| {
                KarmaError::validation(
                    "lap numbers out of range",
                    vec![format!("{} laps {}..{}", row.vehicle_id, first, row.lap)],
                )
            })? as f64;
        let base_wear = (params.wear_rate * relative_lap).min(WEAR_CAP);

        Ok(specs
            .iter()
            .map(|spec| {
                let instant = instant_score(row, spec, bounds);
                let key = (row.vehicle_id.clone(), spec.component);
                let prev = self.smoothed.get(&key).copied().unwrap_or(instant);
                let smoothed = params.smoothing * prev + (1.0 - params.smoothing) * instant;
                let total_wear = base_wear * (1.0 + STRESS_WEAR_GAIN * instant);
                let karma = (smoothed + total_wear).min(1.0);
                self.smoothed.insert(key, karma);

                ComponentScoreRecord {
                    vehicle_id: row.vehicle_id.clone(),
                    lap: row.lap,
                    component: spec.component,
                    instant_score: instant,
                    karma_score: karma,
                }
            })
            .collect())
    }
}

fn validate_specs(specs: &[ComponentSpec]) -> Result<()> {
    let bad: Vec<String> = specs
        .iter()
        .flat_map(|s| {
            s.feature_weights
                .iter()
                .filter(|(_, w)| !w.is_finite() || **w < 0.0)
                .map(move |(f, _)| format!("{}.{}", s.component, f))
        })
        .collect();
    if bad.is_empty() {
        Ok(())
    } else {
        Err(KarmaError::validation("component weights must be non-negative", bad))
    }
}

/// Scores every (vehicle, lap, component) of `rows`.
///
/// Laps are processed in increasing order per vehicle; a vehicle listing
/// the same lap twice is rejected, as is any component feature missing
/// from the whole table.
pub fn compute_stream(
    rows: &[LapFeatureRow],
    specs: &[ComponentSpec],
    params: &KarmaParams,
) -> Result<Vec<ComponentScoreRecord>> {
    params.validate()?;
    validate_specs(specs)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let required: BTreeSet<&str> = specs
        .iter()
        .flat_map(|s| s.feature_weights.keys().map(String::as_str))
        .collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|f| !rows.iter().any(|r| r.features.contains_key(**f)))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(KarmaError::validation(
            "dataset missing required features for karma stream",
            missing,
        ));
    }

    let bounds = FeatureBounds::compute(rows, required.iter().copied());

    let mut ordered: Vec<&LapFeatureRow> = rows.iter().collect();
    ordered.sort_by(|a, b| (&a.vehicle_id, a.lap).cmp(&(&b.vehicle_id, b.lap)));
    let duplicates: Vec<String> = ordered
        .windows(2)
        .filter(|p| p[0].vehicle_id == p[1].vehicle_id && p[0].lap == p[1].lap)
        .map(|p| format!("{} lap {}", p[0].vehicle_id, p[0].lap))
        .collect();
    if !duplicates.is_empty() {
        return Err(KarmaError::validation("duplicate lap rows", duplicates));
    }

    let mut state = KarmaState::default();
    let mut records: Vec<ComponentScoreRecord> = Vec::with_capacity(ordered.len() * specs.len());
    for row in ordered {
        records.extend(state.advance(row, specs, &bounds, params)?);
    }

    info!(
        "karma stream: {} records (smoothing={}, wear_rate={})",
        records.len(),
        params.smoothing,
        params.wear_rate
    );
    Ok(records)
}

/// Records of one vehicle, optionally up to and including `max_lap`.
pub fn karma_for_vehicle(
    records: &[ComponentScoreRecord],
    vehicle_id: &str,
    max_lap: Option<i64>,
) -> Vec<ComponentScoreRecord> {
    let mut out: Vec<ComponentScoreRecord> = records
        .iter()
        .filter(|r| r.vehicle_id == vehicle_id && max_lap.map_or(true, |m| r.lap <= m))
        .cloned()
        .collect();
    out.sort_by(|a, b| (a.lap, a.component).cmp(&(b.lap, b.component)));
    out
}

/// Latest record per component for one vehicle.
pub fn latest_by_component(
    records: &[ComponentScoreRecord],
    vehicle_id: &str,
) -> BTreeMap<Component, ComponentScoreRecord> {
    let mut latest: BTreeMap<Component, ComponentScoreRecord> = BTreeMap::new();
    for r in records.iter().filter(|r| r.vehicle_id == vehicle_id) {
        let newer = latest.get(&r.component).map_or(true, |cur| r.lap > cur.lap);
        if newer {
            latest.insert(r.component, r.clone());
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn engine_on_speed() -> Vec<ComponentSpec> {
        vec![ComponentSpec::new(Component::Engine, &[("speed_mean", 1.0)], "")]
    }

    fn scores<'a>(records: &'a [ComponentScoreRecord], vehicle: &str) -> Vec<&'a ComponentScoreRecord> {
        records.iter().filter(|r| r.vehicle_id == vehicle).collect()
    }

    #[test]
    fn test_first_lap_seeded_without_smoothing() {
        let rows = vec![
            LapFeatureRow::new("V1", 1).with_feature("speed_mean", 100.0),
            LapFeatureRow::new("V2", 1).with_feature("speed_mean", 80.0),
            LapFeatureRow::new("V2", 2).with_feature("speed_mean", 120.0),
        ];
        let params = KarmaParams {
            smoothing: 0.6,
            wear_rate: 0.002,
        };
        let records = compute_stream(&rows, &engine_on_speed(), &params).unwrap();

        let v1 = scores(&records, "V1");
        assert_eq!(v1.len(), 1);
        assert!((v1[0].instant_score - 0.5).abs() < EPS);
        let expected = 0.5 + 0.002_f64.min(0.5) * (1.0 + 0.5 * 0.5);
        assert!((v1[0].karma_score - expected).abs() < EPS);
    }

    #[test]
    fn test_smoothing_uses_previous_karma() {
        let rows = vec![
            LapFeatureRow::new("V1", 5).with_feature("speed_mean", 80.0),
            LapFeatureRow::new("V1", 6).with_feature("speed_mean", 120.0),
        ];
        let params = KarmaParams::default();
        let records = compute_stream(&rows, &engine_on_speed(), &params).unwrap();

        // Lap 5 is the vehicle's first: relative lap 1, instant 0.
        let k1 = 0.002;
        assert!((records[0].karma_score - k1).abs() < EPS);
        // Lap 6: relative lap 2, instant 1.
        let k2 = 0.6 * k1 + 0.4 * 1.0 + 0.004 * 1.5;
        assert!((records[1].karma_score - k2).abs() < EPS);
    }

    #[test]
    fn test_state_resets_across_vehicles() {
        let rows = vec![
            LapFeatureRow::new("A", 1).with_feature("speed_mean", 120.0),
            LapFeatureRow::new("B", 10).with_feature("speed_mean", 80.0),
        ];
        let records = compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()).unwrap();
        let b = scores(&records, "B");
        assert_eq!(b[0].instant_score, 0.0);
        assert!((b[0].karma_score - 0.002).abs() < EPS);
    }

    #[test]
    fn test_scores_bounded() {
        let rows: Vec<LapFeatureRow> = (1..=400)
            .map(|lap| {
                LapFeatureRow::new("V1", lap)
                    .with_feature("speed_mean", 100.0 + (lap % 7) as f64 * 10.0)
                    .with_feature("nmot_mean", 9000.0 - (lap % 5) as f64 * 500.0)
            })
            .collect();
        let specs = vec![ComponentSpec::new(
            Component::Engine,
            &[("speed_mean", 0.4), ("nmot_mean", 0.6)],
            "",
        )];
        let params = KarmaParams {
            smoothing: 0.2,
            wear_rate: 0.05,
        };
        for r in compute_stream(&rows, &specs, &params).unwrap() {
            assert!((0.0..=1.0).contains(&r.instant_score));
            assert!((0.0..=1.0).contains(&r.karma_score));
        }
    }

    #[test]
    fn test_zero_stress_karma_is_non_decreasing() {
        // Constant feature: min == max, so every lap normalizes to zero.
        let rows: Vec<LapFeatureRow> = (1..=600)
            .map(|lap| LapFeatureRow::new("V1", lap).with_feature("speed_mean", 100.0))
            .collect();
        let records = compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()).unwrap();

        assert!((records[0].karma_score - 0.002).abs() < EPS);
        for pair in records.windows(2) {
            assert_eq!(pair[1].instant_score, 0.0);
            assert!(pair[1].karma_score >= pair[0].karma_score - EPS);
            assert!(pair[1].karma_score <= 1.0);
        }
    }

    #[test]
    fn test_null_features_drop_out_of_weighting() {
        let bounds = FeatureBounds::compute(
            &[
                LapFeatureRow::new("V1", 1).with_feature("a", 0.0).with_feature("b", 0.0),
                LapFeatureRow::new("V1", 2).with_feature("a", 10.0).with_feature("b", 10.0),
            ],
            ["a", "b"],
        );
        let spec = ComponentSpec::new(Component::Brakes, &[("a", 0.6), ("b", 0.4)], "");

        let mut row = LapFeatureRow::new("V1", 3).with_feature("a", 5.0);
        row.features.insert("b".into(), None);
        assert!((instant_score(&row, &spec, &bounds) - 0.5).abs() < EPS);

        let empty = LapFeatureRow::new("V1", 4);
        assert_eq!(instant_score(&empty, &spec, &bounds), 0.0);
    }

    #[test]
    fn test_normalization_clamps() {
        let bounds = FeatureBounds::compute(
            &[
                LapFeatureRow::new("V1", 1).with_feature("a", 80.0),
                LapFeatureRow::new("V1", 2).with_feature("a", 120.0),
            ],
            ["a"],
        );
        assert_eq!(bounds.normalize("a", 200.0), 1.0);
        assert_eq!(bounds.normalize("a", 10.0), 0.0);
        assert!((bounds.normalize("a", 100.0) - 0.5).abs() < EPS);
        assert_eq!(bounds.normalize("unknown", 5.0), 0.0);
    }

    #[test]
    fn test_missing_feature_fails_fast() {
        let rows = vec![LapFeatureRow::new("V1", 1).with_feature("speed_mean", 100.0)];
        let err = compute_stream(&rows, &default_component_specs(), &KarmaParams::default()).unwrap_err();
        match err {
            KarmaError::Validation { names, .. } => {
                assert!(names.contains(&"nmot_mean".to_string()));
                assert!(!names.contains(&"speed_mean".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_laps_rejected() {
        let rows = vec![
            LapFeatureRow::new("V1", 2).with_feature("speed_mean", 100.0),
            LapFeatureRow::new("V1", 2).with_feature("speed_mean", 110.0),
        ];
        assert!(matches!(
            compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()),
            Err(KarmaError::Validation { .. })
        ));
    }

    #[test]
    fn test_extreme_lap_span_rejected() {
        let rows = vec![
            LapFeatureRow::new("V1", i64::MIN).with_feature("speed_mean", 100.0),
            LapFeatureRow::new("V1", i64::MAX).with_feature("speed_mean", 110.0),
        ];
        match compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()) {
            Err(KarmaError::Validation { message, .. }) => assert_eq!(message, "lap numbers out of range"),
            other => panic!("unexpected result: {other:?}"),
        }

        // Out-of-range lap values never reach the engine from JSON.
        let parsed: std::result::Result<Vec<LapFeatureRow>, _> = serde_json::from_value(serde_json::json!([
            {"vehicle_id": "V1", "lap": -1e19, "speed_mean": 100.0},
            {"vehicle_id": "V1", "lap": 1e19, "speed_mean": 110.0}
        ]));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_unordered_input_processed_in_lap_order() {
        let rows = vec![
            LapFeatureRow::new("V1", 3).with_feature("speed_mean", 120.0),
            LapFeatureRow::new("V1", 1).with_feature("speed_mean", 80.0),
            LapFeatureRow::new("V1", 2).with_feature("speed_mean", 100.0),
        ];
        let records = compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()).unwrap();
        let laps: Vec<i64> = records.iter().map(|r| r.lap).collect();
        assert_eq!(laps, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_table_yields_no_records() {
        let records = compute_stream(&[], &default_component_specs(), &KarmaParams::default()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_vehicle_queries() {
        let rows: Vec<LapFeatureRow> = (1..=4)
            .flat_map(|lap| {
                ["V1", "V2"].map(|v| LapFeatureRow::new(v, lap).with_feature("speed_mean", 90.0 + lap as f64))
            })
            .collect();
        let records = compute_stream(&rows, &engine_on_speed(), &KarmaParams::default()).unwrap();

        let upto = karma_for_vehicle(&records, "V2", Some(2));
        assert_eq!(upto.len(), 2);
        assert!(upto.iter().all(|r| r.vehicle_id == "V2" && r.lap <= 2));

        let latest = latest_by_component(&records, "V1");
        assert_eq!(latest[&Component::Engine].lap, 4);
    }
}
