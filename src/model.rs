//! Seam to the external failure classifier.
//!
//! The classifier itself is opaque: it sees one fixed-order feature vector
//! per lap and returns a probability. This module owns the ordering.
//! Callers embedding a trained model enter through [`score_laps`]; the CLI and
//! HTTP surfaces in this crate do not load one.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::types::LapFeatureRow;

pub trait FailureClassifier {
    /// Probability in [0, 1] that the vehicle does not finish.
    fn predict_proba(&self, features: &[f64]) -> Result<f64>;
}

/// Dense matrix of per-lap features in an authoritative column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub feat_list: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

fn order_features(row: &LapFeatureRow, feat_list: &[String]) -> Vec<f64> {
    let mut v = Vec::with_capacity(feat_list.len());
    for k in feat_list {
        v.push(match k.as_str() {
            "samples_per_lap" => row.samples_per_lap as f64,
            "lap_duration_s" => row.lap_duration_s.unwrap_or(0.0),
            _ => row.feature(k).unwrap_or(0.0),
        });
    }
    v
}

impl FeatureMatrix {
    /// Uses `feat_list` when given, otherwise the sorted union of feature
    /// names plus `samples_per_lap` and `lap_duration_s`. Missing values read as 0.
    pub fn from_rows(rows: &[LapFeatureRow], feat_list: Option<Vec<String>>) -> Self {
        let feat_list = feat_list.unwrap_or_else(|| {
            let mut names: BTreeSet<String> = rows
                .iter()
                .flat_map(|r| r.features.keys().cloned())
                .collect();
            names.insert("samples_per_lap".to_string());
            if rows.iter().any(|r| r.lap_duration_s.is_some()) {
                names.insert("lap_duration_s".to_string());
            }
            names.into_iter().collect()
        });
        let rows = rows.iter().map(|r| order_features(r, &feat_list)).collect();
        Self { feat_list, rows }
    }

    pub fn in_dim(&self) -> usize {
        self.feat_list.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LapPrediction {
    pub vehicle_id: String,
    pub lap: i64,
    pub failure_probability: f64,
}

/// Runs the classifier over every row, in input order.
pub fn score_laps<C: FailureClassifier + ?Sized>(
    classifier: &C,
    rows: &[LapFeatureRow],
    feat_list: Option<Vec<String>>,
) -> Result<Vec<LapPrediction>> {
    let matrix = FeatureMatrix::from_rows(rows, feat_list);
    rows.iter()
        .zip(&matrix.rows)
        .map(|(row, x)| {
            let p = classifier
                .predict_proba(x)
                .with_context(|| format!("classifier failed on {} lap {}", row.vehicle_id, row.lap))?;
            if !(0.0..=1.0).contains(&p) {
                bail!("classifier returned {} outside [0, 1]", p);
            }
            Ok(LapPrediction {
                vehicle_id: row.vehicle_id.clone(),
                lap: row.lap,
                failure_probability: p,
            })
        })
        .collect()
}
