use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::{AggregationSpec, Stat};
use crate::error::{KarmaError, Result};
use crate::table::{Cell, Table};
use crate::types::{LapFeatureRow, LAP, LAP_DURATION_S, LAP_END_TIME, LAP_START_TIME};

/// Per-lap rows plus the count of samples without a usable (vehicle, lap).
#[derive(Debug, Clone, PartialEq)]
pub struct LapAggregation {
    pub rows: Vec<LapFeatureRow>,
    pub skipped_rows: usize,
}

#[derive(Default)]
struct LapGroup {
    samples: usize,
    values: Vec<Vec<f64>>,
    meta: [Cell; 3],
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1); undefined below two values.
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn compute(stat: Stat, values: &[f64]) -> Option<f64> {
    match stat {
        Stat::Mean => mean(values),
        Stat::Max => values.iter().copied().reduce(f64::max),
        Stat::Min => values.iter().copied().reduce(f64::min),
        Stat::Std => std_dev(values),
    }
}

/// Reduces wide, lap-tagged telemetry to one row per (vehicle, lap).
///
/// Only configured signals present in `table` are aggregated; missing
/// values are skipped. Each row carries `samples_per_lap` and the first
/// non-null lap metadata seen for its group.
pub fn aggregate_per_lap(
    table: &Table,
    specs: &[AggregationSpec],
    vehicle_col: &str,
) -> Result<LapAggregation> {
    table.require(&[LAP, vehicle_col], "lap-tagged telemetry")?;
    let v_idx = table.index_of(vehicle_col, "lap-tagged telemetry")?;
    let l_idx = table.index_of(LAP, "lap-tagged telemetry")?;

    let active: Vec<(&AggregationSpec, usize)> = specs
        .iter()
        .filter_map(|spec| table.column_index(&spec.signal).map(|i| (spec, i)))
        .collect();
    if active.is_empty() {
        return Err(KarmaError::validation(
            "no configured signals found",
            specs.iter().map(|s| s.signal.clone()).collect(),
        ));
    }
    let skipped: Vec<&str> = specs
        .iter()
        .filter(|s| !table.has_column(&s.signal))
        .map(|s| s.signal.as_str())
        .collect();
    if !skipped.is_empty() {
        debug!("signals absent from telemetry, skipped: {:?}", skipped);
    }

    let meta_idx = [LAP_START_TIME, LAP_END_TIME, LAP_DURATION_S].map(|c| table.column_index(c));

    let mut groups: BTreeMap<(String, i64), LapGroup> = BTreeMap::new();
    let mut skipped_rows = 0usize;
    for row in table.rows() {
        let (Some(vehicle), Some(lap)) = (row[v_idx].as_key(), row[l_idx].as_i64()) else {
            skipped_rows += 1;
            continue;
        };
        let group = groups.entry((vehicle, lap)).or_insert_with(|| LapGroup {
            values: vec![Vec::new(); active.len()],
            ..Default::default()
        });
        group.samples += 1;
        for (slot, (_, col)) in active.iter().enumerate() {
            if let Some(v) = row[*col].as_f64() {
                group.values[slot].push(v);
            }
        }
        for (slot, idx) in meta_idx.iter().enumerate() {
            if let Some(idx) = idx {
                if group.meta[slot].is_null() {
                    group.meta[slot] = row[*idx].clone();
                }
            }
        }
    }

    let rows: Vec<LapFeatureRow> = groups
        .into_iter()
        .map(|((vehicle, lap), group)| {
            let mut out = LapFeatureRow::new(vehicle, lap);
            for ((spec, _), values) in active.iter().zip(&group.values) {
                for stat in &spec.stats {
                    out.features.insert(spec.column_name(*stat), compute(*stat, values));
                }
            }
            out.samples_per_lap = group.samples;
            let [start, end, duration] = group.meta;
            out.lap_start_time = start.as_time();
            out.lap_end_time = end.as_time();
            out.lap_duration_s = duration.as_f64();
            out
        })
        .collect();

    if skipped_rows > 0 {
        warn!("{} samples without a vehicle or lap were not aggregated", skipped_rows);
    }
    info!(
        "aggregated {} samples into {} lap rows over {} signals",
        table.len() - skipped_rows,
        rows.len(),
        active.len()
    );
    Ok(LapAggregation { rows, skipped_rows })
}
