//! Race-result labels (finished / did-not-finish) joined onto per-lap rows.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

use crate::error::{KarmaError, Result};
use crate::table::Table;
use crate::types::{LapFeatureRow, STATUS};

const CAR_NUMBER_COLUMNS: [&str; 2] = ["vehicle_number", "NUMBER"];

/// Car number -> vehicle id, as observed in telemetry.
#[derive(Debug, Clone, Default)]
pub struct VehicleLookup(HashMap<String, String>);

impl VehicleLookup {
    /// First vehicle id seen per `vehicle_number`. Empty when telemetry has no car numbers.
    pub fn from_telemetry(telemetry: &Table, vehicle_col: &str) -> Self {
        let (Some(v_idx), Some(n_idx)) = (
            telemetry.column_index(vehicle_col),
            telemetry.column_index("vehicle_number"),
        ) else {
            return Self::default();
        };
        let mut map = HashMap::new();
        for row in telemetry.rows() {
            if let (Some(vehicle), Some(number)) = (row[v_idx].as_key(), row[n_idx].as_key()) {
                map.entry(number).or_insert(vehicle);
            }
        }
        Self(map)
    }

    pub fn resolve(&self, car_number: &str) -> Option<&str> {
        self.0.get(car_number).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelDiagnostics {
    pub unresolved_results: usize,
}

/// Left-joins race results onto per-lap rows by vehicle.
///
/// Results identify vehicles by `vehicle_id` or by car number
/// (`vehicle_number` / `NUMBER`), the latter resolved through `lookup`.
/// Every returned row has `dnf_flag` set: 1 when its STATUS is "DNF", else 0.
pub fn merge_with_results(
    per_lap: &[LapFeatureRow],
    results: &Table,
    vehicle_col: &str,
    lookup: &VehicleLookup,
) -> Result<(Vec<LapFeatureRow>, LabelDiagnostics)> {
    let s_idx = results.index_of(STATUS, "race_results")?;
    let v_idx = results.column_index(vehicle_col);
    let n_idx = CAR_NUMBER_COLUMNS.iter().find_map(|c| results.column_index(c));
    if v_idx.is_none() && n_idx.is_none() {
        let mut missing = vec![vehicle_col.to_string()];
        missing.extend(CAR_NUMBER_COLUMNS.iter().map(|c| c.to_string()));
        return Err(KarmaError::schema("race_results", missing));
    }

    let mut status_by_vehicle: HashMap<String, Option<String>> = HashMap::new();
    let mut unresolved: Vec<String> = Vec::new();
    for row in results.rows() {
        let direct = v_idx.and_then(|i| row[i].as_key());
        let number = n_idx.and_then(|i| row[i].as_key());
        let vehicle = direct.or_else(|| {
            number
                .as_deref()
                .and_then(|n| lookup.resolve(n))
                .map(str::to_string)
        });
        match vehicle {
            Some(v) => {
                status_by_vehicle.entry(v).or_insert_with(|| row[s_idx].as_key());
            }
            None => unresolved.push(number.unwrap_or_else(|| "?".to_string())),
        }
    }
    if !unresolved.is_empty() {
        warn!(
            "dropping {} results rows without vehicle_id (car numbers: {:?})",
            unresolved.len(),
            unresolved
        );
    }

    let merged = per_lap
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.status = status_by_vehicle.get(&row.vehicle_id).cloned().flatten();
            row.dnf_flag = Some(u8::from(row.status.as_deref() == Some("DNF")));
            row
        })
        .collect();

    Ok((
        merged,
        LabelDiagnostics {
            unresolved_results: unresolved.len(),
        },
    ))
}
