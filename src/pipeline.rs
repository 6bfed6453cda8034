//! Raw telemetry -> per-lap feature table.

use serde::Serialize;
use tracing::info;

use crate::aggregate::aggregate_per_lap;
use crate::config::PipelineConfig;
use crate::error::{KarmaError, Result};
use crate::labels::{merge_with_results, LabelDiagnostics, VehicleLookup};
use crate::laps::{assign_laps, build_lap_windows, WindowDiagnostics};
use crate::pivot::pivot_signals;
use crate::schema::normalize_telemetry;
use crate::table::Table;
use crate::types::{LapFeatureRow, LAP};

#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub telemetry: Table,
    pub lap_start: Option<Table>,
    pub lap_end: Option<Table>,
    pub results: Option<Table>,
}

/// Rows and windows silently dropped along the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinDiagnostics {
    pub windows: WindowDiagnostics,
    pub lap_windows: usize,
    pub samples_kept: usize,
    pub samples_dropped: usize,
    /// Long-format rows without a usable (vehicle, lap, time, signal) key.
    pub pivot_rows_skipped: usize,
    /// Wide rows without a usable (vehicle, lap) key.
    pub aggregate_rows_skipped: usize,
    pub labels: LabelDiagnostics,
}

#[derive(Debug, Clone)]
pub struct PerLapDataset {
    /// Lap-tagged, wide telemetry (intermediate).
    pub telemetry_with_laps: Table,
    pub per_lap: Vec<LapFeatureRow>,
    pub diagnostics: JoinDiagnostics,
}

pub fn build_per_lap_dataset(inputs: &PipelineInputs, cfg: &PipelineConfig) -> Result<PerLapDataset> {
    let mut diagnostics = JoinDiagnostics::default();
    let normalized = normalize_telemetry(&inputs.telemetry, cfg)?;
    info!(
        "telemetry: {} rows, {:?} layout, time column {}",
        normalized.table.len(),
        normalized.layout,
        normalized.source_time_column
    );

    let tagged = match (&inputs.lap_start, &inputs.lap_end) {
        (Some(start), Some(end)) => {
            info!("assigning laps to telemetry samples");
            let build = build_lap_windows(start, end, &cfg.vehicle_column)?;
            diagnostics.windows = build.diagnostics;
            diagnostics.lap_windows = build.windows.len();
            let assignment = assign_laps(&normalized.table, &build.windows, &cfg.vehicle_column, &cfg.time_column)?;
            diagnostics.samples_kept = assignment.kept;
            diagnostics.samples_dropped = assignment.dropped;
            assignment.table
        }
        (None, None) => {
            normalized.table.require(&[LAP], "telemetry")?;
            diagnostics.samples_kept = normalized.table.len();
            normalized.table
        }
        _ => {
            return Err(KarmaError::validation(
                "lap_start and lap_end must be supplied together",
                vec![],
            ))
        }
    };
    if tagged.is_empty() {
        return Err(KarmaError::validation(
            "zero telemetry rows fell inside a lap window",
            vec![],
        ));
    }

    let pivot = pivot_signals(
        tagged,
        &cfg.vehicle_column,
        &cfg.time_column,
        &cfg.signal_name_column,
        &cfg.signal_value_column,
    );
    diagnostics.pivot_rows_skipped = pivot.skipped_rows;
    let wide = pivot.table;
    info!("telemetry rows after lap assignment: {}", wide.len());

    info!("aggregating features per lap");
    let aggregation = aggregate_per_lap(&wide, &cfg.aggregations, &cfg.vehicle_column)?;
    diagnostics.aggregate_rows_skipped = aggregation.skipped_rows;
    let mut per_lap = aggregation.rows;

    if let Some(results) = &inputs.results {
        info!("merging race results + labels");
        let lookup = VehicleLookup::from_telemetry(&inputs.telemetry, &cfg.vehicle_column);
        let (merged, labels) = merge_with_results(&per_lap, results, &cfg.vehicle_column, &lookup)?;
        per_lap = merged;
        diagnostics.labels = labels;
    }

    Ok(PerLapDataset {
        telemetry_with_laps: wide,
        per_lap,
        diagnostics,
    })
}
