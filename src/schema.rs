//! Reconciles telemetry feeds with inconsistent column names into one shape.

use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{KarmaError, Result};
use crate::table::Table;
use crate::types::{LAP, LAP_NUMBER, TIMESTAMP};

/// Alternate long-format column pairs seen across feeds, in priority order.
const SIGNAL_COLUMN_PAIRS: [(&str, &str); 2] = [
    ("telemetry_name", "telemetry_value"),
    ("signal_name", "signal_value"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryLayout {
    /// One row per (signal name, signal value) observation.
    Long,
    /// One column per signal.
    Wide,
}

#[derive(Debug, Clone)]
pub struct NormalizedTelemetry {
    pub table: Table,
    pub layout: TelemetryLayout,
    /// Column the primary time column was resolved from, before renaming.
    pub source_time_column: String,
}

/// Picks the column identifying sample time.
///
/// The configured column wins, then `time_candidates` in order, then the
/// first column whose name contains "time" (case-insensitive).
pub fn resolve_time_column(table: &Table, cfg: &PipelineConfig) -> Result<String> {
    std::iter::once(&cfg.time_column)
        .chain(cfg.time_candidates.iter())
        .find(|c| table.has_column(c))
        .or_else(|| {
            table
                .columns()
                .iter()
                .find(|c| c.to_ascii_lowercase().contains("time"))
        })
        .cloned()
        .ok_or_else(|| {
            let mut tried = vec![cfg.time_column.clone()];
            tried.extend(cfg.time_candidates.iter().cloned());
            KarmaError::schema("telemetry", tried)
        })
}

/// Returns a copy of `table` with canonical vehicle, time and signal columns.
pub fn normalize_telemetry(table: &Table, cfg: &PipelineConfig) -> Result<NormalizedTelemetry> {
    table.require(&[cfg.vehicle_column.as_str()], "telemetry")?;
    let source_time_column = resolve_time_column(table, cfg)?;

    let mut table = table.clone();
    if table.rename(&source_time_column, &cfg.time_column) {
        debug!("renamed time column {} -> {}", source_time_column, cfg.time_column);
    }

    let layout = if table.has_column(&cfg.signal_name_column)
        && table.has_column(&cfg.signal_value_column)
    {
        TelemetryLayout::Long
    } else if let Some((name, value)) = SIGNAL_COLUMN_PAIRS
        .iter()
        .find(|(n, v)| table.has_column(n) && table.has_column(v))
    {
        table.rename(name, &cfg.signal_name_column);
        table.rename(value, &cfg.signal_value_column);
        TelemetryLayout::Long
    } else {
        TelemetryLayout::Wide
    };

    Ok(NormalizedTelemetry {
        table,
        layout,
        source_time_column,
    })
}

/// Lap boundary tables expose `vehicle_id`, `lap_number`, `timestamp`.
///
/// Some feeds use `lap` for the lap number or put the time in `value`.
pub fn normalize_lap_bounds(table: &Table) -> Table {
    let mut table = table.clone();
    if !table.has_column(LAP_NUMBER) {
        table.rename(LAP, LAP_NUMBER);
    }
    if !table.has_column(TIMESTAMP) {
        table.rename("value", TIMESTAMP);
    }
    table
}
