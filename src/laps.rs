//! Lap windows from start/end event tables, and as-of assignment of
//! telemetry samples to those windows.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{KarmaError, Result};
use crate::schema::normalize_lap_bounds;
use crate::table::{Cell, Table};
use crate::types::{LapWindow, LAP, LAP_DURATION_S, LAP_END_TIME, LAP_NUMBER, LAP_START_TIME, TIMESTAMP};

/// Counts of boundary events and windows that did not make it into the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowDiagnostics {
    pub malformed_events: usize,
    pub unmatched_starts: usize,
    pub unmatched_ends: usize,
    pub degenerate_windows: usize,
}

#[derive(Debug, Clone)]
pub struct WindowBuild {
    /// Sorted by (vehicle_id, lap_number).
    pub windows: Vec<LapWindow>,
    pub diagnostics: WindowDiagnostics,
}

type LapKey = (String, i64);

/// Collapses duplicate events per (vehicle, lap), keeping the earliest or latest.
fn collect_events(
    table: &Table,
    name: &str,
    vehicle_col: &str,
    keep_latest: bool,
    malformed: &mut usize,
) -> Result<BTreeMap<LapKey, DateTime<Utc>>> {
    let table = normalize_lap_bounds(table);
    let missing = table.missing_columns(&[vehicle_col, LAP_NUMBER, TIMESTAMP]);
    if !missing.is_empty() {
        return Err(KarmaError::validation(
            format!("{} table missing columns", name),
            missing,
        ));
    }
    let v_idx = table.index_of(vehicle_col, name)?;
    let l_idx = table.index_of(LAP_NUMBER, name)?;
    let t_idx = table.index_of(TIMESTAMP, name)?;

    let mut events: BTreeMap<LapKey, DateTime<Utc>> = BTreeMap::new();
    for row in table.rows() {
        let (Some(vehicle), Some(lap), Some(t)) =
            (row[v_idx].as_key(), row[l_idx].as_i64(), row[t_idx].as_time())
        else {
            *malformed += 1;
            continue;
        };
        events
            .entry((vehicle, lap))
            .and_modify(|current| {
                if (keep_latest && t > *current) || (!keep_latest && t < *current) {
                    *current = t;
                }
            })
            .or_insert(t);
    }
    Ok(events)
}

/// Builds one window per (vehicle, lap) present in both event tables.
///
/// Duplicate start events resolve to the earliest, duplicate end events to
/// the latest. Laps missing either side are dropped and counted.
pub fn build_lap_windows(lap_start: &Table, lap_end: &Table, vehicle_col: &str) -> Result<WindowBuild> {
    let mut diagnostics = WindowDiagnostics::default();
    let starts = collect_events(lap_start, "lap_start", vehicle_col, false, &mut diagnostics.malformed_events)?;
    let mut ends = collect_events(lap_end, "lap_end", vehicle_col, true, &mut diagnostics.malformed_events)?;

    let mut windows = Vec::with_capacity(starts.len());
    for ((vehicle, lap), start) in starts {
        let Some(end) = ends.remove(&(vehicle.clone(), lap)) else {
            diagnostics.unmatched_starts += 1;
            continue;
        };
        if end <= start {
            debug!("dropping degenerate window vehicle={} lap={}", vehicle, lap);
            diagnostics.degenerate_windows += 1;
            continue;
        }
        windows.push(LapWindow::new(vehicle, lap, start, end));
    }
    diagnostics.unmatched_ends = ends.len();

    check_disjoint(&windows)?;

    if diagnostics != WindowDiagnostics::default() {
        warn!(
            "lap windows: kept={} unmatched_starts={} unmatched_ends={} degenerate={} malformed_events={}",
            windows.len(),
            diagnostics.unmatched_starts,
            diagnostics.unmatched_ends,
            diagnostics.degenerate_windows,
            diagnostics.malformed_events
        );
    } else {
        info!("lap windows: kept={}", windows.len());
    }

    Ok(WindowBuild {
        windows,
        diagnostics,
    })
}

/// Windows of one vehicle must follow lap order in time and must not overlap.
fn check_disjoint(windows: &[LapWindow]) -> Result<()> {
    let conflicts: Vec<String> = windows
        .windows(2)
        .filter(|pair| pair[0].vehicle_id == pair[1].vehicle_id && pair[0].end_time > pair[1].start_time)
        .map(|pair| {
            format!(
                "{} laps {}/{}",
                pair[0].vehicle_id, pair[0].lap_number, pair[1].lap_number
            )
        })
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(KarmaError::validation("overlapping lap windows", conflicts))
    }
}

#[derive(Debug, Clone)]
pub struct Assignment {
    /// Kept samples, ordered by (vehicle, time), with lap columns attached.
    pub table: Table,
    pub kept: usize,
    pub dropped: usize,
}

/// Tags each sample with the last window of its vehicle starting at or
/// before the sample, then keeps it only if it is also at or before that
/// window's end.
///
/// Samples before the first lap, after the last, or in a gap between laps
/// are dropped. The time column is rewritten as parsed timestamps and the
/// `lap`, `lap_start_time`, `lap_end_time`, `lap_duration_s` columns are
/// set (replacing any existing ones).
pub fn assign_laps(
    telemetry: &Table,
    windows: &[LapWindow],
    vehicle_col: &str,
    time_col: &str,
) -> Result<Assignment> {
    telemetry.require(&[vehicle_col, time_col], "telemetry")?;
    let v_idx = telemetry.index_of(vehicle_col, "telemetry")?;
    let t_idx = telemetry.index_of(time_col, "telemetry")?;

    let mut by_vehicle: HashMap<&str, Vec<&LapWindow>> = HashMap::new();
    for w in windows {
        by_vehicle.entry(w.vehicle_id.as_str()).or_default().push(w);
    }
    for ws in by_vehicle.values_mut() {
        ws.sort_by_key(|w| w.start_time);
    }

    let mut samples: Vec<(String, DateTime<Utc>, usize)> = Vec::with_capacity(telemetry.len());
    let mut unparseable = Vec::new();
    let mut dropped = 0;
    for (i, row) in telemetry.rows().iter().enumerate() {
        let Some(t) = row[t_idx].as_time() else {
            unparseable.push(format!("row {}", i));
            continue;
        };
        match row[v_idx].as_key() {
            Some(vehicle) => samples.push((vehicle, t, i)),
            None => dropped += 1,
        }
    }
    if !unparseable.is_empty() {
        // First few offenders are enough to locate the problem.
        unparseable.truncate(5);
        return Err(KarmaError::validation(
            format!("telemetry column {} holds unparseable timestamps", time_col),
            unparseable,
        ));
    }
    samples.sort();

    let mut kept: Vec<(usize, DateTime<Utc>, &LapWindow)> = Vec::with_capacity(samples.len());
    let mut start = 0;
    while start < samples.len() {
        let vehicle = samples[start].0.as_str();
        let end = start + samples[start..].iter().take_while(|s| s.0 == vehicle).count();
        let group = &samples[start..end];

        match by_vehicle.get(vehicle) {
            None => dropped += group.len(),
            Some(ws) => {
                // Samples and windows are both time ordered: walk them together.
                let mut next = 0;
                for (_, t, row) in group {
                    while next < ws.len() && ws[next].start_time <= *t {
                        next += 1;
                    }
                    match next.checked_sub(1).map(|i| ws[i]) {
                        Some(w) if *t <= w.end_time => kept.push((*row, *t, w)),
                        _ => dropped += 1,
                    }
                }
            }
        }
        start = end;
    }

    let rows: Vec<usize> = kept.iter().map(|(row, _, _)| *row).collect();
    let mut table = telemetry.select_rows(&rows);
    table.set_column(time_col, kept.iter().map(|(_, t, _)| Cell::Time(*t)).collect());
    table.set_column(LAP, kept.iter().map(|(_, _, w)| Cell::Number(w.lap_number as f64)).collect());
    table.set_column(LAP_START_TIME, kept.iter().map(|(_, _, w)| Cell::Time(w.start_time)).collect());
    table.set_column(LAP_END_TIME, kept.iter().map(|(_, _, w)| Cell::Time(w.end_time)).collect());
    table.set_column(LAP_DURATION_S, kept.iter().map(|(_, _, w)| Cell::Number(w.duration_s)).collect());

    if dropped > 0 {
        info!("lap assignment: kept={} dropped={} (outside any lap window)", kept.len(), dropped);
    }

    Ok(Assignment {
        kept: kept.len(),
        dropped,
        table,
    })
}
