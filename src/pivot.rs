use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::table::{Cell, Table};
use crate::types::{LAP, LAP_META_COLUMNS};

/// Wide table plus the count of long rows that had no usable key.
#[derive(Debug, Clone, PartialEq)]
pub struct Pivot {
    pub table: Table,
    pub skipped_rows: usize,
}

#[derive(Default)]
struct PivotGroup {
    sums: BTreeMap<String, (f64, usize)>,
    meta: Vec<Cell>,
}

/// Spreads long-format `(signal name, signal value)` rows into one column
/// per signal, keyed by (vehicle, lap, time).
///
/// Duplicate observations of a signal at the same key are averaged. Lap
/// metadata columns are carried over from the first row of each key. A table
/// missing any of the long-format columns is returned untouched, so pivoting
/// twice is a no-op.
pub fn pivot_signals(
    table: Table,
    vehicle_col: &str,
    time_col: &str,
    name_col: &str,
    value_col: &str,
) -> Pivot {
    let (Some(v_idx), Some(l_idx), Some(t_idx), Some(n_idx), Some(x_idx)) = (
        table.column_index(vehicle_col),
        table.column_index(LAP),
        table.column_index(time_col),
        table.column_index(name_col),
        table.column_index(value_col),
    ) else {
        return Pivot {
            table,
            skipped_rows: 0,
        };
    };

    let meta_cols: Vec<(&str, usize)> = LAP_META_COLUMNS
        .iter()
        .filter_map(|c| table.column_index(c).map(|i| (*c, i)))
        .collect();

    let mut groups: BTreeMap<(String, i64, DateTime<Utc>), PivotGroup> = BTreeMap::new();
    let mut signals: BTreeSet<String> = BTreeSet::new();
    let mut skipped = 0usize;

    for row in table.rows() {
        let (Some(vehicle), Some(lap), Some(t), Some(signal)) = (
            row[v_idx].as_key(),
            row[l_idx].as_i64(),
            row[t_idx].as_time(),
            row[n_idx].as_key(),
        ) else {
            skipped += 1;
            continue;
        };

        let group = groups.entry((vehicle, lap, t)).or_insert_with(|| PivotGroup {
            sums: BTreeMap::new(),
            meta: meta_cols.iter().map(|(_, i)| row[*i].clone()).collect(),
        });
        if let Some(value) = row[x_idx].as_f64() {
            let acc = group.sums.entry(signal.clone()).or_insert((0.0, 0));
            acc.0 += value;
            acc.1 += 1;
        }
        signals.insert(signal);
    }
    if skipped > 0 {
        warn!("pivot skipped {} rows without a usable key or signal name", skipped);
    }

    let mut columns: Vec<String> = vec![vehicle_col.to_string(), LAP.to_string(), time_col.to_string()];
    columns.extend(signals.iter().cloned());
    columns.extend(meta_cols.iter().map(|(c, _)| c.to_string()));

    let mut out = Table::new(columns);
    for ((vehicle, lap, t), group) in groups {
        let mut row = vec![Cell::Text(vehicle), Cell::Number(lap as f64), Cell::Time(t)];
        row.extend(signals.iter().map(|s| match group.sums.get(s) {
            Some((sum, n)) if *n > 0 => Cell::Number(sum / *n as f64),
            _ => Cell::Null,
        }));
        row.extend(group.meta);
        out.push_row(row);
    }
    Pivot {
        table: out,
        skipped_rows: skipped,
    }
}
