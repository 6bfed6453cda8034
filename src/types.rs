use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KarmaError, Result};
use crate::table::Cell;

// Canonical column names shared by the pipeline stages.
pub const LAP: &str = "lap";
pub const LAP_NUMBER: &str = "lap_number";
pub const TIMESTAMP: &str = "timestamp";
pub const LAP_START_TIME: &str = "lap_start_time";
pub const LAP_END_TIME: &str = "lap_end_time";
pub const LAP_DURATION_S: &str = "lap_duration_s";
pub const SAMPLES_PER_LAP: &str = "samples_per_lap";
pub const STATUS: &str = "STATUS";
pub const DNF_FLAG: &str = "dnf_flag";

pub const LAP_META_COLUMNS: [&str; 3] = [LAP_START_TIME, LAP_END_TIME, LAP_DURATION_S];

/// Interval during which a vehicle is considered to be on `lap_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapWindow {
    pub vehicle_id: String,
    pub lap_number: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_s: f64,
}

impl LapWindow {
    pub fn new(
        vehicle_id: impl Into<String>,
        lap_number: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let span = end_time - start_time;
        let duration_s = span
            .num_nanoseconds()
            .map(|ns| ns as f64 / 1e9)
            .unwrap_or_else(|| span.num_milliseconds() as f64 / 1e3);
        Self {
            vehicle_id: vehicle_id.into(),
            lap_number,
            start_time,
            end_time,
            duration_s,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start_time <= t && t <= self.end_time
    }
}

/// One row per (vehicle, lap) of summary statistics.
///
/// Serialized flat: `{vehicle_id, lap, <signal>_<stat>..., samples_per_lap,
/// lap_start_time, lap_end_time, lap_duration_s, STATUS?, dnf_flag?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct LapFeatureRow {
    pub vehicle_id: String,
    pub lap: i64,
    #[serde(flatten)]
    pub features: BTreeMap<String, Option<f64>>,
    pub samples_per_lap: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap_end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap_duration_s: Option<f64>,
    #[serde(rename = "STATUS", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dnf_flag: Option<u8>,
}

impl LapFeatureRow {
    pub fn new(vehicle_id: impl Into<String>, lap: i64) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            lap,
            features: BTreeMap::new(),
            samples_per_lap: 0,
            lap_start_time: None,
            lap_end_time: None,
            lap_duration_s: None,
            status: None,
            dnf_flag: None,
        }
    }

    pub fn with_feature(mut self, name: &str, value: f64) -> Self {
        self.features.insert(name.to_string(), Some(value));
        self
    }

    /// Present, non-null feature value.
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied().flatten()
    }
}

impl TryFrom<Map<String, Value>> for LapFeatureRow {
    type Error = KarmaError;

    /// Lenient read of a per-lap record: non-numeric extra columns are ignored.
    fn try_from(mut record: Map<String, Value>) -> Result<Self> {
        let mut take = |key: &str| record.remove(key).map(Cell::from).unwrap_or_default();

        let vehicle_id = take("vehicle_id")
            .as_key()
            .ok_or_else(|| KarmaError::schema("per-lap record", vec!["vehicle_id".into()]))?;
        let lap = match take(LAP) {
            Cell::Null => take(LAP_NUMBER),
            lap => lap,
        }
        .as_i64()
        .ok_or_else(|| KarmaError::schema("per-lap record", vec![LAP.into()]))?;

        let samples_per_lap = take(SAMPLES_PER_LAP).as_i64().unwrap_or(0).max(0) as usize;
        let lap_start_time = take(LAP_START_TIME).as_time();
        let lap_end_time = take(LAP_END_TIME).as_time();
        let lap_duration_s = take(LAP_DURATION_S).as_f64();
        let status = take(STATUS).as_key();
        let dnf_flag = take(DNF_FLAG).as_i64().map(|v| u8::from(v != 0));

        let features = record
            .into_iter()
            .filter_map(|(name, value)| match Cell::from(value) {
                Cell::Null => Some((name, None)),
                Cell::Number(v) => Some((name, v.is_finite().then_some(v))),
                _ => None,
            })
            .collect();

        Ok(Self {
            vehicle_id,
            lap,
            features,
            samples_per_lap,
            lap_start_time,
            lap_end_time,
            lap_duration_s,
            status,
            dnf_flag,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Engine,
    Gearbox,
    Brakes,
    Tires,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Engine => "engine",
            Component::Gearbox => "gearbox",
            Component::Brakes => "brakes",
            Component::Tires => "tires",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk score for one component on one lap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScoreRecord {
    pub vehicle_id: String,
    pub lap: i64,
    pub component: Component,
    pub instant_score: f64,
    pub karma_score: f64,
}
