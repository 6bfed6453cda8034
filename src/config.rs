use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KarmaError, Result};
use crate::karma::{default_component_specs, ComponentSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stat {
    Mean,
    Max,
    Min,
    Std,
}

impl Stat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stat::Mean => "mean",
            Stat::Max => "max",
            Stat::Min => "min",
            Stat::Std => "std",
        }
    }
}

/// Statistics to compute for one telemetry signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub signal: String,
    pub stats: Vec<Stat>,
    /// Optional suffix overrides, e.g. `{"std": "stdev"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<Stat, String>,
}

impl AggregationSpec {
    pub fn new(signal: &str, stats: &[Stat]) -> Self {
        Self {
            signal: signal.to_string(),
            stats: stats.to_vec(),
            rename: BTreeMap::new(),
        }
    }

    pub fn column_name(&self, stat: Stat) -> String {
        let suffix = self
            .rename
            .get(&stat)
            .map(String::as_str)
            .unwrap_or(stat.as_str());
        format!("{}_{}", self.signal, suffix)
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.stats.iter().map(|s| self.column_name(*s)).collect()
    }
}

pub fn default_aggregations() -> Vec<AggregationSpec> {
    use Stat::*;
    vec![
        AggregationSpec::new("speed", &[Mean, Max]),
        AggregationSpec::new("Steering_Angle", &[Mean, Std]),
        AggregationSpec::new("ath", &[Mean, Max, Std]),
        AggregationSpec::new("pbrake_f", &[Mean, Max]),
        AggregationSpec::new("pbrake_r", &[Mean, Max]),
        AggregationSpec::new("nmot", &[Mean, Max, Std]),
        AggregationSpec::new("accx_can", &[Mean, Max, Min, Std]),
        AggregationSpec::new("accy_can", &[Mean, Max, Min, Std]),
        AggregationSpec::new("gear", &[Mean, Max]),
    ]
}

/// Column conventions and aggregation settings for the per-lap pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub vehicle_column: String,
    /// Canonical name the primary time column is renamed to.
    pub time_column: String,
    /// Checked in order after `time_column` when resolving the primary time column.
    pub time_candidates: Vec<String>,
    pub signal_name_column: String,
    pub signal_value_column: String,
    pub aggregations: Vec<AggregationSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vehicle_column: "vehicle_id".to_string(),
            time_column: "meta_time".to_string(),
            time_candidates: vec!["timestamp".to_string(), "meta_time".to_string()],
            signal_name_column: "telemetry_name".to_string(),
            signal_value_column: "telemetry_value".to_string(),
            aggregations: default_aggregations(),
        }
    }
}

/// Per-invocation tunables of the risk engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KarmaParams {
    pub smoothing: f64,
    pub wear_rate: f64,
}

impl Default for KarmaParams {
    fn default() -> Self {
        Self {
            smoothing: 0.6,
            wear_rate: 0.002,
        }
    }
}

impl KarmaParams {
    pub const MAX_SMOOTHING: f64 = 0.99;

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=Self::MAX_SMOOTHING).contains(&self.smoothing) {
            return Err(KarmaError::validation(
                format!("smoothing must be within [0, {}]", Self::MAX_SMOOTHING),
                vec![self.smoothing.to_string()],
            ));
        }
        if !self.wear_rate.is_finite() || self.wear_rate < 0.0 {
            return Err(KarmaError::validation(
                "wear_rate must be a non-negative number",
                vec![self.wear_rate.to_string()],
            ));
        }
        Ok(())
    }
}

/// File names of the raw inputs, relative to `<data_root>/raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFiles {
    pub telemetry: String,
    pub lap_start: String,
    pub lap_end: String,
    pub results: String,
}

impl Default for RawFiles {
    fn default() -> Self {
        Self {
            telemetry: "telemetry.json".to_string(),
            lap_start: "lap_start.json".to_string(),
            lap_end: "lap_end.json".to_string(),
            results: "results.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_root: PathBuf,
    pub files: RawFiles,
    pub pipeline: PipelineConfig,
    pub karma: KarmaParams,
    pub components: Vec<ComponentSpec>,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            files: RawFiles::default(),
            pipeline: PipelineConfig::default(),
            karma: KarmaParams::default(),
            components: default_component_specs(),
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Loads the JSON config at `path` (defaults when `None`), then applies env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = fs::read_to_string(path).map_err(|source| KarmaError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&data)?
            }
            None => AppConfig::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.karma.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(root) = var("DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Some(col) = var("TELEMETRY_TIME_COL") {
            self.pipeline.time_column = col;
        }
        if let Some(col) = var("TELEMETRY_VEHICLE_COL") {
            self.pipeline.vehicle_column = col;
        }
        if let Some(port) = var("PORT").and_then(|s| s.parse().ok()) {
            self.port = port;
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_root.join("raw")
    }

    pub fn interim_dir(&self) -> PathBuf {
        self.data_root.join("interim")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_root.join("processed")
    }

    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.raw_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"karma": {"smoothing": 0.8}, "port": 9000}"#).unwrap();
        assert_eq!(cfg.karma.smoothing, 0.8);
        assert_eq!(cfg.karma.wear_rate, 0.002);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.pipeline.vehicle_column, "vehicle_id");
        assert_eq!(cfg.components.len(), 4);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|key| match key {
            "TELEMETRY_TIME_COL" => Some("ts".to_string()),
            "PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert_eq!(cfg.pipeline.time_column, "ts");
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn test_smoothing_bounds() {
        assert!(KarmaParams::default().validate().is_ok());
        let too_smooth = KarmaParams {
            smoothing: 1.0,
            ..Default::default()
        };
        assert!(too_smooth.validate().is_err());
        let negative_wear = KarmaParams {
            wear_rate: -0.1,
            ..Default::default()
        };
        assert!(negative_wear.validate().is_err());
    }

    #[test]
    fn test_stat_suffix_rename() {
        let mut spec = AggregationSpec::new("nmot", &[Stat::Mean, Stat::Std]);
        spec.rename.insert(Stat::Std, "stdev".to_string());
        assert_eq!(spec.output_columns(), vec!["nmot_mean", "nmot_stdev"]);
    }
}
