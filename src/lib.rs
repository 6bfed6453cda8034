//! Per-lap telemetry features and component risk ("karma") scoring.
//!
//! Raw, irregularly sampled telemetry flows through schema normalization,
//! lap windowing, signal pivoting and per-lap aggregation; the resulting
//! feature table feeds the component risk engine and, separately, an
//! external failure classifier.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod karma;
pub mod labels;
pub mod laps;
pub mod model;
pub mod pipeline;
pub mod pivot;
pub mod schema;
pub mod server;
pub mod store;
pub mod table;
pub mod types;

pub use config::{AggregationSpec, AppConfig, KarmaParams, PipelineConfig, Stat};
pub use error::{KarmaError, Result};
pub use karma::{compute_stream, ComponentSpec};
pub use pipeline::{build_per_lap_dataset, PerLapDataset, PipelineInputs};
pub use table::{Cell, Table};
pub use types::{Component, ComponentScoreRecord, LapFeatureRow, LapWindow};
