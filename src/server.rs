use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{AppConfig, KarmaParams};
use crate::error::KarmaError;
use crate::karma::{compute_stream, karma_for_vehicle, latest_by_component};
use crate::pipeline::{build_per_lap_dataset, JoinDiagnostics, PipelineInputs};
use crate::table::Table;
use crate::types::{Component, ComponentScoreRecord, LapFeatureRow};

// ---------- Request/Response types ----------

#[derive(Deserialize, Debug)]
pub struct ProcessRequest {
    telemetry: Table,
    #[serde(default)]
    lap_start: Option<Table>,
    #[serde(default)]
    lap_end: Option<Table>,
    #[serde(default)]
    results: Option<Table>,
    smoothing: Option<f64>,
    wear_rate: Option<f64>,
}

#[derive(Serialize, Debug)]
pub struct ProcessResponse {
    per_lap: Vec<LapFeatureRow>,
    karma: Vec<ComponentScoreRecord>,
    diagnostics: JoinDiagnostics,
}

#[derive(Serialize, Debug)]
pub struct KarmaResponse {
    vehicle_id: String,
    latest: BTreeMap<Component, ComponentScoreRecord>,
    time_series: Vec<ComponentScoreRecord>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(e: KarmaError) -> ApiError {
    let status = match e {
        KarmaError::Schema { .. } | KarmaError::Validation { .. } | KarmaError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        KarmaError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn not_found(msg: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": msg })))
}

// ---------- Server state ----------

#[derive(Debug, Clone)]
struct Processed {
    per_lap: Vec<LapFeatureRow>,
    karma: Vec<ComponentScoreRecord>,
}

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<AppConfig>,
    latest: Arc<RwLock<Option<Processed>>>,
}

impl AppState {
    pub fn new(cfg: AppConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            latest: Arc::new(RwLock::new(None)),
        }
    }
}

// ---------- Handlers ----------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn process(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let params = KarmaParams {
        smoothing: req.smoothing.unwrap_or(state.cfg.karma.smoothing),
        wear_rate: req.wear_rate.unwrap_or(state.cfg.karma.wear_rate),
    };
    let inputs = PipelineInputs {
        telemetry: req.telemetry,
        lap_start: req.lap_start,
        lap_end: req.lap_end,
        results: req.results,
    };

    let dataset = build_per_lap_dataset(&inputs, &state.cfg.pipeline).map_err(api_error)?;
    let karma = compute_stream(&dataset.per_lap, &state.cfg.components, &params).map_err(api_error)?;
    tracing::info!(
        "processed {} laps, {} karma records, dropped {} samples",
        dataset.per_lap.len(),
        karma.len(),
        dataset.diagnostics.samples_dropped
    );

    *state.latest.write() = Some(Processed {
        per_lap: dataset.per_lap.clone(),
        karma: karma.clone(),
    });

    Ok(Json(ProcessResponse {
        per_lap: dataset.per_lap,
        karma,
        diagnostics: dataset.diagnostics,
    }))
}

async fn vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<Vec<LapFeatureRow>>, ApiError> {
    vehicle_view(&state, &vehicle_id)
}

fn vehicle_view(state: &AppState, vehicle_id: &str) -> Result<Json<Vec<LapFeatureRow>>, ApiError> {
    let guard = state.latest.read();
    let processed = guard
        .as_ref()
        .ok_or_else(|| not_found("no data processed yet".to_string()))?;
    let rows: Vec<LapFeatureRow> = processed
        .per_lap
        .iter()
        .filter(|r| r.vehicle_id == vehicle_id)
        .cloned()
        .collect();
    if rows.is_empty() {
        return Err(not_found(format!("vehicle {} not found", vehicle_id)));
    }
    Ok(Json(rows))
}

fn karma_view(state: &AppState, vehicle_id: String, max_lap: Option<i64>) -> Result<Json<KarmaResponse>, ApiError> {
    let guard = state.latest.read();
    let processed = guard
        .as_ref()
        .ok_or_else(|| not_found("no data processed yet".to_string()))?;
    let time_series = karma_for_vehicle(&processed.karma, &vehicle_id, max_lap);
    if time_series.is_empty() {
        return Err(not_found(format!("no karma scores for vehicle {}", vehicle_id)));
    }
    let latest = latest_by_component(&time_series, &vehicle_id);
    Ok(Json(KarmaResponse {
        vehicle_id,
        latest,
        time_series,
    }))
}

async fn karma(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<KarmaResponse>, ApiError> {
    karma_view(&state, vehicle_id, None)
}

async fn karma_up_to_lap(
    State(state): State<AppState>,
    Path((vehicle_id, max_lap)): Path<(String, i64)>,
) -> Result<Json<KarmaResponse>, ApiError> {
    karma_view(&state, vehicle_id, Some(max_lap))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/process", post(process))
        .route("/api/vehicle/:vehicle_id", get(vehicle))
        .route("/api/karma/:vehicle_id", get(karma))
        .route("/api/karma/:vehicle_id/lap/:max_lap", get(karma_up_to_lap))
        .with_state(state)
}

pub async fn serve(cfg: AppConfig) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = router(AppState::new(cfg));

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
