use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::{AtomicBool, Ordering}},
};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::orchestrator::{
    backpressure::{DepthBoard, RateGate},
    circuit::{CircuitBoard, CircuitSummary},
    error::{OrchestratorError, OrchestratorErrorKind},
    registry::ProcessorRegistry,
    router::FrameRouter,
    telemetry::DispatchStats,
    types::{PressureLevel, ProcessorHealth, ProcessorId, ProcessorInfo, ProcessorSpec},
};

/// Everything the control surface reads or mutates. Handlers own no state
/// of their own; the registry stays the single source of truth.
pub struct ApiState {
    pub registry: Arc<ProcessorRegistry>,
    pub circuits: Arc<CircuitBoard>,
    pub router: Arc<FrameRouter>,
    pub gate: Arc<RateGate>,
    pub depths: Arc<DepthBoard>,
    pub stats: Arc<DispatchStats>,
    pub prometheus: Option<PrometheusHandle>,
    pub ready: Arc<AtomicBool>,
}

pub fn control_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/processors/register", post(register_processor))
        .route("/processors", get(list_processors))
        .route(
            "/processors/{id}",
            get(get_processor).delete(unregister_processor),
        )
        .route("/processors/{id}/health", get(processor_health))
        .route("/frames/stats", get(frame_stats))
        .route("/frames/backlogs", get(frame_backlogs))
        .route("/control/pause", post(pause_consumption))
        .route("/control/resume", post(resume_consumption))
        .route("/control/status", get(control_status))
        .route("/health", get(liveness))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            OrchestratorErrorKind::Validation => StatusCode::BAD_REQUEST,
            OrchestratorErrorKind::NotFound => StatusCode::NOT_FOUND,
            OrchestratorErrorKind::Conflict => StatusCode::CONFLICT,
            OrchestratorErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind,
                "message": self.0.message,
                "processor_id": self.0.processor_id,
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn register_processor(
    State(state): State<Arc<ApiState>>,
    Json(spec): Json<ProcessorSpec>,
) -> Result<(StatusCode, Json<ProcessorInfo>), ApiError> {
    // Registrations stop at the shutdown signal, before the server itself
    // goes away.
    if !state.ready.load(Ordering::Acquire) {
        return Err(OrchestratorError::new(
            OrchestratorErrorKind::Cancelled,
            "orchestrator is shutting down",
        )
        .into());
    }
    let info = state.registry.register(&spec).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Deserialize, Default)]
struct ListProcessorsQuery {
    capability: Option<String>,
}

async fn list_processors(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListProcessorsQuery>,
) -> Json<Vec<ProcessorInfo>> {
    match query.capability.as_deref() {
        Some(capability) => Json(state.registry.by_capability(capability)),
        None => Json(state.registry.snapshot().processors),
    }
}

async fn get_processor(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessorInfo>, ApiError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| unknown_processor(&id).into())
}

async fn unregister_processor(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.unregister(&id).await?;
    state.circuits.remove(&id);
    state.router.forget_processor(&id);
    state.depths.forget(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ProcessorHealthBody {
    processor_id: ProcessorId,
    health: ProcessorHealth,
    current_load: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    last_heartbeat_at: Option<OffsetDateTime>,
    circuit: CircuitSummary,
}

async fn processor_health(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessorHealthBody>, ApiError> {
    let info = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::from(unknown_processor(&id)))?;
    Ok(Json(ProcessorHealthBody {
        processor_id: info.id,
        health: info.health,
        current_load: info.current_load,
        last_heartbeat_at: info.last_heartbeat_at,
        circuit: state.circuits.summary(&id),
    }))
}

#[derive(Serialize)]
struct FrameStatsBody {
    fps: f64,
    frames_dispatched_total: u64,
    registered_processors: usize,
    healthy_processors: usize,
    pressure: PressureLevel,
    consumption_rate: f64,
    queue_depths: BTreeMap<ProcessorId, u64>,
}

async fn frame_stats(State(state): State<Arc<ApiState>>) -> Json<FrameStatsBody> {
    let snapshot = state.registry.snapshot();
    let healthy = snapshot
        .processors
        .iter()
        .filter(|info| info.health == ProcessorHealth::Healthy)
        .count();
    Json(FrameStatsBody {
        fps: state.stats.fps(),
        frames_dispatched_total: state.stats.dispatched(),
        registered_processors: snapshot.processors.len(),
        healthy_processors: healthy,
        pressure: state.gate.pressure(),
        consumption_rate: state.gate.rate(),
        queue_depths: state.depths.all(),
    })
}

async fn frame_backlogs(State(state): State<Arc<ApiState>>) -> Json<BTreeMap<ProcessorId, u64>> {
    Json(state.depths.all())
}

#[derive(Serialize)]
struct ControlStatusBody {
    mode: &'static str,
    consumption_rate: f64,
    pressure: PressureLevel,
}

async fn pause_consumption(State(state): State<Arc<ApiState>>) -> Json<ControlStatusBody> {
    state.gate.pause();
    tracing::info!(target: "api", "consumption paused by operator");
    Json(control_status_body(&state))
}

async fn resume_consumption(State(state): State<Arc<ApiState>>) -> Json<ControlStatusBody> {
    state.gate.resume();
    tracing::info!(target: "api", "consumption resumed by operator");
    Json(control_status_body(&state))
}

async fn control_status(State(state): State<Arc<ApiState>>) -> Json<ControlStatusBody> {
    Json(control_status_body(&state))
}

fn control_status_body(state: &ApiState) -> ControlStatusBody {
    ControlStatusBody {
        mode: if state.gate.is_paused() {
            "paused"
        } else {
            "running"
        },
        consumption_rate: state.gate.rate(),
        pressure: state.gate.pressure(),
    }
}

async fn liveness(State(state): State<Arc<ApiState>>) -> Response {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}

async fn metrics_text(State(state): State<Arc<ApiState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::OK, String::new()).into_response(),
    }
}

fn unknown_processor(id: &str) -> OrchestratorError {
    crate::orchestrator::error::not_found(format!("processor '{id}' is not registered"))
        .with_processor_id(id.to_string())
}
