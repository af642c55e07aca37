#![deny(unsafe_code)]
#![doc = include_str!("../README.md")]

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use orch_config::OrchConfig;
use orch_dispatch::BackendRegistry;
use orch_engine::{controller, initiator, watchdog, ControllerOutcome};
use orch_store::{FileObjectStore, InMemoryKeyValueStore, InMemorySecretStore};
use orch_telemetry::MetricsCollector;

/// Shared state for every route handler.
pub struct AppState {
    /// Process-wide configuration.
    pub cfg: OrchConfig,
    /// Reference key-value store.
    pub kv: InMemoryKeyValueStore,
    /// Reference object store.
    pub object_store: FileObjectStore,
    /// Reference secret store.
    pub secret_store: InMemorySecretStore,
    /// Back-end registry consulted by the dispatcher.
    pub registry: BackendRegistry,
    /// Root directory the initiator clones/repackages orders under.
    pub workdir_root: PathBuf,
    /// Accumulated controller-invocation metrics.
    pub metrics: MetricsCollector,
}

impl AppState {
    /// Build state from `cfg`, rooted at `data_root` for both the file
    /// object store and the initiator's scratch workdir. Routes every
    /// `execution_target` to the `mock` back-end, for a self-contained
    /// local deployment with no real execution back-end wired in.
    pub fn new(cfg: OrchConfig, data_root: &std::path::Path) -> std::io::Result<Self> {
        let object_store = FileObjectStore::new(data_root.join("objects"))?;
        let registry = BackendRegistry::all_mock(Arc::new(
            FileObjectStore::new(data_root.join("objects"))?,
        ));
        Ok(Self {
            cfg,
            kv: InMemoryKeyValueStore::new(),
            object_store,
            secret_store: InMemorySecretStore::new(),
            registry,
            workdir_root: data_root.join("work"),
            metrics: MetricsCollector::new(),
        })
    }
}

/// The status envelope every route returns.
#[derive(Debug, Serialize)]
struct Envelope {
    status: &'static str,
    #[serde(flatten)]
    body: serde_json::Value,
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(code = self.code, message = %self.message, "request failed");
        let body = Json(json!({ "status": "error", "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<initiator::SubmitError> for ApiError {
    fn from(err: initiator::SubmitError) -> Self {
        use initiator::SubmitError;
        match &err {
            SubmitError::Codec(_) => ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_MALFORMED_PAYLOAD", err.to_string()),
            SubmitError::Validation(failure) => {
                ApiError::new(StatusCode::BAD_REQUEST, failure.code.as_str(), err.to_string())
            }
            SubmitError::Repackage(_) | SubmitError::Store(_) | SubmitError::Io(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<controller::ControllerError> for ApiError {
    fn from(err: controller::ControllerError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<watchdog::WatchdogError> for ApiError {
    fn from(err: watchdog::WatchdogError) -> Self {
        ApiError::internal(err.to_string())
    }
}

/// Build the router. `state` is shared across requests behind an `Arc`.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/submit", post(cmd_submit))
        .route("/controller", post(cmd_controller))
        .route("/watchdog", post(cmd_watchdog))
        .route("/metrics", get(cmd_metrics))
        .with_state(state)
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "orders_table": state.cfg.orders_table,
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    job_b64: String,
}

async fn cmd_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = initiator::submit(
        &req.job_b64,
        &state.cfg,
        &state.kv,
        &state.object_store,
        &state.secret_store,
        &state.workdir_root,
    )
    .await?;

    info!(run_id = %outcome.run_id, trace_id = %outcome.trace_id, "job submitted");
    Ok(Json(json!({ "status": "ok", "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
struct ControllerRequest {
    trigger_key: String,
}

async fn cmd_controller(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ControllerRequest>,
) -> Result<Json<ControllerOutcome>, ApiError> {
    let (outcome, metrics) = controller::run_controller(
        &req.trigger_key,
        &state.cfg,
        &state.kv,
        &state.object_store,
        &state.registry,
    )
    .await?;

    state.metrics.record(metrics);
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct WatchdogRequest {
    run_id: String,
    order_num: String,
    timeout_secs: u64,
    start_time: chrono::DateTime<chrono::Utc>,
}

async fn cmd_watchdog(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WatchdogRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = watchdog::watchdog_tick(
        &state.object_store,
        &req.run_id,
        &req.order_num,
        req.timeout_secs,
        req.start_time,
    )
    .await?;

    let status = match outcome {
        watchdog::WatchdogOutcome::Done => "done",
        watchdog::WatchdogOutcome::Pending => "pending",
    };
    Ok(Json(json!({ "status": status })))
}

async fn cmd_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.summary())
}
