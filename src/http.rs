use crate::jobs::executor::JobError;
use crate::jobs::store::StoreError;
use crate::jobs::JobRunner;
use crate::metrics::Metrics;
use crate::state::State as AgentState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
    pub jobs: Arc<JobRunner>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<AgentState>>,
    jobs: Arc<JobRunner>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/run/list", get(run_list_handler))
        .route("/api/run/exec/:name", get(run_exec_handler))
        .route("/api/run/stdout/:name", get(run_stdout_handler))
        .route("/api/run/status/:name", get(run_status_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            jobs,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(guard.clone())
}

async fn run_list_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.jobs.list_jobs())
}

async fn run_exec_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    match state.jobs.start_by_name(&name).await {
        Ok(run) => {
            tokio::spawn(async move {
                let job = run.name().to_string();
                if let Err(err) = run.wait().await {
                    error!(job = %job, error = %err, "job run failed");
                }
            });
            (StatusCode::OK, Json(json!({ "started": name }))).into_response()
        }
        Err(err) => {
            if err.is_already_running() {
                info!(job = %name, "job start rejected: already running");
            } else {
                warn!(job = %name, error = %err, "job start rejected");
            }
            job_error_response(&err)
        }
    }
}

async fn run_stdout_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    let output = state.jobs.stdout(&name).await;
    let mut response = Response::new(Body::from(output));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

async fn run_status_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    match state.jobs.status(&name).await {
        Ok(run_state) => Json(json!({ "name": name, "state": run_state })).into_response(),
        Err(err) => job_error_response(&JobError::Storage(err)),
    }
}

fn job_error_response(err: &JobError) -> Response {
    let status = match err {
        JobError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        JobError::UnknownJob(_) => StatusCode::NOT_FOUND,
        JobError::AtCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Storage(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
        JobError::Spawn { .. } | JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
