use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth;
use crate::config::Settings;
use crate::dispatcher::{DispatchError, JobDispatcher};
use crate::hub::BroadcastHub;
use crate::lifecycle::{JobStatus, Transition};
use crate::live;
use crate::metrics;
use crate::models::{AnalysisJob, DispatchTask, NewJob, StartAnalysisRequest};
use crate::policy::RateLimiter;
use crate::queue::JobQueue;
use crate::repository::JobRepository;
use crate::vision::AnalysisService;
use crate::webhook::{self, WebhookIngestor};

#[cfg(test)]
#[path = "./api_tests.rs"]
mod tests;

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

// --- SHARED STATE ---
pub struct AppState {
    pub settings: Settings,
    pub repo: JobRepository,
    pub queue: Arc<dyn JobQueue>,
    pub dispatcher: Arc<JobDispatcher>,
    /// Shared with the worker pool: one submission budget per process.
    pub limiter: Arc<RateLimiter>,
    pub vision: Arc<dyn AnalysisService>,
    pub ingestor: WebhookIngestor,
    pub hub: Arc<BroadcastHub>,
}

type ApiResponse = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiResponse {
    error!("{}: {}", context, e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

fn job_json(job: &AnalysisJob) -> Value {
    serde_json::to_value(job).unwrap_or_default()
}

// --- AUTH MIDDLEWARE ---
pub struct Auth(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Auth {
    type Rejection = ApiResponse;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        auth::authenticate(&state.settings.token_secret, None, &parts.headers)
            .map(Auth)
            .map_err(|e| api_error(StatusCode::UNAUTHORIZED, format!("Unauthorized: {}", e)))
    }
}

// --- HANDLERS ---

async fn health_check() -> &'static str {
    "Pitchside analysis orchestrator is running (SQLite + Redis)."
}

async fn handle_healthz(State(state): State<Arc<AppState>>) -> ApiResponse {
    // 1. Check Database
    let db_status = sqlx::query("SELECT 1").execute(state.repo.pool()).await;

    // 2. Check Redis
    let redis_status = state.queue.ping().await;

    if db_status.is_ok() && redis_status.is_ok() {
        (StatusCode::OK, Json(json!({
            "status": "ok",
            "db": "connected",
            "redis": "connected"
        })))
    } else {
        let db_err = db_status.as_ref().err();
        let redis_err = redis_status.as_ref().err();
        error!("Health check failed: DB={:?}, Redis={:?}", db_err, redis_err);

        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({
            "status": "error",
            "db": if db_status.is_ok() { "connected" } else { "disconnected" },
            "redis": if redis_status.is_ok() { "connected" } else { "disconnected" }
        })))
    }
}

async fn handle_metrics() -> String {
    metrics::get_metrics()
}

async fn handle_start_analysis(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Json(payload): Json<StartAnalysisRequest>,
) -> ApiResponse {
    if let Err(e) = payload.validate() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid request", "details": e})));
    }

    // 1. The video must exist and belong to the caller
    match state.repo.get_video(&payload.video_id).await {
        Ok(Some(video)) if video.owner_id == user_id => {}
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "Video not found"),
        Err(e) => return internal_error("DB error get_video", e),
    }

    // 2. Persist first (Status: QUEUED)
    let new_job = NewJob {
        id: Uuid::new_v4().to_string(),
        video_id: payload.video_id,
        match_id: payload.match_id,
        analysis_type: payload.analysis_type,
        model_config: payload.model_config.unwrap_or_else(|| json!({})),
        user_id,
    };
    let job = match state.repo.create_job(&new_job).await {
        Ok(job) => job,
        Err(e) => return internal_error("Failed to persist job", e),
    };
    info!("[{}] Job created for video {} ({:?})", job.id, job.video_id, job.analysis_type);

    // 3. Inline dispatch within the submission budget; otherwise the work queue
    if let Err(wait) = state.limiter.try_acquire().await {
        info!("[{}] Submission budget spent (next slot in {:?}). Queueing.", job.id, wait);
        return hand_to_queue(&state, &job).await;
    }

    match state.dispatcher.dispatch_and_record(&job).await {
        Ok(updated) => (StatusCode::ACCEPTED, Json(job_json(&updated))),
        Err(e) if e.is_terminal_conflict() => match state.repo.get_job(&job.id).await {
            Ok(Some(current)) => (StatusCode::ACCEPTED, Json(job_json(&current))),
            Ok(None) => api_error(StatusCode::NOT_FOUND, "Job not found"),
            Err(e) => internal_error("DB error get_job", e),
        },
        Err(e @ DispatchError::NotRecorded(_)) => {
            // Already submitted; queueing it would submit a second time.
            warn!("[{}] {}", job.id, e);
            (StatusCode::ACCEPTED, Json(json!({
                "recorded": false,
                "job": job_json(&job)
            })))
        }
        Err(e @ DispatchError::MissingMedia(_)) => {
            warn!("[{}] {}", job.id, e);
            match state.repo.fail_job(&job.id, Transition::Fail, &e.to_string()).await {
                Ok(failed) => {
                    metrics::inc_failed();
                    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({
                        "error": e.to_string(),
                        "job": job_json(&failed)
                    })))
                }
                Err(store) => internal_error("Failed to record dispatch failure", store),
            }
        }
        Err(e) if e.is_retryable() => {
            warn!("[{}] Inline dispatch failed: {}. Handing to work queue.", job.id, e);
            hand_to_queue(&state, &job).await
        }
        Err(e) => internal_error("Dispatch error", e),
    }
}

async fn hand_to_queue(state: &AppState, job: &AnalysisJob) -> ApiResponse {
    match state.queue.enqueue(DispatchTask::new(&job.id)).await {
        Ok(()) => {
            metrics::inc_queued();
            (StatusCode::ACCEPTED, Json(json!({
                "queued": true,
                "job": job_json(job)
            })))
        }
        Err(queue_err) => {
            error!("[{}] Redis error: {}", job.id, queue_err);
            let message = format!("System Error: Queue unavailable - {}", queue_err);
            if let Err(store) = state.repo.fail_job(&job.id, Transition::Fail, &message).await {
                error!("[{}] Failed to record queue failure: {}", job.id, store);
            }
            api_error(StatusCode::SERVICE_UNAVAILABLE, "Queue unavailable")
        }
    }
}

#[derive(Deserialize)]
struct JobsQuery {
    limit: Option<i64>,
    status: Option<String>,
}

async fn handle_list_jobs(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Query(query): Query<JobsQuery>,
) -> ApiResponse {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match state.repo.list_jobs(&user_id, status, limit).await {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::to_value(jobs).unwrap_or_default())),
        Err(e) => internal_error("DB error list_jobs", e),
    }
}

async fn owned_job(state: &AppState, job_id: &str, user_id: &str) -> Result<AnalysisJob, ApiResponse> {
    match state.repo.get_owned_job(job_id, user_id).await {
        Ok(Some(job)) => Ok(job),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Job not found")),
        Err(e) => Err(internal_error("DB error get_job", e)),
    }
}

async fn handle_get_job(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Path(job_id): Path<String>,
) -> ApiResponse {
    let job = match owned_job(&state, &job_id, &user_id).await {
        Ok(job) => job,
        Err(response) => return response,
    };

    // Live view from the vision service; persisted state is authoritative.
    let upstream = if job.status.is_terminal() {
        Value::Null
    } else {
        match state.vision.get_status(&job.id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("[{}] Upstream status unavailable: {}", job.id, e);
                Value::Null
            }
        }
    };

    let mut body = job_json(&job);
    body["upstream"] = upstream;
    (StatusCode::OK, Json(body))
}

async fn handle_get_events(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Path(job_id): Path<String>,
) -> ApiResponse {
    if let Err(response) = owned_job(&state, &job_id, &user_id).await {
        return response;
    }
    match state.repo.list_events(&job_id).await {
        Ok(events) => (StatusCode::OK, Json(serde_json::to_value(events).unwrap_or_default())),
        Err(e) => internal_error("DB error list_events", e),
    }
}

async fn handle_get_tracking(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Path(job_id): Path<String>,
) -> ApiResponse {
    if let Err(response) = owned_job(&state, &job_id, &user_id).await {
        return response;
    }
    match state.repo.list_trackings(&job_id).await {
        Ok(trackings) => (StatusCode::OK, Json(serde_json::to_value(trackings).unwrap_or_default())),
        Err(e) => internal_error("DB error list_trackings", e),
    }
}

async fn handle_cancel_job(
    State(state): State<Arc<AppState>>,
    Auth(user_id): Auth,
    Path(job_id): Path<String>,
) -> ApiResponse {
    let job = match owned_job(&state, &job_id, &user_id).await {
        Ok(job) => job,
        Err(response) => return response,
    };
    if job.status.is_terminal() {
        return api_error(StatusCode::CONFLICT, format!("Job is already {}", job.status));
    }

    // Best effort: the upstream computation may keep running.
    if let Err(e) = state.vision.cancel(&job.id).await {
        warn!("[{}] Upstream cancel failed: {}", job.id, e);
    }

    match state.repo.fail_job(&job.id, Transition::Cancel, CANCELLED_MESSAGE).await {
        Ok(cancelled) => {
            info!("[{}] Cancelled by owner.", job.id);
            metrics::inc_failed();
            (StatusCode::OK, Json(json!({
                "status": "cancelled",
                "job": job_json(&cancelled)
            })))
        }
        Err(e) if e.is_terminal_conflict() => api_error(StatusCode::CONFLICT, e.to_string()),
        Err(e) => internal_error("Failed to cancel job", e),
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(handle_metrics))
        .route("/analysis", post(handle_start_analysis).get(handle_list_jobs))
        .route("/analysis/:id", get(handle_get_job).delete(handle_cancel_job))
        .route("/analysis/:id/events", get(handle_get_events))
        .route("/analysis/:id/tracking", get(handle_get_tracking))
        .route("/webhooks/analysis", post(webhook::handle_webhook))
        .route("/live", get(live::ws_upgrade))
        .with_state(state)
}
