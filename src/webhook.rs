//! Webhook Ingestor: applies vision service callbacks to job state and fans
//! the results out to live clients.
//!
//! Callbacks are at-least-once and may arrive out of order. Each one is an
//! independent, status-guarded write; anything aimed at a terminal job is
//! logged and discarded without failing the request.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::auth;
use crate::hub::BroadcastHub;
use crate::lifecycle::{JobStatus, Transition, TransitionError};
use crate::metrics;
use crate::models::{Completion, EventPayload, TrackingPayload};
use crate::repository::{JobRepository, StoreError};

#[cfg(test)]
#[path = "./webhook_tests.rs"]
mod tests;

pub const SECRET_HEADER: &str = "x-webhook-secret";
const DEFAULT_FAILURE: &str = "Analysis failed";

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub players: Option<Value>,
    pub ball: Option<Value>,
    pub timestamp: Option<f64>,
    pub event: Option<EventPayload>,
    pub result_data: Option<Value>,
    #[serde(default)]
    pub player_trackings: Vec<TrackingPayload>,
    #[serde(default)]
    pub events: Vec<EventPayload>,
    pub error_message: Option<String>,
}

#[derive(Debug)]
pub enum Callback {
    Processing { progress: Option<f64>, message: Option<String> },
    TrackingUpdate { players: Value, ball: Value, timestamp: Option<f64> },
    EventDetected(EventPayload),
    Completed(Completion),
    Failed(String),
    Unrecognized(String),
}

impl Callback {
    pub fn status_name(&self) -> &str {
        match self {
            Callback::Processing { .. } => "PROCESSING",
            Callback::TrackingUpdate { .. } => "TRACKING_UPDATE",
            Callback::EventDetected(_) => "EVENT_DETECTED",
            Callback::Completed(_) => "COMPLETED",
            Callback::Failed(_) => "FAILED",
            Callback::Unrecognized(status) => status,
        }
    }
}

impl WebhookPayload {
    /// Splits the payload into its job id and the status-specific callback.
    pub fn into_callback(self) -> Result<(String, Callback), IngestError> {
        let job_id = self
            .job_id
            .filter(|id| !id.is_empty())
            .ok_or(IngestError::MissingJobId)?;
        let status = self
            .status
            .ok_or_else(|| IngestError::Malformed("missing status".into()))?;

        let callback = match status.as_str() {
            "PROCESSING" => Callback::Processing { progress: self.progress, message: self.message },
            "TRACKING_UPDATE" => Callback::TrackingUpdate {
                players: self.players.unwrap_or(Value::Null),
                ball: self.ball.unwrap_or(Value::Null),
                timestamp: self.timestamp,
            },
            "EVENT_DETECTED" => Callback::EventDetected(
                self.event
                    .ok_or_else(|| IngestError::Malformed("EVENT_DETECTED without event".into()))?,
            ),
            "COMPLETED" => Callback::Completed(Completion {
                result_data: self
                    .result_data
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| IngestError::Malformed("COMPLETED without result_data".into()))?,
                trackings: self.player_trackings,
                events: self.events,
            }),
            "FAILED" => Callback::Failed(
                self.error_message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
            ),
            _ => Callback::Unrecognized(status),
        };
        Ok((job_id, callback))
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing job_id")]
    MissingJobId,
    #[error("malformed callback: {0}")]
    Malformed(String),
    #[error("job {0} not found")]
    UnknownJob(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Replayed streaming event that is already persisted.
    Duplicate,
    /// The job was already terminal; nothing changed.
    Discarded(JobStatus),
    /// Status value this service does not know about.
    Ignored,
}

/// One async mutex per job id with callbacks in flight.
#[derive(Default)]
struct JobLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    async fn acquire(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(job_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn release(&self, job_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(job_id) {
            // Only the map holds it: nobody is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(job_id);
            }
        }
    }
}

pub struct WebhookIngestor {
    repo: JobRepository,
    hub: Arc<BroadcastHub>,
    locks: JobLocks,
}

impl WebhookIngestor {
    pub fn new(repo: JobRepository, hub: Arc<BroadcastHub>) -> Self {
        Self { repo, hub, locks: JobLocks::default() }
    }

    pub async fn ingest(&self, payload: WebhookPayload) -> Result<IngestOutcome, IngestError> {
        let (job_id, callback) = payload.into_callback()?;

        let guard = self.locks.acquire(&job_id).await;
        let result = self.apply(&job_id, callback).await;
        self.locks.release(&job_id, guard).await;
        result
    }

    async fn apply(&self, job_id: &str, callback: Callback) -> Result<IngestOutcome, IngestError> {
        let job = self
            .repo
            .get_job(job_id)
            .await?
            .ok_or_else(|| IngestError::UnknownJob(job_id.to_string()))?;

        info!("[{}] Webhook received: {}", job_id, callback.status_name());
        metrics::inc_webhooks();

        match callback {
            Callback::Processing { progress, message } => {
                if let Err(e) = self.repo.mark_processing(job_id, Transition::Progress).await {
                    return settle(job_id, "PROCESSING", e);
                }
                self.hub
                    .publish(job_id, "analysis_progress", json!({
                        "jobId": job_id,
                        "progress": progress,
                        "message": message,
                    }))
                    .await;
                Ok(IngestOutcome::Applied)
            }
            Callback::TrackingUpdate { players, ball, timestamp } => {
                if job.status.is_terminal() {
                    warn!("[{}] TRACKING_UPDATE callback discarded: job is already {}", job_id, job.status);
                    return Ok(IngestOutcome::Discarded(job.status));
                }
                self.hub
                    .publish(job_id, "tracking_update", json!({
                        "jobId": job_id,
                        "players": players,
                        "ball": ball,
                        "timestamp": timestamp,
                    }))
                    .await;
                Ok(IngestOutcome::Applied)
            }
            Callback::EventDetected(event) => match self.repo.record_event(job_id, &event).await {
                Ok(Some(created)) => {
                    self.hub
                        .publish(job_id, "event_detected", json!({
                            "jobId": job_id,
                            "id": created.id,
                            "type": created.event_type,
                            "timestamp": created.timestamp,
                            "players": created.player_id.iter().collect::<Vec<_>>(),
                            "player_id": created.player_id,
                            "metadata": created.metadata,
                        }))
                        .await;
                    Ok(IngestOutcome::Applied)
                }
                Ok(None) => {
                    info!("[{}] Duplicate {} event at {}s ignored", job_id, event.event_type, event.timestamp);
                    Ok(IngestOutcome::Duplicate)
                }
                Err(e) => settle(job_id, "EVENT_DETECTED", e),
            },
            Callback::Completed(completion) => {
                if let Err(e) = self.repo.complete_job(job_id, &completion).await {
                    if !e.is_terminal_conflict() {
                        error!("[{}] Failed to persist completion, rolled back: {}", job_id, e);
                    }
                    return settle(job_id, "COMPLETED", e);
                }
                metrics::inc_completed();
                info!("[{}] Status: COMPLETED", job_id);
                self.hub
                    .publish(job_id, "analysis_complete", json!({
                        "jobId": job_id,
                        "summary": {
                            "events_detected": completion.events.len(),
                            "players_tracked": completion.trackings.len(),
                        },
                    }))
                    .await;
                Ok(IngestOutcome::Applied)
            }
            Callback::Failed(message) => {
                if let Err(e) = self.repo.fail_job(job_id, Transition::Fail, &message).await {
                    return settle(job_id, "FAILED", e);
                }
                metrics::inc_failed();
                warn!("[{}] Status: FAILED ({})", job_id, message);
                self.hub
                    .publish(job_id, "analysis_progress", json!({
                        "jobId": job_id,
                        "progress": -1,
                        "message": message,
                    }))
                    .await;
                Ok(IngestOutcome::Applied)
            }
            Callback::Unrecognized(status) => {
                info!("[{}] Unrecognized callback status '{}' ignored", job_id, status);
                Ok(IngestOutcome::Ignored)
            }
        }
    }
}

/// Terminal-state conflicts are discarded; every other store error surfaces.
fn settle(job_id: &str, callback: &str, e: StoreError) -> Result<IngestOutcome, IngestError> {
    match e {
        StoreError::Transition(TransitionError::Terminal(status, _)) => {
            warn!("[{}] {} callback discarded: job is already {}", job_id, callback, status);
            Ok(IngestOutcome::Discarded(status))
        }
        other => Err(other.into()),
    }
}

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !auth::secrets_match(&state.settings.webhook_secret, presented) {
        warn!("Webhook rejected: bad secret");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": format!("Malformed body: {}", e)})));
        }
    };
    let status = payload.status.clone();

    match state.ingestor.ingest(payload).await {
        Ok(_) => (StatusCode::OK, Json(json!({"received": true, "status": status}))),
        Err(e @ (IngestError::MissingJobId | IngestError::Malformed(_))) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
        }
        Err(e @ IngestError::UnknownJob(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()})))
        }
        Err(IngestError::Store(e)) => {
            error!("Webhook storage error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "Storage error"})))
        }
    }
}
