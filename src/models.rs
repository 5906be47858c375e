use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use validator::{Validate, ValidationError};

use crate::lifecycle::JobStatus;

// --- DATA STRUCTURES ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    FullMatch,
    PlayerTracking,
    Tactical,
    SetPiece,
    Scouting,
    Performance,
}

#[derive(Debug, Deserialize, Clone, Serialize, Validate)]
pub struct StartAnalysisRequest {
    #[validate(length(min = 1, message = "video_id cannot be empty"))]
    pub video_id: String,
    #[validate(length(min = 1, message = "match_id cannot be empty"))]
    pub match_id: Option<String>,
    pub analysis_type: AnalysisType,
    #[validate(custom(function = "validate_model_config"))]
    pub model_config: Option<Value>,
}

fn validate_model_config(config: &Value) -> Result<(), ValidationError> {
    if config.is_object() {
        Ok(())
    } else {
        Err(ValidationError::new("model_config must be a JSON object"))
    }
}

/// Insert shape for a new job. The id is generated by the caller so it can be
/// used as the idempotency key before the row exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub video_id: String,
    pub match_id: Option<String>,
    pub analysis_type: AnalysisType,
    pub model_config: Value,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AnalysisJob {
    pub id: String,
    pub video_id: String,
    pub match_id: Option<String>,
    pub analysis_type: AnalysisType,
    pub status: JobStatus,
    pub model_config: Json<Value>,
    pub result_data: Option<Json<Value>>,
    pub error_message: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn satisfies_invariants(&self) -> bool {
        self.status
            .permits(self.result_data.is_some(), self.error_message.is_some())
    }
}

/// Source media, owned by the upload collaborator. The core only reads it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Video {
    pub id: String,
    pub owner_id: String,
    pub storage_key: String,
    pub sport: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlayerTrackingRecord {
    pub id: String,
    pub job_id: String,
    pub player_id: Option<String>,
    pub jersey_number: Option<i64>,
    pub distance_covered: Option<f64>,
    pub top_speed: Option<f64>,
    pub sprint_count: Option<i64>,
    pub tracking_data: Json<Value>,
    pub heatmap_data: Json<Value>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MatchEvent {
    pub id: String,
    pub job_id: String,
    pub match_id: Option<String>,
    pub event_type: String,
    pub timestamp: f64,
    pub player_id: Option<String>,
    pub metadata: Json<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub job_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

// --- WEBHOOK PAYLOAD FRAGMENTS ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: f64,
    pub player_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingPayload {
    pub player_id: Option<String>,
    pub jersey_number: Option<i64>,
    pub distance_covered: Option<f64>,
    pub top_speed: Option<f64>,
    pub sprint_count: Option<i64>,
    #[serde(default)]
    pub tracking_data: Value,
    #[serde(default)]
    pub heatmap_data: Value,
}

/// Everything the COMPLETED callback persists in one transaction.
#[derive(Debug, Clone)]
pub struct Completion {
    pub result_data: Value,
    pub trackings: Vec<TrackingPayload>,
    pub events: Vec<EventPayload>,
}

// --- QUEUE PAYLOAD ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub job_id: String,
    /// Failed dispatch attempts so far.
    #[serde(default)]
    pub attempt: u32,
}

impl DispatchTask {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self { job_id: job_id.into(), attempt: 0 }
    }

    pub fn next_attempt(&self) -> Self {
        Self { job_id: self.job_id.clone(), attempt: self.attempt + 1 }
    }
}
