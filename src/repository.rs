//! Narrow repository contract over the job record store.
//!
//! Every status mutation is a compare-and-set whose guard is derived from
//! [`Transition::sources`], and every multi-row write runs in a single
//! transaction scoped to one job id.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbPool;
use crate::lifecycle::{JobStatus, Transition, TransitionError};
use crate::models::{
    AnalysisJob, Completion, EventPayload, MatchEvent, NewJob, Notification, PlayerTrackingRecord,
    TrackingPayload, Video,
};

#[cfg(test)]
#[path = "./repository_tests.rs"]
mod tests;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("job {0} changed concurrently")]
    Concurrent(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, StoreError::Transition(TransitionError::Terminal(..)))
    }
}

const JOB_COLUMNS: &str = "id, video_id, match_id, analysis_type, status, model_config, \
     result_data, error_message, user_id, created_at, started_at, completed_at";

const EVENT_COLUMNS: &str =
    "id, job_id, match_id, event_type, timestamp, player_id, metadata, created_at";

/// Column values written alongside a status change.
struct StatusUpdate<'a> {
    at: DateTime<Utc>,
    result_data: Option<String>,
    error_message: Option<&'a str>,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: DbPool,
}

impl JobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn create_job(&self, new: &NewJob) -> Result<AnalysisJob, StoreError> {
        let query = format!(
            "INSERT INTO analysis_jobs (id, video_id, match_id, analysis_type, status, model_config, user_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<_, AnalysisJob>(&query)
            .bind(&new.id)
            .bind(&new.video_id)
            .bind(&new.match_id)
            .bind(new.analysis_type)
            .bind(JobStatus::Queued)
            .bind(serde_json::to_string(&new.model_config)?)
            .bind(&new.user_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let query = format!("SELECT {} FROM analysis_jobs WHERE id = ?", JOB_COLUMNS);
        Ok(sqlx::query_as::<_, AnalysisJob>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_owned_job(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let query = format!(
            "SELECT {} FROM analysis_jobs WHERE id = ? AND user_id = ?",
            JOB_COLUMNS
        );
        Ok(sqlx::query_as::<_, AnalysisJob>(&query)
            .bind(job_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_jobs(
        &self,
        user_id: &str,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let mut q_builder = QueryBuilder::<Sqlite>::new("SELECT ");
        q_builder.push(JOB_COLUMNS);
        q_builder.push(" FROM analysis_jobs WHERE user_id = ");
        q_builder.push_bind(user_id);

        if let Some(status) = status {
            q_builder.push(" AND status = ");
            q_builder.push_bind(status);
        }

        q_builder.push(" ORDER BY created_at DESC LIMIT ");
        q_builder.push_bind(limit);

        Ok(q_builder
            .build_query_as::<AnalysisJob>()
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<Video>, StoreError> {
        Ok(sqlx::query_as::<_, Video>(
            "SELECT id, owner_id, storage_key, sport FROM videos WHERE id = ?",
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// QUEUED -> PROCESSING (or PROCESSING -> PROCESSING). Used by the inline
    /// dispatch path, the worker pool and the PROCESSING callback alike.
    pub async fn mark_processing(
        &self,
        job_id: &str,
        transition: Transition,
    ) -> Result<AnalysisJob, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let update = StatusUpdate { at: Utc::now(), result_data: None, error_message: None };
        advance(&mut conn, job_id, transition, &update).await
    }

    /// Commits job status, tracking records, events, match status and the
    /// owner notification together, or nothing at all.
    pub async fn complete_job(
        &self,
        job_id: &str,
        completion: &Completion,
    ) -> Result<AnalysisJob, StoreError> {
        let now = Utc::now();
        let update = StatusUpdate {
            at: now,
            result_data: Some(serde_json::to_string(&completion.result_data)?),
            error_message: None,
        };

        let mut tx = self.pool.begin().await?;
        let job = advance(&mut tx, job_id, Transition::Complete, &update).await?;

        for tracking in &completion.trackings {
            insert_tracking(&mut tx, &job.id, tracking).await?;
        }
        for event in &completion.events {
            insert_event(&mut tx, &job, event, now).await?;
        }

        if let Some(match_id) = &job.match_id {
            sqlx::query("UPDATE matches SET analysis_status = 'COMPLETED' WHERE id = ?")
                .bind(match_id)
                .execute(&mut *tx)
                .await?;
        }

        let message = format!(
            "Analysis finished with {} events and {} tracked players.",
            completion.events.len(),
            completion.trackings.len()
        );
        insert_notification(&mut tx, &job, "ANALYSIS_COMPLETED", "Analysis complete", &message, now)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Forces FAILED (for `Transition::Fail` or `Transition::Cancel`) and
    /// records the owner notification in the same transaction.
    pub async fn fail_job(
        &self,
        job_id: &str,
        transition: Transition,
        error_message: &str,
    ) -> Result<AnalysisJob, StoreError> {
        let now = Utc::now();
        let update = StatusUpdate { at: now, result_data: None, error_message: Some(error_message) };

        let mut tx = self.pool.begin().await?;
        let job = advance(&mut tx, job_id, transition, &update).await?;

        let title = match transition {
            Transition::Cancel => "Analysis cancelled",
            _ => "Analysis failed",
        };
        insert_notification(&mut tx, &job, "ANALYSIS_FAILED", title, error_message, now).await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Persists a streamed event. Returns `None` when the same event was
    /// already recorded for this job.
    pub async fn record_event(
        &self,
        job_id: &str,
        event: &EventPayload,
    ) -> Result<Option<MatchEvent>, StoreError> {
        let mut q_builder = QueryBuilder::<Sqlite>::new(
            "INSERT OR IGNORE INTO match_events (id, job_id, match_id, event_type, timestamp, player_id, metadata, created_at) SELECT ",
        );
        {
            let mut values = q_builder.separated(", ");
            values.push_bind(Uuid::new_v4().to_string());
            values.push("id");
            values.push("match_id");
            values.push_bind(&event.event_type);
            values.push_bind(event.timestamp);
            values.push_bind(&event.player_id);
            values.push_bind(serde_json::to_string(&event.metadata)?);
            values.push_bind(Utc::now());
        }
        q_builder.push(" FROM analysis_jobs WHERE id = ");
        q_builder.push_bind(job_id);
        push_status_guard(&mut q_builder, Transition::Progress);
        q_builder.push(" RETURNING ");
        q_builder.push(EVENT_COLUMNS);

        let inserted = q_builder
            .build_query_as::<MatchEvent>()
            .fetch_optional(&self.pool)
            .await?;

        if inserted.is_some() {
            return Ok(inserted);
        }

        // Nothing written: unknown job, terminal job, or a duplicate.
        let status = current_status(&self.pool, job_id).await?;
        match status {
            None => Err(StoreError::NotFound(job_id.to_string())),
            Some(status) => {
                status.apply(Transition::Progress)?;
                Ok(None)
            }
        }
    }

    pub async fn list_events(&self, job_id: &str) -> Result<Vec<MatchEvent>, StoreError> {
        let query = format!(
            "SELECT {} FROM match_events WHERE job_id = ? ORDER BY timestamp ASC",
            EVENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, MatchEvent>(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list_trackings(&self, job_id: &str) -> Result<Vec<PlayerTrackingRecord>, StoreError> {
        Ok(sqlx::query_as::<_, PlayerTrackingRecord>(
            "SELECT id, job_id, player_id, jersey_number, distance_covered, top_speed, sprint_count, \
             tracking_data, heatmap_data FROM player_trackings WHERE job_id = ? ORDER BY jersey_number ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn notifications_for_job(&self, job_id: &str) -> Result<Vec<Notification>, StoreError> {
        Ok(sqlx::query_as::<_, Notification>(
            "SELECT id, user_id, job_id, kind, title, message, read, created_at \
             FROM notifications WHERE job_id = ? ORDER BY created_at ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

/// The one place a job's status column is written after creation.
async fn advance(
    conn: &mut SqliteConnection,
    job_id: &str,
    transition: Transition,
    update: &StatusUpdate<'_>,
) -> Result<AnalysisJob, StoreError> {
    let mut q_builder = QueryBuilder::<Sqlite>::new("UPDATE analysis_jobs SET status = ");
    q_builder.push_bind(transition.target());

    match transition {
        Transition::Start | Transition::Progress => {
            q_builder.push(", started_at = COALESCE(started_at, ");
            q_builder.push_bind(update.at);
            q_builder.push(")");
        }
        Transition::Complete => {
            q_builder.push(", result_data = ");
            q_builder.push_bind(update.result_data.clone());
            q_builder.push(", error_message = NULL, completed_at = ");
            q_builder.push_bind(update.at);
            q_builder.push(", started_at = COALESCE(started_at, ");
            q_builder.push_bind(update.at);
            q_builder.push(")");
        }
        Transition::Fail | Transition::Cancel => {
            q_builder.push(", error_message = ");
            q_builder.push_bind(update.error_message);
            q_builder.push(", result_data = NULL, completed_at = ");
            q_builder.push_bind(update.at);
        }
    }

    q_builder.push(" WHERE id = ");
    q_builder.push_bind(job_id);
    push_status_guard(&mut q_builder, transition);
    q_builder.push(" RETURNING ");
    q_builder.push(JOB_COLUMNS);

    let updated = q_builder
        .build_query_as::<AnalysisJob>()
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(job) = updated {
        return Ok(job);
    }

    match current_status(&mut *conn, job_id).await? {
        None => Err(StoreError::NotFound(job_id.to_string())),
        Some(status) => {
            status.apply(transition)?;
            Err(StoreError::Concurrent(job_id.to_string()))
        }
    }
}

fn push_status_guard(q_builder: &mut QueryBuilder<'_, Sqlite>, transition: Transition) {
    q_builder.push(" AND status IN (");
    let mut sources = q_builder.separated(", ");
    for status in transition.sources() {
        sources.push_bind(status);
    }
    sources.push_unseparated(")");
}

async fn current_status<'e, E>(executor: E, job_id: &str) -> Result<Option<JobStatus>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, JobStatus>("SELECT status FROM analysis_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(executor)
        .await
}

async fn insert_tracking(
    conn: &mut SqliteConnection,
    job_id: &str,
    tracking: &TrackingPayload,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO player_trackings (id, job_id, player_id, jersey_number, distance_covered, top_speed, sprint_count, tracking_data, heatmap_data) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(job_id)
    .bind(&tracking.player_id)
    .bind(tracking.jersey_number)
    .bind(tracking.distance_covered)
    .bind(tracking.top_speed)
    .bind(tracking.sprint_count)
    .bind(serde_json::to_string(&tracking.tracking_data)?)
    .bind(serde_json::to_string(&tracking.heatmap_data)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_event(
    conn: &mut SqliteConnection,
    job: &AnalysisJob,
    event: &EventPayload,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO match_events (id, job_id, match_id, event_type, timestamp, player_id, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&job.id)
    .bind(&job.match_id)
    .bind(&event.event_type)
    .bind(event.timestamp)
    .bind(&event.player_id)
    .bind(serde_json::to_string(&event.metadata)?)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_notification(
    conn: &mut SqliteConnection,
    job: &AnalysisJob,
    kind: &str,
    title: &str,
    message: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO notifications (id, user_id, job_id, kind, title, message, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&job.user_id)
    .bind(&job.id)
    .bind(kind)
    .bind(title)
    .bind(message)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
