use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::lifecycle::Transition;
use crate::models::AnalysisJob;
use crate::repository::{JobRepository, StoreError};
use crate::storage::{MediaStorage, StorageError};
use crate::vision::{AnalysisRequest, AnalysisService, VisionError};

const STATUS_WRITE_RETRIES: u32 = 2;
const STATUS_WRITE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("source media unavailable: {0}")]
    MissingMedia(String),
    #[error("vision service rejected the request with {0}")]
    Rejected(StatusCode),
    #[error("vision service unreachable: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The vision service accepted the job but PROCESSING could not be
    /// written. Submitting again would start a second analysis.
    #[error("accepted by vision service but status not recorded: {0}")]
    NotRecorded(StoreError),
}

impl DispatchError {
    /// Missing media fails the job outright; a job that turned terminal in
    /// the meantime needs no further attempts either.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::MissingMedia(_) => false,
            DispatchError::Store(e) => !e.is_terminal_conflict() && !matches!(e, StoreError::NotFound(_)),
            DispatchError::NotRecorded(_) => false,
            DispatchError::Rejected(_) | DispatchError::Transport(_) => true,
        }
    }

    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, DispatchError::Store(e) | DispatchError::NotRecorded(e) if e.is_terminal_conflict())
    }
}

impl From<VisionError> for DispatchError {
    fn from(e: VisionError) -> Self {
        match e {
            VisionError::Status(status) => DispatchError::Rejected(status),
            VisionError::Transport(e) => DispatchError::Transport(e.to_string()),
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => DispatchError::MissingMedia(key),
            StorageError::Unavailable(msg) => DispatchError::Transport(msg),
        }
    }
}

pub struct JobDispatcher {
    repo: JobRepository,
    storage: Arc<dyn MediaStorage>,
    vision: Arc<dyn AnalysisService>,
    webhook_url: String,
    media_url_ttl: Duration,
    default_sport: String,
}

impl JobDispatcher {
    pub fn new(
        repo: JobRepository,
        storage: Arc<dyn MediaStorage>,
        vision: Arc<dyn AnalysisService>,
        webhook_url: String,
        media_url_ttl: Duration,
        default_sport: String,
    ) -> Self {
        Self { repo, storage, vision, webhook_url, media_url_ttl, default_sport }
    }

    /// Submits the job to the vision service. Persists nothing, so a failed
    /// attempt leaves the job exactly as it was.
    pub async fn dispatch(&self, job: &AnalysisJob) -> Result<(), DispatchError> {
        // 1. Resolve source media and mint a time-limited read URL
        let video = self
            .repo
            .get_video(&job.video_id)
            .await?
            .ok_or_else(|| DispatchError::MissingMedia(job.video_id.clone()))?;

        let video_url = self
            .storage
            .presigned_read_url(&video.storage_key, self.media_url_ttl)
            .await?;

        // 2. Build the request
        let request = AnalysisRequest {
            job_id: job.id.clone(),
            video_url,
            video_id: video.id.clone(),
            match_id: job.match_id.clone(),
            analysis_type: job.analysis_type,
            sport: video.sport.clone().unwrap_or_else(|| self.default_sport.clone()),
            model_config: job.model_config.0.clone(),
            webhook_url: self.webhook_url.clone(),
        };

        // 3. Submit
        self.vision.submit(&request).await?;
        info!("[{}] Accepted by vision service", job.id);
        Ok(())
    }

    /// Dispatch followed by the QUEUED -> PROCESSING transition. The inline
    /// request path and the worker pool both come through here.
    ///
    /// Once the vision service has accepted, only the status write is
    /// retried. A terminal conflict means a callback finished the job first
    /// and surfaces as a store error; any other failure is `NotRecorded`.
    pub async fn dispatch_and_record(&self, job: &AnalysisJob) -> Result<AnalysisJob, DispatchError> {
        self.dispatch(job).await?;

        let mut attempt = 0;
        loop {
            match self.repo.mark_processing(&job.id, Transition::Start).await {
                Ok(updated) => {
                    info!("[{}] Status: PROCESSING", job.id);
                    return Ok(updated);
                }
                Err(e) if e.is_terminal_conflict() => {
                    info!("[{}] Dispatch accepted but job is already terminal: {}", job.id, e);
                    return Err(e.into());
                }
                Err(e) if attempt < STATUS_WRITE_RETRIES => {
                    attempt += 1;
                    warn!("[{}] Recording PROCESSING failed: {}. Retrying ({}/{})", job.id, e, attempt, STATUS_WRITE_RETRIES);
                    tokio::time::sleep(STATUS_WRITE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    // Callbacks may still move the job forward from QUEUED.
                    warn!("[{}] Dispatch accepted but status not recorded: {}", job.id, e);
                    return Err(DispatchError::NotRecorded(e));
                }
            }
        }
    }
}
