//! HTTP client for the external vision-processing service.
//!
//! `submit` is a POST and is never retried here; the worker pool owns that
//! retry policy. `get_status` and `cancel` are idempotent and retried on
//! transport errors and 5xx responses with exponential backoff.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::models::AnalysisType;

const RETRY_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub job_id: String,
    pub video_url: String,
    pub video_id: String,
    pub match_id: Option<String>,
    pub analysis_type: AnalysisType,
    pub sport: String,
    pub model_config: Value,
    pub webhook_url: String,
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vision service responded with {0}")]
    Status(StatusCode),
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn submit(&self, request: &AnalysisRequest) -> Result<(), VisionError>;
    async fn get_status(&self, job_id: &str) -> Result<Value, VisionError>;
    async fn cancel(&self, job_id: &str) -> Result<(), VisionError>;
}

pub struct VisionClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl VisionClient {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self, VisionError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
        })
    }

    async fn send_idempotent<F>(&self, build: F) -> Result<reqwest::Response, VisionError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let result = build().send().await;
            let retryable = match &result {
                Ok(res) => res.status().is_server_error(),
                Err(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            };

            if !retryable || attempt >= self.max_retries {
                return match result {
                    Ok(res) if res.status().is_success() => Ok(res),
                    Ok(res) => Err(VisionError::Status(res.status())),
                    Err(e) => Err(VisionError::Transport(e)),
                };
            }

            attempt += 1;
            let delay = RETRY_BASE * 2u32.pow(attempt - 1);
            match &result {
                Ok(res) => warn!("Vision service returned {} (attempt {}/{}). Retrying in {:?}", res.status(), attempt, self.max_retries, delay),
                Err(e) => warn!("Vision service request failed: {} (attempt {}/{}). Retrying in {:?}", e, attempt, self.max_retries, delay),
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AnalysisService for VisionClient {
    async fn submit(&self, request: &AnalysisRequest) -> Result<(), VisionError> {
        let res = self
            .http
            .post(format!("{}/analyze", self.base_url))
            .json(request)
            .send()
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(VisionError::Status(res.status()))
        }
    }

    async fn get_status(&self, job_id: &str) -> Result<Value, VisionError> {
        let url = format!("{}/status/{}", self.base_url, job_id);
        let res = self.send_idempotent(|| self.http.get(&url)).await?;
        Ok(res.json::<Value>().await?)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), VisionError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        self.send_idempotent(|| self.http.delete(&url)).await?;
        Ok(())
    }
}
