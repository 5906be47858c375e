//! Job lifecycle state machine.
//!
//! Every status change of an [`AnalysisJob`](crate::models::AnalysisJob) goes
//! through [`JobStatus::apply`]. The repository derives its SQL guards from
//! it, so the dispatcher, the worker pool and the webhook ingestor cannot
//! disagree about which moves are legal.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// What an actor wants to happen to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The vision service accepted the dispatch request.
    Start,
    /// The vision service reported progress through a webhook.
    Progress,
    /// Final results arrived.
    Complete,
    /// The vision service, or the worker pool after exhausting retries, gave up.
    Fail,
    /// The owner cancelled the job.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0} and cannot be moved by {1:?}")]
    Terminal(JobStatus, Transition),
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Returns the status reached by applying `transition`, or an error when
    /// the job is terminal. Out-of-order delivery is tolerated: a job still
    /// QUEUED may complete or fail directly.
    pub fn apply(self, transition: Transition) -> Result<JobStatus, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self, transition));
        }
        Ok(transition.target())
    }

    /// `result_data` may only be present on COMPLETED jobs and
    /// `error_message` only on FAILED ones.
    pub fn permits(&self, has_result: bool, has_error: bool) -> bool {
        has_result == (*self == JobStatus::Completed) && has_error == (*self == JobStatus::Failed)
    }
}

impl Transition {
    /// Statuses from which this transition is legal.
    pub fn sources(self) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|status| status.apply(self).is_ok())
            .collect()
    }

    pub fn target(self) -> JobStatus {
        match self {
            Transition::Start | Transition::Progress => JobStatus::Processing,
            Transition::Complete => JobStatus::Completed,
            Transition::Fail | Transition::Cancel => JobStatus::Failed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}
