use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Retry, concurrency and throughput limits for the dispatch worker pool.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Total worker attempts per job, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub concurrency: usize,
    pub submissions_per_window: usize,
    pub window: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            concurrency: 3,
            submissions_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl DispatchPolicy {
    /// Delay before the next attempt, given how many attempts already failed:
    /// base, 2*base, 4*base, ...
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(2u32.pow(exponent))
    }

    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// Sliding-window limiter shared by every worker: at most `limit`
/// acquisitions in any `window`.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_policy(policy: &DispatchPolicy) -> Self {
        Self::new(policy.submissions_per_window, policy.window)
    }

    /// Try to take a slot. Returns the time to wait when the window is full.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().await;

        // Evict slots outside the window
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < self.limit {
            timestamps.push_back(now);
            return Ok(());
        }

        let oldest = timestamps.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Gives back the most recent slot when the acquisition did not lead to
    /// a submission.
    pub async fn release(&self) {
        self.timestamps.lock().await.pop_back();
    }

    /// Waits until a slot is free.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }
}
