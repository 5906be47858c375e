use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchError, JobDispatcher};
use crate::lifecycle::{JobStatus, Transition};
use crate::metrics;
use crate::models::{AnalysisJob, DispatchTask};
use crate::policy::{DispatchPolicy, RateLimiter};
use crate::queue::{JobQueue, QueueError, QueueResult};
use crate::repository::JobRepository;

#[cfg(test)]
#[path = "./dispatch_tests.rs"]
mod tests;

/// Takes queued jobs off the work queue and submits them, one job end to
/// end per worker, under the shared rate limit and retry policy.
pub struct DispatchWorker {
    queue: Arc<dyn JobQueue>,
    repo: JobRepository,
    dispatcher: Arc<JobDispatcher>,
    limiter: Arc<RateLimiter>,
    policy: DispatchPolicy,
}

impl DispatchWorker {
    /// `limiter` is the process-wide one, shared with the inline request path.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        repo: JobRepository,
        dispatcher: Arc<JobDispatcher>,
        limiter: Arc<RateLimiter>,
        policy: DispatchPolicy,
    ) -> Self {
        Self { queue, repo, dispatcher, limiter, policy }
    }

    /// Runs one task. Errors escaping the attempt go through the retry
    /// policy as well, so a task never stays parked in the processing list.
    pub async fn handle(&self, task: DispatchTask) -> QueueResult<()> {
        match self.process(&task).await {
            Ok(()) => Ok(()),
            Err(e) => self.recover(&task, e).await,
        }
    }

    async fn process(&self, task: &DispatchTask) -> QueueResult<()> {
        if self.queued_job(task).await?.is_none() {
            return Ok(());
        }

        self.limiter.acquire().await;

        // The wait can span a whole window; the job may be cancelled meanwhile.
        let job = match self.queued_job(task).await {
            Ok(Some(job)) => job,
            other => {
                self.limiter.release().await;
                return other.map(|_| ());
            }
        };

        info!("[{}] Dispatching (attempt {}/{})...", job.id, task.attempt + 1, self.policy.max_attempts);
        metrics::inc_in_flight();
        let result = self.dispatcher.dispatch_and_record(&job).await;
        metrics::dec_in_flight();

        match result {
            Ok(_) => self.settle(task).await,
            Err(e) if e.is_terminal_conflict() => {
                info!("[{}] Job turned terminal during dispatch.", job.id);
                self.settle(task).await
            }
            Err(e @ DispatchError::NotRecorded(_)) => {
                // Submitted once already; callbacks carry the job from here.
                warn!("[{}] {}. Not resubmitting.", job.id, e);
                self.settle(task).await
            }
            Err(e) if !e.is_retryable() => {
                error!("[{}] Dispatch failed permanently: {}", job.id, e);
                self.give_up(task, &e.to_string()).await
            }
            Err(e) => {
                let failed = task.attempt + 1;
                if self.policy.should_retry(failed) {
                    let delay = self.policy.backoff_delay(failed);
                    warn!("[{}] Dispatch failed: {}. Retry {}/{} in {:?}", job.id, e, failed, self.policy.max_attempts - 1, delay);
                    metrics::inc_retries();
                    self.queue.retry_later(task, delay).await
                } else {
                    error!("[{}] Dispatch failed after {} attempts: {}", job.id, failed, e);
                    self.give_up(task, &e.to_string()).await
                }
            }
        }
    }

    /// Returns the job when it still awaits dispatch. Otherwise the task is
    /// settled here and `None` comes back.
    async fn queued_job(&self, task: &DispatchTask) -> QueueResult<Option<AnalysisJob>> {
        match self.repo.get_job(&task.job_id).await? {
            None => {
                warn!("[{}] Dispatch task for unknown job. Moving to DLQ.", task.job_id);
                self.queue.dead_letter(task).await?;
                metrics::dec_queued();
                Ok(None)
            }
            // Cancelled, or already dispatched inline or by an earlier delivery.
            Some(job) if job.status != JobStatus::Queued => {
                info!("[{}] Job is {}, skipping dispatch.", job.id, job.status);
                self.settle(task).await?;
                Ok(None)
            }
            Some(job) => Ok(Some(job)),
        }
    }

    async fn settle(&self, task: &DispatchTask) -> QueueResult<()> {
        self.queue.acknowledge(task).await?;
        metrics::dec_queued();
        Ok(())
    }

    async fn recover(&self, task: &DispatchTask, cause: QueueError) -> QueueResult<()> {
        let failed = task.attempt + 1;
        if self.policy.should_retry(failed) {
            let delay = self.policy.backoff_delay(failed);
            warn!("[{}] Dispatch task error: {}. Retry {}/{} in {:?}", task.job_id, cause, failed, self.policy.max_attempts - 1, delay);
            metrics::inc_retries();
            return self.queue.retry_later(task, delay).await;
        }

        error!("[{}] Dispatch task error after {} attempts: {}", task.job_id, failed, cause);
        if let Err(e) = self.give_up(task, &cause.to_string()).await {
            // The store may be the thing that is down; still take the task out.
            error!("[{}] Could not record failure: {}", task.job_id, e);
            self.queue.dead_letter(task).await?;
            metrics::dec_queued();
        }
        Ok(())
    }

    async fn give_up(&self, task: &DispatchTask, cause: &str) -> QueueResult<()> {
        match self.repo.fail_job(&task.job_id, Transition::Fail, cause).await {
            Ok(_) => metrics::inc_failed(),
            Err(e) if e.is_terminal_conflict() => {
                info!("[{}] Job already terminal, nothing to fail.", task.job_id);
            }
            Err(e) => return Err(e.into()),
        }
        self.queue.dead_letter(task).await?;
        metrics::dec_queued();
        Ok(())
    }
}

/// Seeds the queued gauge from what the queue already holds, so tasks left
/// by a previous instance are counted before workers settle them.
pub async fn sync_queued_gauge(queue: &dyn JobQueue) -> QueueResult<usize> {
    let backlog = queue.backlog().await?;
    metrics::set_queued(backlog);
    Ok(backlog)
}

/// Spawns `policy.concurrency` workers sharing one limiter.
pub fn spawn(worker: Arc<DispatchWorker>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    (0..worker.policy.concurrency.max(1))
        .map(|index| {
            let worker = worker.clone();
            let mut shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                info!("🚚 Dispatch worker {} started.", index);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("🚚 Dispatch worker {} shutting down...", index);
                            break;
                        }
                        result = worker.queue.dequeue() => {
                            match result {
                                Ok(Some(task)) => {
                                    let job_id = task.job_id.clone();
                                    if let Err(e) = worker.handle(task).await {
                                        error!("[{}] Dispatch task error: {}", job_id, e);
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!("Dispatch queue error: {}", e);
                                    tokio::time::sleep(Duration::from_secs(5)).await;
                                }
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

/// Moves backed-off tasks onto the main queue once they are due.
pub fn spawn_promoter(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("⏰ Delayed dispatch promoter started.");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("⏰ Delayed dispatch promoter shutting down...");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match queue.promote_due().await {
                        Ok(0) => {}
                        Ok(count) => info!("Promoted {} delayed dispatch tasks.", count),
                        Err(e) => error!("Delayed dispatch promoter error: {}", e),
                    }
                }
            }
        }
    })
}
