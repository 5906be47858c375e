use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::DispatchTask;

pub type QueueError = Box<dyn std::error::Error + Send + Sync>;
pub type QueueResult<T> = Result<T, QueueError>;

/// Durable dispatch queue. Dequeued tasks stay in a processing list until
/// they are acknowledged, retried or dead-lettered, so a crash mid-dispatch
/// never loses a job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, task: DispatchTask) -> QueueResult<()>;
    async fn dequeue(&self) -> QueueResult<Option<DispatchTask>>;
    async fn acknowledge(&self, task: &DispatchTask) -> QueueResult<()>;
    /// Moves `task` out of processing and re-queues it with `attempt + 1`
    /// once `delay` has passed.
    async fn retry_later(&self, task: &DispatchTask, delay: Duration) -> QueueResult<()>;
    /// Moves due delayed tasks back onto the main queue.
    async fn promote_due(&self) -> QueueResult<usize>;
    async fn dead_letter(&self, task: &DispatchTask) -> QueueResult<()>;
    async fn restore_stranded(&self) -> QueueResult<usize>;
    /// Tasks still to be dispatched: main queue plus delayed retries.
    async fn backlog(&self) -> QueueResult<usize>;
    async fn ping(&self) -> QueueResult<()>;
}

// --- REDIS IMPLEMENTATION ---
pub struct RedisQueue {
    client: redis::Client,
    queue_name: String,
    processing_queue_name: String,
    delayed_set_name: String,
    dlq_name: String,
}

impl RedisQueue {
    pub fn new(url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            queue_name: "pitchside:dispatch".to_string(),
            processing_queue_name: "pitchside:dispatch:processing".to_string(),
            delayed_set_name: "pitchside:dispatch:delayed".to_string(),
            dlq_name: "pitchside:dispatch:dlq".to_string(),
        })
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, task: DispatchTask) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&task)?;

        // LPUSH: Push to the left side of the list
        let _: () = conn.lpush(&self.queue_name, payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> QueueResult<Option<DispatchTask>> {
        let mut conn = self.connection().await?;

        // Blocking with a short timeout so callers can observe shutdown.
        let payload: Option<String> = conn
            .brpoplpush(&self.queue_name, &self.processing_queue_name, 1.0)
            .await?;

        match payload {
            Some(payload_str) => match serde_json::from_str::<DispatchTask>(&payload_str) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    warn!("Poison pill in dispatch queue: {}. Moving to DLQ.", e);
                    let _: () = redis::pipe()
                        .atomic()
                        .lrem(&self.processing_queue_name, 1, &payload_str)
                        .lpush(&self.dlq_name, &payload_str)
                        .query_async(&mut conn)
                        .await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn acknowledge(&self, task: &DispatchTask) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        // We must use the exact string representation to remove it.
        let payload = serde_json::to_string(task)?;
        let removed: i64 = conn.lrem(&self.processing_queue_name, 1, payload).await?;

        if removed == 0 {
            warn!("Could not acknowledge dispatch task for job {}. It might have been already removed.", task.job_id);
        }
        Ok(())
    }

    async fn retry_later(&self, task: &DispatchTask, delay: Duration) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task)?;
        let next = serde_json::to_string(&task.next_attempt())?;
        let due = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing_queue_name, 1, payload)
            .zadd(&self.delayed_set_name, next, due)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let now = chrono::Utc::now().timestamp_millis();

        let due: Vec<String> = conn.zrangebyscore(&self.delayed_set_name, "-inf", now).await?;
        let mut promoted = 0;

        for payload in due {
            // ZREM decides the winner when several instances promote at once.
            let removed: i64 = conn.zrem(&self.delayed_set_name, &payload).await?;
            if removed == 1 {
                let _: () = conn.lpush(&self.queue_name, &payload).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn dead_letter(&self, task: &DispatchTask) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task)?;

        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing_queue_name, 1, &payload)
            .lpush(&self.dlq_name, &payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn restore_stranded(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let mut count = 0;

        loop {
            let item: Option<String> = conn
                .rpoplpush(&self.processing_queue_name, &self.queue_name)
                .await?;
            match item {
                Some(_) => count += 1,
                None => break, // List is empty
            }
        }

        if count > 0 {
            info!("Restored {} stranded dispatch tasks from '{}'", count, self.processing_queue_name);
        }
        Ok(count)
    }

    async fn backlog(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let (waiting, delayed): (usize, usize) = redis::pipe()
            .llen(&self.queue_name)
            .zcard(&self.delayed_set_name)
            .query_async(&mut conn)
            .await?;
        Ok(waiting + delayed)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
