use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Outbound frame buffer per connection. Frames beyond it are dropped.
pub const CONNECTION_BUFFER: usize = 64;

#[derive(Serialize)]
struct LiveFrame<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

pub fn live_json<T: Serialize>(event: &str, data: T) -> String {
    serde_json::to_string(&LiveFrame { event, data }).unwrap_or_default()
}

type Group = HashMap<Uuid, mpsc::Sender<String>>;

/// Per-job subscription groups for live clients. Publishing never blocks
/// and never buffers for absent subscribers.
#[derive(Default)]
pub struct BroadcastHub {
    groups: RwLock<HashMap<String, Group>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, job_id: &str, conn_id: Uuid, tx: mpsc::Sender<String>) {
        let mut groups = self.groups.write().await;
        groups.entry(job_id.to_string()).or_default().insert(conn_id, tx);
    }

    /// Returns whether the connection was a member.
    pub async fn leave(&self, job_id: &str, conn_id: Uuid) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(job_id) else {
            return false;
        };
        let removed = group.remove(&conn_id).is_some();
        if group.is_empty() {
            groups.remove(job_id);
        }
        removed
    }

    /// Drops the connection from every group it joined.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let mut groups = self.groups.write().await;
        groups.retain(|_, group| {
            group.remove(&conn_id);
            !group.is_empty()
        });
    }

    /// Fans `payload` out to the job's group. Returns the number of
    /// connections the frame was handed to.
    pub async fn publish<T: Serialize>(&self, job_id: &str, event: &str, payload: T) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let groups = self.groups.read().await;
            let Some(group) = groups.get(job_id) else {
                return 0;
            };

            let frame = live_json(event, payload);
            for (conn_id, tx) in group {
                match tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("[{}] Live client {} is lagging, dropped {}", job_id, conn_id, event);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*conn_id),
                }
            }
        }

        if !closed.is_empty() {
            let mut groups = self.groups.write().await;
            if let Some(group) = groups.get_mut(job_id) {
                for conn_id in &closed {
                    group.remove(conn_id);
                }
                if group.is_empty() {
                    groups.remove(job_id);
                }
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self, job_id: &str) -> usize {
        self.groups.read().await.get(job_id).map_or(0, |g| g.len())
    }
}
