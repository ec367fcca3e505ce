use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus: in-process `tokio::sync::broadcast` for handlers running in
/// this process, bridged to a Redis stream per topic so the status poller
/// and UI surfaces running elsewhere see the same events. Delivery is
/// at-least-once; handlers must be idempotent.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl Topic {
    fn stream_key(self) -> &'static str {
        match self {
            Topic::JobCreated => "genforge:events:job_created",
            Topic::JobStarted => "genforge:events:job_started",
            Topic::JobCompleted => "genforge:events:job_completed",
            Topic::JobFailed => "genforge:events:job_failed",
            Topic::JobCancelled => "genforge:events:job_cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub generation_id: i64,
    pub user_id: i64,
    pub status: String,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    redis: ConnectionManager,
    tx: broadcast::Sender<(Topic, JobEvent)>,
}

impl EventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { redis, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Topic, JobEvent)> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, topic: Topic, event: JobEvent) -> Result<(), EventBusError> {
        // No in-process subscribers is not an error; the Redis bridge is the
        // durable side of this bus.
        let _ = self.tx.send((topic, event.clone()));

        let payload = serde_json::to_string(&event)?;
        let mut conn = self.redis.clone();
        conn.xadd::<_, _, _, _, ()>(topic.stream_key(), "*", &[("payload", payload)])
            .await?;
        Ok(())
    }
}
