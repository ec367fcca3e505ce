use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

/// Durable Redis-list-based task queue, used in place of an `arq` worker.
/// Delivery is at-least-once via `BRPOPLPUSH` into a per-worker processing
/// list: a task is only removed from the processing list after the handler
/// completes, so a crashed worker's in-flight tasks remain recoverable.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("malformed queue payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

const TASKS_KEY: &str = "genforge:queue:tasks";

fn processing_key(worker_id: &str) -> String {
    format!("genforge:queue:processing:{worker_id}")
}

/// The registered task functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", content = "args", rename_all = "snake_case")]
pub enum Task {
    ProcessGeneration { generation_id: i64 },
    ProcessAnalysis { analysis_id: i64 },
}

#[derive(Clone)]
pub struct Queue {
    conn: ConnectionManager,
}

impl Queue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(TASKS_KEY, payload).await?;
        Ok(())
    }

    /// Block up to `timeout_secs` for the next task, moving it atomically
    /// into `worker_id`'s processing list. Returns `None` on timeout.
    pub async fn reserve(&self, worker_id: &str, timeout_secs: f64) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .brpoplpush(TASKS_KEY, processing_key(worker_id), timeout_secs)
            .await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Acknowledge successful handling: remove the task from the processing
    /// list. Must be called exactly once per `reserve` that returned `Some`.
    pub async fn ack(&self, worker_id: &str, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(processing_key(worker_id), 1, payload).await?;
        Ok(())
    }

    /// Recover tasks left behind by a worker that died mid-handling: move
    /// everything in its processing list back onto the main queue. Run once
    /// at startup per configured worker slot.
    pub async fn reclaim_orphaned(&self, worker_id: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0u64;
        loop {
            let item: Option<String> = conn.rpoplpush(processing_key(worker_id), TASKS_KEY).await?;
            match item {
                Some(_) => moved += 1,
                None => break,
            }
        }
        Ok(moved)
    }

    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(TASKS_KEY).await?)
    }
}
