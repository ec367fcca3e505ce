use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::configuration::WorkerSettings;
use crate::queue::{Queue, Task};
use crate::services::account_pool::AccountPool;
use crate::services::poller::StatusPoller;
use crate::services::submission::SubmissionPipeline;

/// Worker fleet bootstrap: N tokio tasks consuming the durable queue, plus a
/// handful of `tokio::time::interval` cron loops, all cooperative with a
/// `tokio::sync::watch` shutdown signal.
pub struct WorkerFleet {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerFleet {
    pub async fn spawn(
        pool: PgPool,
        queue: Queue,
        submission: SubmissionPipeline,
        poller: StatusPoller,
        account_pool: AccountPool,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        if let Err(e) = account_pool.reconcile_counters().await {
            warn!(error = %e, "startup account-counter reconciliation failed");
        }

        for worker_id in 0..settings.concurrency {
            let worker_name = format!("worker-{worker_id}");
            if let Err(e) = queue.reclaim_orphaned(&worker_name).await {
                warn!(worker = worker_name, error = %e, "failed to reclaim orphaned tasks");
            }
            let queue = queue.clone();
            let submission = submission.clone();
            let pool = pool.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_worker_loop(worker_name, queue, submission, pool, &mut shutdown_rx).await;
            }));
        }

        handles.push(spawn_interval(
            "poll_job_statuses",
            Duration::from_secs(settings.poll_interval_secs),
            shutdown_rx.clone(),
            {
                let poller = poller.clone();
                move || {
                    let poller = poller.clone();
                    async move {
                        let n = poller.poll_job_statuses().await;
                        if n > 0 {
                            debug!(n, "polled processing generations");
                        }
                    }
                }
            },
        ));

        handles.push(spawn_interval(
            "poll_analysis_timeouts",
            Duration::from_secs(settings.poll_interval_secs),
            shutdown_rx.clone(),
            {
                let poller = poller.clone();
                move || {
                    let poller = poller.clone();
                    async move {
                        poller.poll_analysis_timeouts().await;
                    }
                }
            },
        ));

        handles.push(spawn_interval(
            "requeue_pending_generations",
            Duration::from_secs(settings.requeue_interval_secs),
            shutdown_rx.clone(),
            {
                let poller = poller.clone();
                let queue = queue.clone();
                let staleness = settings.requeue_staleness_secs;
                let batch_cap = settings.requeue_batch_cap;
                move || {
                    let poller = poller.clone();
                    let queue = queue.clone();
                    async move {
                        let n = poller.requeue_pending_generations(&queue, staleness, batch_cap).await;
                        if n > 0 {
                            info!(n, "requeued stale pending generations");
                        }
                    }
                }
            },
        ));

        handles.push(spawn_interval(
            "requeue_pending_analyses",
            Duration::from_secs(settings.requeue_interval_secs),
            shutdown_rx.clone(),
            {
                let poller = poller.clone();
                let queue = queue.clone();
                let batch_cap = settings.requeue_batch_cap;
                move || {
                    let poller = poller.clone();
                    let queue = queue.clone();
                    async move {
                        poller.requeue_pending_analyses(&queue, batch_cap).await;
                    }
                }
            },
        ));

        handles.push(spawn_interval(
            "reconcile_account_counters",
            Duration::from_secs(settings.reconcile_interval_secs),
            shutdown_rx.clone(),
            {
                let account_pool = account_pool.clone();
                move || {
                    let account_pool = account_pool.clone();
                    async move {
                        if let Err(e) = account_pool.reconcile_counters().await {
                            warn!(error = %e, "account-counter reconciliation failed");
                        }
                    }
                }
            },
        ));

        handles.push(spawn_interval(
            "update_heartbeat",
            Duration::from_secs(15),
            shutdown_rx.clone(),
            {
                let pool = pool.clone();
                move || {
                    let pool = pool.clone();
                    async move {
                        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
                            warn!(error = %e, "heartbeat database check failed");
                        } else {
                            debug!("heartbeat");
                        }
                    }
                }
            },
        ));

        Self { handles, shutdown_tx }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker_loop(
    worker_name: String,
    queue: Queue,
    submission: SubmissionPipeline,
    pool: PgPool,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let reserved = tokio::select! {
            result = queue.reserve(&worker_name, 5.0) => result,
            _ = shutdown_rx.changed() => return,
        };

        let task = match reserved {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = worker_name, error = %e, "queue reserve failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match &task {
            Task::ProcessGeneration { generation_id } => {
                if let Err(e) = submission.process_generation(*generation_id).await {
                    warn!(worker = worker_name, generation_id, error = %e, "process_generation failed, will retry via requeue sweep");
                }
            }
            Task::ProcessAnalysis { analysis_id } => {
                if let Err(e) = process_analysis(&pool, *analysis_id).await {
                    warn!(worker = worker_name, analysis_id, error = %e, "process_analysis failed");
                }
            }
        }

        if let Err(e) = queue.ack(&worker_name, &task).await {
            warn!(worker = worker_name, error = %e, "failed to ack completed task");
        }
    }
}

/// Analogous to `process_generation` for the Analysis sibling path: marks
/// the row PROCESSING so the timeout sweep can track it. `Analysis` carries
/// no provider linkage, so there is no adapter dispatch here, only the
/// state transition.
async fn process_analysis(pool: &PgPool, analysis_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE analyses SET status = 'PROCESSING', started_at = now() WHERE id = $1 AND status = 'PENDING'",
    )
    .bind(analysis_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn spawn_interval<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut make_tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    make_tick().await;
                }
                _ = shutdown_rx.changed() => {
                    info!(task = name, "cron task shutting down");
                    return;
                }
            }
        }
    })
}
