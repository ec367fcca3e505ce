use clap::{Parser, Subcommand};
use genforge::adapters::Registry;
use genforge::configuration::get_configuration;
use genforge::database::get_connection_pool;
use genforge::queue::{Queue, Task};
use genforge::services::account_pool::AccountPool;
use genforge::services::billing::BillingFinalizer;
use genforge::services::retry::RetryController;
use genforge::telemetry::init_tracing;
use std::time::Duration;
use tracing::info;

/// Administrative CLI for operating a running genforge deployment: the
/// knobs an operator reaches for outside the HTTP API.
#[derive(Parser, Debug)]
#[command(name = "genforgectl", about = "Operate a genforge deployment")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Force-cancel a generation regardless of its current status.
    Cancel { generation_id: i64 },
    /// Create a linked retry for a terminal generation.
    Retry { generation_id: i64 },
    /// Recompute `current_processing_jobs` from actual in-flight work.
    ReconcileCounters,
    /// Re-enqueue PENDING generations the workers never picked up.
    RequeueStale {
        #[arg(long, default_value_t = 60)]
        staleness_secs: i64,
        #[arg(long, default_value_t = 100)]
        batch_cap: i64,
    },
    /// Print the current durable queue depth.
    QueueDepth,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let configuration = get_configuration()?;
    let pool = get_connection_pool(&configuration).await?;

    let redis_client = redis::Client::open(
        secrecy::ExposeSecret::expose_secret(&configuration.redis.url).as_str(),
    )?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let queue = Queue::new(redis_conn);

    let cli = Cli::parse();

    match cli.command {
        Command::Cancel { generation_id } => {
            let account_pool = AccountPool::new(pool.clone());
            let rows = sqlx::query_as::<_, genforge::domain::Generation>(
                "UPDATE generations SET status = 'CANCELLED', completed_at = now(), updated_at = now() WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED') RETURNING *",
            )
            .bind(generation_id)
            .fetch_optional(&pool)
            .await?;

            match rows {
                Some(generation) => {
                    if let Some(account_id) = generation.account_id {
                        account_pool.release_account(account_id).await?;
                    }
                    let registry = Registry::bootstrap(Duration::from_secs(configuration.worker.provider_timeout_secs));
                    let billing = BillingFinalizer::new(pool.clone(), registry, account_pool);
                    billing.finalize_billing(&generation, None, None).await;
                    info!(generation_id, "cancelled");
                }
                None => println!("generation {generation_id} was already terminal or does not exist"),
            }
        }
        Command::Retry { generation_id } => {
            let retry = RetryController::new(
                pool.clone(),
                queue,
                configuration.worker.max_retries,
                configuration.worker.auto_retry_enabled,
            );
            let created = retry.create_retry(generation_id).await?;
            println!("created retry generation {}", created.id);
        }
        Command::ReconcileCounters => {
            let account_pool = AccountPool::new(pool.clone());
            let changed = account_pool.reconcile_counters().await?;
            println!("reconciled {changed} account counter(s)");
        }
        Command::RequeueStale { staleness_secs, batch_cap } => {
            let stale: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM generations
                WHERE status = 'PENDING' AND created_at < now() - ($1 || ' seconds')::interval
                ORDER BY created_at ASC
                LIMIT $2
                "#,
            )
            .bind(staleness_secs.to_string())
            .bind(batch_cap)
            .fetch_all(&pool)
            .await?;

            let mut requeued = 0;
            for generation_id in stale {
                queue.enqueue(&Task::ProcessGeneration { generation_id }).await?;
                requeued += 1;
            }
            println!("requeued {requeued} stale pending generation(s)");
        }
        Command::QueueDepth => {
            println!("{}", queue.depth().await?);
        }
    }

    Ok(())
}
