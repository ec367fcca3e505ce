use crate::configuration::Settings;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error, info};

pub async fn get_connection_pool(configuration: &Settings) -> Result<PgPool, sqlx::Error> {
    info!("creating database connection pool");

    let connect_options = configuration.database.connect_options();

    debug!("attempting to connect to database");

    // Sized for the worker fleet (default 10 workers) plus the HTTP surface
    // and periodic cron tasks, each holding a connection for the duration of
    // a single DB call.
    PgPoolOptions::new()
        .max_connections(20)
        .connect_with(connect_options)
        .await
}

pub async fn migrate_database(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("running database migrations");
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        error!("migration error: {}", e);
        sqlx::Error::Protocol(format!("migration error: {}", e))
    })
}
