use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Layered application configuration, loaded `base.yaml` + `{environment}.yaml`
/// + environment variables, in the style wired through the reference
/// service's `database.rs::get_connection_pool(&configuration: &Settings)`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub worker: WorkerSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    #[serde(default)]
    pub require_ssl: bool,
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
            .database(&self.database_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: Secret<String>,
    pub namespace: String,
}

/// Timeouts and fleet sizing, overridable per-environment.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "WorkerSettings::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "WorkerSettings::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "WorkerSettings::default_requeue_interval_secs")]
    pub requeue_interval_secs: u64,
    #[serde(default = "WorkerSettings::default_requeue_staleness_secs")]
    pub requeue_staleness_secs: i64,
    #[serde(default = "WorkerSettings::default_requeue_batch_cap")]
    pub requeue_batch_cap: i64,
    #[serde(default = "WorkerSettings::default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "WorkerSettings::default_generation_timeout_secs")]
    pub generation_timeout_secs: i64,
    #[serde(default = "WorkerSettings::default_analysis_timeout_secs")]
    pub analysis_timeout_secs: i64,
    #[serde(default = "WorkerSettings::default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "WorkerSettings::default_auto_retry_enabled")]
    pub auto_retry_enabled: bool,
    #[serde(default = "WorkerSettings::default_account_select_attempts")]
    pub account_select_attempts: u32,
    #[serde(default = "WorkerSettings::default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "WorkerSettings::default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "WorkerSettings::default_cancel_timeout_secs")]
    pub cancel_timeout_secs: u64,
    #[serde(default = "WorkerSettings::default_max_concurrent_jobs_per_user")]
    pub max_concurrent_jobs_per_user: i64,
}

impl WorkerSettings {
    fn default_concurrency() -> usize {
        10
    }
    fn default_poll_interval_secs() -> u64 {
        10
    }
    fn default_requeue_interval_secs() -> u64 {
        30
    }
    fn default_requeue_staleness_secs() -> i64 {
        60
    }
    fn default_requeue_batch_cap() -> i64 {
        10
    }
    fn default_reconcile_interval_secs() -> u64 {
        5 * 60
    }
    fn default_generation_timeout_secs() -> i64 {
        2 * 60 * 60
    }
    fn default_analysis_timeout_secs() -> i64 {
        30 * 60
    }
    fn default_max_retries() -> i32 {
        10
    }
    fn default_auto_retry_enabled() -> bool {
        true
    }
    fn default_account_select_attempts() -> u32 {
        10
    }
    fn default_provider_timeout_secs() -> u64 {
        10
    }
    fn default_download_timeout_secs() -> u64 {
        60
    }
    fn default_cancel_timeout_secs() -> u64 {
        30
    }
    fn default_max_concurrent_jobs_per_user() -> i64 {
        20
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub base_dir: String,
    #[serde(default = "StorageSettings::default_min_free_disk_gb")]
    pub min_free_disk_gb: u64,
    #[serde(default = "StorageSettings::default_verify_provider_uploads")]
    pub verify_provider_uploads: bool,
}

impl StorageSettings {
    fn default_min_free_disk_gb() -> u64 {
        5
    }
    fn default_verify_provider_uploads() -> bool {
        true
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use `local` or `production`."
            )),
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().expect("failed to determine current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("failed to parse APP_ENVIRONMENT");
    let environment_filename = format!("{}.yaml", environment.as_str());

    let settings = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")).required(false))
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
