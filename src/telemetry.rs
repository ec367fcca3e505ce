use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Mirrors the reference service's
/// `main.rs` setup (`tracing_subscriber::fmt()` with an env filter) but reads
/// the filter from `RUST_LOG` instead of hardcoding a level, so it behaves
/// the same in dev and under a process supervisor.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("genforge=info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
