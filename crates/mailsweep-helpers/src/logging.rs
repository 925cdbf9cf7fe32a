use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber.
///
/// Filter directives are resolved from `env_key` first, then `RUST_LOG`,
/// falling back to `default_filter` when neither is set. This is a
/// foreground CLI tool rather than a unix daemon, so there is no
/// journald layer to fall back to.
pub fn init_logging(default_filter: &str, env_key: &str) {
    let env_filter = build_env_filter(default_filter, env_key);
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}

fn build_env_filter(default_filter: &str, env_key: &str) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}
