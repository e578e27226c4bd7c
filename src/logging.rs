//! Tracing setup for embedding host programs.

/// Install the global fmt subscriber, writing to stderr with env-filter
/// control (`RUST_LOG`, defaulting to `info`).
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
