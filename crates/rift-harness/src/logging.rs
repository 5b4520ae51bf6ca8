//! Test logging setup.

use tracing_subscriber::EnvFilter;

/// Filter directives for harness logs; falls back to `RUST_LOG`, then `warn`.
pub const ENV_LOG: &str = "RIFT_HARNESS_LOG";

/// Install a `tracing` subscriber that writes through the test harness's
/// captured output. Safe to call from every test; only the first call wins.
pub fn init_test_logging() {
    let directives = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
