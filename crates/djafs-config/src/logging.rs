//! Logging setup shared by the djafs binaries.
//!
//! Filter resolution order: `DJAFS_LOG`, then `RUST_LOG`, then "warn".

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("DJAFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
