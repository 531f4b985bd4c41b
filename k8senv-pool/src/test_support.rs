//! One-shot tracing init shared by integration tests and the `demos/`
//! binary. Reads `K8SENV_LOG_LEVEL` (default `INFO`), guarded by a
//! [`std::sync::Once`] so parallel tests calling it concurrently only
//! install the global subscriber once.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var("K8SENV_LOG_LEVEL")
            .ok()
            .and_then(|level| EnvFilter::try_new(level).ok())
            .unwrap_or_else(|| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}
