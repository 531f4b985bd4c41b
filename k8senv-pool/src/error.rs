//! Pool-level error types.

use snafu::Snafu;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum PoolError {
    #[snafu(display("the pool has been shut down"))]
    Closed,

    #[snafu(display("cancelled while waiting for a seat"))]
    Cancelled,

    #[snafu(display("timed out after {timeout:?} waiting for a seat"))]
    AcquireTimeout { timeout: Duration },

    #[snafu(display("failed to build the template cache entry: {source}"))]
    Template { source: k8senv_cache::CacheError },

    #[snafu(display("failed to create the instance working directory: {source}"))]
    WorkingDir { source: std::io::Error },

    #[snafu(display("failed to seed instance storage from the template artifact: {source}"))]
    SeedTemplate { source: std::io::Error },

    #[snafu(display("failed to start the stack for a new instance: {source}"))]
    StartStack { source: k8senv_stack::RetryError },

    #[snafu(display("release strategy failed: {source}"))]
    Strategy { source: crate::strategy::StrategyError },

    #[snafu(display("instance '{id}' was already released"))]
    DoubleRelease { id: String },

    #[snafu(display(
        "{count} warm instance(s) failed to stop cleanly during shutdown: {}",
        errors.join("; ")
    ))]
    ShutdownErrors { count: usize, errors: Vec<String> },
}

impl PoolError {
    /// True for sentinel errors a caller should match against rather than
    /// log and retry.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, PoolError::Closed | PoolError::DoubleRelease { .. })
    }
}
