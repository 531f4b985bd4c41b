//! Static configuration for a [`crate::Pool`]: binaries, directories, the
//! release strategy, and the timeouts threaded down into every stack it
//! creates.

use snafu::{ensure, Snafu};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum PoolConfigError {
    #[snafu(display("pool size must be at least 1"))]
    ZeroPoolSize,

    #[snafu(display("{field} must not be empty"))]
    EmptyField { field: &'static str },

    #[snafu(display("{field} must be a positive duration, got {value:?}"))]
    NonPositiveDuration {
        field: &'static str,
        value: Duration,
    },
}

/// What happens to a stack when its instance is released back to the
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStrategy {
    /// Stop the stack; the next acquire starts a fresh one. Use when
    /// tests leave behind state that cannot be cleaned up in place.
    Restart,
    /// Keep the stack running; delete all non-system namespaces through
    /// the API before returning the entry to the pool.
    Clean,
    /// Stop the stack, delete user rows directly from the storage file,
    /// and restart it. Bypasses admission and finalizers.
    Purge,
}

/// Everything a [`crate::Pool`] needs: where the binaries live, how big
/// the pool is, and how a released instance is cleaned up.
///
/// Pool size has no sane default and must be supplied; everything else
/// has a default matching [`k8senv_stack::StackConfig`]'s.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub storage_shim_binary: PathBuf,
    pub api_server_binary: PathBuf,
    pub root_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub manifest_dir: Option<PathBuf>,
    pub release_strategy: ReleaseStrategy,
    pub acquire_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub stop_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub fn new(
        pool_size: usize,
        storage_shim_binary: impl Into<PathBuf>,
        api_server_binary: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
    ) -> Result<Self, PoolConfigError> {
        ensure!(pool_size > 0, ZeroPoolSizeSnafu);

        let storage_shim_binary = storage_shim_binary.into();
        let api_server_binary = api_server_binary.into();
        let root_dir = root_dir.into();

        ensure!(
            !storage_shim_binary.as_os_str().is_empty(),
            EmptyFieldSnafu {
                field: "storage_shim_binary"
            }
        );
        ensure!(
            !api_server_binary.as_os_str().is_empty(),
            EmptyFieldSnafu {
                field: "api_server_binary"
            }
        );
        ensure!(
            !root_dir.as_os_str().is_empty(),
            EmptyFieldSnafu { field: "root_dir" }
        );

        let cache_dir = root_dir.join("cache");
        Ok(Self {
            pool_size,
            storage_shim_binary,
            api_server_binary,
            root_dir,
            cache_dir,
            manifest_dir: None,
            release_strategy: ReleaseStrategy::Restart,
            acquire_timeout: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_millis(100),
            readiness_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
        })
    }

    /// Directory of resource manifests applied once to build the template
    /// artifact. Without one, `initialize` is a no-op and every instance
    /// starts from an empty storage file.
    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = Some(dir.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_release_strategy(mut self, strategy: ReleaseStrategy) -> Self {
        self.release_strategy = strategy;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Result<Self, PoolConfigError> {
        ensure!(
            !timeout.is_zero(),
            NonPositiveDurationSnafu {
                field: "acquire_timeout",
                value: timeout,
            }
        );
        self.acquire_timeout = timeout;
        Ok(self)
    }

    pub fn with_readiness(
        mut self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, PoolConfigError> {
        ensure!(
            !poll_interval.is_zero(),
            NonPositiveDurationSnafu {
                field: "readiness_poll_interval",
                value: poll_interval,
            }
        );
        ensure!(
            !timeout.is_zero(),
            NonPositiveDurationSnafu {
                field: "readiness_timeout",
                value: timeout,
            }
        );
        self.readiness_poll_interval = poll_interval;
        self.readiness_timeout = timeout;
        Ok(self)
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Result<Self, PoolConfigError> {
        ensure!(
            !timeout.is_zero(),
            NonPositiveDurationSnafu {
                field: "stop_timeout",
                value: timeout,
            }
        );
        self.stop_timeout = timeout;
        Ok(self)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Result<Self, PoolConfigError> {
        ensure!(
            !timeout.is_zero(),
            NonPositiveDurationSnafu {
                field: "shutdown_timeout",
                value: timeout,
            }
        );
        self.shutdown_timeout = timeout;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_pool_size() {
        let err = PoolConfig::new(0, "shim", "apiserver", "/tmp/k8senv").unwrap_err();
        assert!(matches!(err, PoolConfigError::ZeroPoolSize));
    }

    #[test]
    fn rejects_empty_binary_path() {
        let err = PoolConfig::new(1, "", "apiserver", "/tmp/k8senv").unwrap_err();
        assert!(matches!(err, PoolConfigError::EmptyField { field: "storage_shim_binary" }));
    }

    #[test]
    fn defaults_cache_dir_under_root() {
        let config = PoolConfig::new(2, "shim", "apiserver", "/tmp/k8senv").unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/k8senv/cache"));
    }
}
