use k8senv_pool::{PoolConfig, PoolConfigError, PoolError, ReleaseStrategy};
use std::time::Duration;

#[test]
fn defaults_match_stack_config_defaults() {
    let config = PoolConfig::new(3, "shim", "apiserver", "/tmp/k8senv-pool-basics").unwrap();
    assert_eq!(config.pool_size, 3);
    assert_eq!(config.release_strategy, ReleaseStrategy::Restart);
    assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    assert_eq!(config.readiness_timeout, Duration::from_secs(30));
}

#[test]
fn builder_overrides_are_applied() {
    let config = PoolConfig::new(1, "shim", "apiserver", "/tmp/k8senv-pool-basics")
        .unwrap()
        .with_release_strategy(ReleaseStrategy::Purge)
        .with_manifest_dir("/tmp/k8senv-pool-basics/manifests")
        .with_cache_dir("/tmp/k8senv-pool-basics/my-cache");

    assert_eq!(config.release_strategy, ReleaseStrategy::Purge);
    assert_eq!(
        config.manifest_dir.as_deref(),
        Some(std::path::Path::new("/tmp/k8senv-pool-basics/manifests"))
    );
    assert_eq!(
        config.cache_dir,
        std::path::Path::new("/tmp/k8senv-pool-basics/my-cache")
    );
}

#[test]
fn zero_duration_overrides_are_rejected() {
    let config = PoolConfig::new(1, "shim", "apiserver", "/tmp/k8senv-pool-basics").unwrap();

    let err = config.clone().with_acquire_timeout(Duration::ZERO).unwrap_err();
    assert!(matches!(
        err,
        PoolConfigError::NonPositiveDuration {
            field: "acquire_timeout",
            ..
        }
    ));

    let err = config
        .clone()
        .with_readiness(Duration::ZERO, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(
        err,
        PoolConfigError::NonPositiveDuration {
            field: "readiness_poll_interval",
            ..
        }
    ));

    let err = config.with_stop_timeout(Duration::ZERO).unwrap_err();
    assert!(matches!(
        err,
        PoolConfigError::NonPositiveDuration {
            field: "stop_timeout",
            ..
        }
    ));
}

#[test]
fn sentinel_errors_are_distinguished_from_ordinary_failures() {
    let closed = PoolError::Closed;
    assert!(closed.is_sentinel());

    let double_release = PoolError::DoubleRelease {
        id: "instance-0".to_string(),
    };
    assert!(double_release.is_sentinel());

    let timeout = PoolError::AcquireTimeout {
        timeout: Duration::from_secs(1),
    };
    assert!(!timeout.is_sentinel());
}
