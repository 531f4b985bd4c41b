//! Bounded pool of reusable control-plane environments: a seat semaphore
//! gates concurrent in-use instances, a mutex-guarded LIFO holds warm idle
//! entries, and a one-shot (retry-on-failure) init builds the optional
//! template artifact.

use crate::config::PoolConfig;
use crate::error::{
    AcquireTimeoutSnafu, CancelledSnafu, ClosedSnafu, PoolError, SeedTemplateSnafu,
    ShutdownErrorsSnafu, StartStackSnafu, StrategySnafu, TemplateSnafu, WorkingDirSnafu,
};
use crate::instance::Instance;
use crate::strategy;
use k8senv_cache::acquire_or_build;
use k8senv_common::port::PortRegistry;
use k8senv_stack::{start_with_retry, Stack, StackConfig, DEFAULT_MAX_ATTEMPTS};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

enum InitState {
    NotStarted,
    Done(Option<PathBuf>),
}

struct WarmEntry {
    id: String,
    stack: Stack,
}

struct PoolState {
    closed: bool,
    warm: Vec<WarmEntry>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    ports: PortRegistry,
    seats: Arc<Semaphore>,
    state: Mutex<PoolState>,
    init: Mutex<InitState>,
    next_id: AtomicU64,
    process_root: CancellationToken,
}

/// A bounded pool of reusable Kubernetes control-plane environments.
///
/// Cheap to clone: all state lives behind the inner `Arc`, mirroring the
/// handle-to-shared-state pattern the rest of this workspace uses.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let seats = Arc::new(Semaphore::new(config.pool_size));
        Self {
            inner: Arc::new(PoolInner {
                ports: PortRegistry::new(),
                seats,
                state: Mutex::new(PoolState {
                    closed: false,
                    warm: Vec::new(),
                }),
                init: Mutex::new(InitState::NotStarted),
                next_id: AtomicU64::new(0),
                process_root: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Idempotent and concurrency-safe: the first call builds the
    /// optional template database; later calls return immediately once it
    /// has succeeded. A failed attempt does not poison the pool — the
    /// next caller retries.
    pub async fn initialize(&self, ctx: CancellationToken) -> Result<(), PoolError> {
        let mut guard = self.inner.init.lock().await;
        if let InitState::Done(_) = &*guard {
            return Ok(());
        }
        let template = self.build_template(&ctx).await?;
        *guard = InitState::Done(template);
        Ok(())
    }

    async fn build_template(&self, ctx: &CancellationToken) -> Result<Option<PathBuf>, PoolError> {
        let manifest_dir = match &self.inner.config.manifest_dir {
            Some(dir) => dir.clone(),
            None => return Ok(None),
        };

        let storage_shim_binary = self.inner.config.storage_shim_binary.clone();
        let api_server_binary = self.inner.config.api_server_binary.clone();
        let factory = move |working_dir: &Path| -> Result<Stack, k8senv_stack::StackError> {
            let config = StackConfig::new(&storage_shim_binary, &api_server_binary, working_dir)
                .expect("pool config already validated non-empty binary paths");
            Ok(Stack::new(config, PortRegistry::new()))
        };

        let path = acquire_or_build(&manifest_dir, &self.inner.config.cache_dir, ctx, &factory)
            .await
            .context(TemplateSnafu)?;
        Ok(Some(path))
    }

    /// Block until a seat is available (or `ctx` gives up), then hand back
    /// a warm instance if one is idle, otherwise provision a fresh one.
    pub async fn acquire(&self, ctx: CancellationToken) -> Result<Instance, PoolError> {
        if self.inner.state.lock().await.closed {
            return ClosedSnafu.fail();
        }

        let permit = self.take_seat(ctx).await?;

        let warm = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(permit);
                return ClosedSnafu.fail();
            }
            state.warm.pop()
        };

        if let Some(WarmEntry { id, stack }) = warm {
            info!(id, "acquired a warm instance");
            return Ok(Instance::new(id, stack, permit, self.inner.clone()));
        }

        self.provision_cold(permit).await
    }

    async fn take_seat(&self, ctx: CancellationToken) -> Result<OwnedSemaphorePermit, PoolError> {
        let semaphore = self.inner.seats.clone();
        let timeout = self.inner.config.acquire_timeout;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => CancelledSnafu.fail(),
            _ = tokio::time::sleep(timeout) => AcquireTimeoutSnafu { timeout }.fail(),
            permit = semaphore.acquire_owned() => {
                Ok(permit.expect("pool semaphore is never closed"))
            }
        }
    }

    async fn provision_cold(&self, permit: OwnedSemaphorePermit) -> Result<Instance, PoolError> {
        let id = format!("instance-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let working_dir = self.inner.config.root_dir.join(&id);
        tokio::fs::create_dir_all(&working_dir)
            .await
            .context(WorkingDirSnafu)?;

        if let Some(template) = self.template_path().await {
            seed_template(&working_dir, &template)
                .await
                .context(SeedTemplateSnafu)?;
        }

        let stack_config = StackConfig::new(
            &self.inner.config.storage_shim_binary,
            &self.inner.config.api_server_binary,
            &working_dir,
        )
        .expect("pool config already validated non-empty binary paths")
        .with_readiness(
            self.inner.config.readiness_poll_interval,
            self.inner.config.readiness_timeout,
        )
        .expect("pool config already validated positive readiness durations")
        .with_stop_timeout(self.inner.config.stop_timeout)
        .expect("pool config already validated positive stop timeout");

        let ports = self.inner.ports.clone();
        let process_root = self.inner.process_root.clone();
        match start_with_retry(DEFAULT_MAX_ATTEMPTS, process_root, CancellationToken::new(), {
            let stack_config = stack_config.clone();
            move || Stack::new(stack_config.clone(), ports.clone())
        })
        .await
        .context(StartStackSnafu)
        {
            Ok(stack) => {
                info!(id, "provisioned a fresh instance");
                Ok(Instance::new(id, stack, permit, self.inner.clone()))
            }
            Err(err) => {
                drop(permit);
                Err(err)
            }
        }
    }

    async fn template_path(&self) -> Option<PathBuf> {
        match &*self.inner.init.lock().await {
            InitState::Done(path) => path.clone(),
            InitState::NotStarted => None,
        }
    }

    /// Mark the pool closed (rejecting further acquires) and stop every
    /// warm instance in parallel, bounded by the configured per-entry
    /// timeout. Errors are joined and returned; shutdown always completes
    /// since the failures it can hit are informational at this point.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let warm = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.warm)
        };
        self.inner.process_root.cancel();

        let timeout = self.inner.config.shutdown_timeout;
        let results = futures::future::join_all(warm.into_iter().map(|entry| async move {
            match tokio::time::timeout(timeout, entry.stack.stop()).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{}: {err}", entry.id)),
                Err(_) => Some(format!("{}: timed out stopping within {timeout:?}", entry.id)),
            }
        }))
        .await;

        let errors: Vec<String> = results.into_iter().flatten().collect();
        if errors.is_empty() {
            Ok(())
        } else {
            let count = errors.len();
            ShutdownErrorsSnafu { count, errors }.fail()
        }
    }

    /// True once [`Pool::shutdown`] has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Seats not currently checked out. Exposed for tests asserting the
    /// bounded-pool backpressure invariant.
    pub fn available_seats(&self) -> usize {
        self.inner.seats.available_permits()
    }

    pub async fn warm_count(&self) -> usize {
        self.inner.state.lock().await.warm.len()
    }
}

async fn seed_template(working_dir: &Path, template: &Path) -> std::io::Result<()> {
    let db_path = working_dir.join("db").join("state.db");
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(template, &db_path).await?;
    Ok(())
}

/// Called by [`Instance::release`] once it has taken ownership of the
/// stack and permit exactly once. Applies the configured release
/// strategy, always returns the seat, and either keeps the instance warm
/// or stops it for good — depending on both the strategy's outcome and
/// whether the pool has since been closed.
pub(crate) async fn finish_release(
    pool: &Arc<PoolInner>,
    id: String,
    stack: Stack,
    permit: OwnedSemaphorePermit,
) -> Result<(), PoolError> {
    let (strategy_result, stack) = strategy::apply(
        pool.config.release_strategy,
        stack,
        pool.ports.clone(),
        pool.process_root.clone(),
    )
    .await;

    // The seat is returned unconditionally: a failed strategy or one that
    // discards the instance must not hold pool capacity hostage.
    drop(permit);

    let keep_warm = match &strategy_result {
        Ok(keep_warm) => *keep_warm,
        Err(err) => {
            warn!(id, %err, "release strategy failed; discarding the instance");
            false
        }
    };

    if keep_warm {
        let mut state = pool.state.lock().await;
        if state.closed {
            drop(state);
            if let Err(err) = stack.stop().await {
                warn!(id, %err, "failed to stop instance while releasing into a closed pool");
            }
        } else {
            state.warm.push(WarmEntry { id, stack });
        }
    } else if let Err(err) = stack.stop().await {
        warn!(id, %err, "failed to stop instance discarded on release");
    }

    strategy_result.map(|_| ()).context(StrategySnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_on_closed_pool_fails() {
        let config = PoolConfig::new(1, "shim", "apiserver", "/tmp/k8senv-pool-test").unwrap();
        let pool = Pool::new(config);
        pool.shutdown().await.unwrap();
        let err = pool.acquire(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn acquire_with_pre_cancelled_context_fails_immediately() {
        let config = PoolConfig::new(1, "shim", "apiserver", "/tmp/k8senv-pool-test").unwrap();
        let pool = Pool::new(config);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = pool.acquire(ctx).await.unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
    }

    /// Pool size 1, seat already held: a second acquire with a short
    /// context deadline returns the deadline error rather than blocking
    /// forever, and releasing the held seat unblocks a waiter.
    #[tokio::test]
    async fn acquire_times_out_while_the_only_seat_is_held() {
        let mut config = PoolConfig::new(1, "shim", "apiserver", "/tmp/k8senv-pool-test").unwrap();
        config = config
            .with_acquire_timeout(std::time::Duration::from_millis(50))
            .unwrap();
        let pool = Pool::new(config);
        let held_permit = pool.inner.seats.clone().acquire_owned().await.unwrap();

        let err = pool.acquire(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));
        assert_eq!(pool.available_seats(), 0);

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move {
            pool_clone
                .inner
                .seats
                .clone()
                .acquire_owned()
                .await
                .unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(held_permit);
        let _unblocked = waiter.await.unwrap();
    }

    /// A second release on the same instance returns the sentinel error
    /// and does not touch pool occupancy, independent of whether the
    /// underlying stack ever ran.
    #[tokio::test]
    async fn double_release_yields_sentinel_and_leaves_occupancy_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig::new(1, "shim", "apiserver", dir.path()).unwrap();
        let pool = Pool::new(config);

        let permit = pool.inner.seats.clone().acquire_owned().await.unwrap();
        let stack_config =
            StackConfig::new("shim", "apiserver", dir.path().join("instance-0")).unwrap();
        let stack = Stack::new(stack_config, pool.inner.ports.clone());
        let instance = Instance::new("instance-0".to_string(), stack, permit, pool.inner.clone());

        let seats_before = pool.available_seats();
        instance.release().await.unwrap();
        let err = instance.release().await.unwrap_err();
        assert!(matches!(err, PoolError::DoubleRelease { .. }));
        assert!(err.is_sentinel());
        assert_eq!(pool.available_seats(), seats_before + 1);
    }
}
