//! Acquire-or-build protocol for the content-addressed artifact cache.

use crate::apply::{self, ApplyError, DEFAULT_PHASE1_PARALLELISM};
use crate::hash::{self, HashError, HashedManifests};
use crate::lock::{self, LockError};
use k8senv_stack::{start_with_retry, RetryError, Stack, StackConfig, StackError, DEFAULT_MAX_ATTEMPTS};
use kube::Client;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Establishment wait falls back to this when the caller gives it no
/// deadline.
const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);
/// Warn once, listing still-pending type names, after this long.
const ESTABLISH_WARN_THRESHOLD: Duration = Duration::from_secs(10);
const ESTABLISH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Snafu)]
pub enum CacheError {
    #[snafu(display("failed to hash manifest directory: {source}"))]
    Hash { source: HashError },

    #[snafu(display("failed to acquire the cache lock: {source}"))]
    Lock { source: LockError },

    #[snafu(display("failed to create temporary build directory: {source}"))]
    TempDir { source: std::io::Error },

    #[snafu(display("failed to start the throwaway stack used to build the cache: {source}"))]
    StackStart { source: RetryError },

    #[snafu(display("failed to stop the throwaway stack after building the cache: {source}"))]
    StackStop { source: StackError },

    #[snafu(display("failed to connect to the throwaway stack's API server: {source}"))]
    Connect { source: kube::Error },

    #[snafu(display("failed to apply manifests to the throwaway stack: {source}"))]
    Apply { source: ApplyError },

    #[snafu(display("timed out after {timeout:?} waiting for {pending} custom resource type(s) to become established"))]
    EstablishTimeout { timeout: Duration, pending: usize },

    #[snafu(display("failed to list custom resource definitions while waiting for establishment: {source}"))]
    ListDefinitions { source: kube::Error },

    #[snafu(display("failed to copy storage file into the cache: {source}"))]
    CopyArtifact { source: std::io::Error },

    #[snafu(display("cancelled while building the cache"))]
    Cancelled,
}

fn cache_file_path(cache_dir: &Path, hash: &str) -> PathBuf {
    cache_dir.join(format!("cached-{hash}.db"))
}

fn lock_file_path(cache_dir: &Path, hash: &str) -> PathBuf {
    cache_dir.join(format!("cached-{hash}.db.lock"))
}

/// How to construct the throwaway stack used to build a fresh cache entry.
/// Kept abstract over `k8senv-cache` so this crate never has to know how
/// `k8senv-pool` names or sizes its working directories.
pub trait ThrowawayStackFactory {
    fn build(&self, working_dir: &Path) -> Result<Stack, StackError>;
}

impl<F> ThrowawayStackFactory for F
where
    F: Fn(&Path) -> Result<Stack, StackError>,
{
    fn build(&self, working_dir: &Path) -> Result<Stack, StackError> {
        self(working_dir)
    }
}

/// Return the path to a cache entry for `manifest_dir`'s content hash,
/// building it first if absent.
pub async fn acquire_or_build(
    manifest_dir: &Path,
    cache_dir: &Path,
    cancel: &CancellationToken,
    stack_factory: &dyn ThrowawayStackFactory,
) -> Result<PathBuf, CacheError> {
    let HashedManifests { hash, files } = hash::hash_directory(manifest_dir).context(HashSnafu)?;
    let cache_path = cache_file_path(cache_dir, &hash);

    if cache_path.exists() {
        info!(%hash, "cache hit");
        return Ok(cache_path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .context(TempDirSnafu)?;
    let lock_path = lock_file_path(cache_dir, &hash);
    let _lock = lock::acquire(&lock_path, cancel).await.context(LockSnafu)?;

    // Double-checked: another process may have built this while we waited
    // for the lock.
    if cache_path.exists() {
        info!(%hash, "cache hit after acquiring lock");
        return Ok(cache_path);
    }
    if cancel.is_cancelled() {
        return CancelledSnafu.fail();
    }

    info!(%hash, files = files.len(), "building cache entry");
    build_cache_entry(&files, &cache_path, cancel, stack_factory).await?;
    Ok(cache_path)
}

async fn build_cache_entry(
    files: &std::collections::BTreeMap<PathBuf, String>,
    cache_path: &Path,
    cancel: &CancellationToken,
    stack_factory: &dyn ThrowawayStackFactory,
) -> Result<(), CacheError> {
    let build_dir = tempfile::Builder::new()
        .prefix("k8senv-cache-build-")
        .tempdir()
        .context(TempDirSnafu)?;

    let stack = start_with_retry(DEFAULT_MAX_ATTEMPTS, cancel.clone(), cancel.clone(), || {
        stack_factory
            .build(build_dir.path())
            .expect("throwaway stack factory is deterministic and already validated")
    })
    .await
    .context(StackStartSnafu)?;

    let result = apply_and_wait(&stack, files, cancel).await;

    // Stop flushes the storage file's writes to disk before we copy it,
    // regardless of whether apply succeeded.
    stack.stop().await.context(StackStopSnafu)?;

    result?;

    let db_path = stack.config().db_path();
    atomic_copy(&db_path, cache_path).await.context(CopyArtifactSnafu)?;
    Ok(())
}

async fn apply_and_wait(
    stack: &Stack,
    files: &std::collections::BTreeMap<PathBuf, String>,
    cancel: &CancellationToken,
) -> Result<(), CacheError> {
    let kubeconfig = kube::config::Kubeconfig::read_from(stack.kubeconfig_path())
        .map_err(|err| CacheError::Connect {
            source: kube::Error::Kubeconfig(err),
        })?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
        .await
        .context(ConnectSnafu)?;
    let client = Client::try_from(config).context(ConnectSnafu)?;

    apply::apply_manifests(&client, files, DEFAULT_PHASE1_PARALLELISM)
        .await
        .context(ApplySnafu)?;

    wait_for_establishment(&client, cancel).await
}

async fn wait_for_establishment(
    client: &Client,
    cancel: &CancellationToken,
) -> Result<(), CacheError> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, ListParams};

    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let deadline = tokio::time::Instant::now() + DEFAULT_ESTABLISH_TIMEOUT;
    let warn_at = tokio::time::Instant::now() + ESTABLISH_WARN_THRESHOLD;
    let mut warned = false;

    loop {
        if cancel.is_cancelled() {
            return CancelledSnafu.fail();
        }

        let list = api
            .list(&ListParams::default())
            .await
            .context(ListDefinitionsSnafu)?;
        let pending: Vec<String> = list
            .items
            .iter()
            .filter(|crd| !is_established(crd))
            .filter_map(|crd| crd.metadata.name.clone())
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return EstablishTimeoutSnafu {
                timeout: DEFAULT_ESTABLISH_TIMEOUT,
                pending: pending.len(),
            }
            .fail();
        }
        if !warned && tokio::time::Instant::now() >= warn_at {
            warned = true;
            warn!(?pending, "still waiting for custom resource types to establish");
        }

        tokio::select! {
            _ = tokio::time::sleep(ESTABLISH_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
        }
    }
}

fn is_established(
    crd: &k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Established" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Copy `src` to `dst` via a temp sibling + fsync + rename, so a reader
/// never observes a partially written cache file.
async fn atomic_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    let dir = dst.parent().expect("cache path always has a parent");
    let tmp_path = dir.join(format!(
        ".tmp-copy-{}",
        uuid_like_suffix()
    ));

    {
        let mut reader = tokio::fs::File::open(src).await?;
        let mut writer = tokio::fs::File::create(&tmp_path).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, dst).await?;
    Ok(())
}

fn uuid_like_suffix() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_uses_hash() {
        let path = cache_file_path(Path::new("/tmp/cache"), "abcd1234abcd1234");
        assert_eq!(path, Path::new("/tmp/cache/cached-abcd1234abcd1234.db"));
    }

    #[test]
    fn lock_path_is_sibling_of_cache_path() {
        let path = lock_file_path(Path::new("/tmp/cache"), "abcd1234abcd1234");
        assert_eq!(
            path,
            Path::new("/tmp/cache/cached-abcd1234abcd1234.db.lock")
        );
    }
}
