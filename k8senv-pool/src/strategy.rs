//! Release-strategy dispatch: what happens to a stack when the instance
//! wrapping it is released back to the pool.

use crate::config::ReleaseStrategy;
use crate::storage::{self, StorageError};
use k8s_openapi::api::core::v1::Namespace;
use k8senv_common::namespaces::is_system_namespace;
use k8senv_common::port::PortRegistry;
use k8senv_stack::{start_with_retry, RetryError, Stack, StackError, DEFAULT_MAX_ATTEMPTS};
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum StrategyError {
    #[snafu(display("failed to connect to the instance's API server: {source}"))]
    Connect { source: kube::Error },

    #[snafu(display("failed to list namespaces during clean release: {source}"))]
    ListNamespaces { source: kube::Error },

    #[snafu(display("failed to stop the stack before purge: {source}"))]
    StopForPurge { source: StackError },

    #[snafu(display("failed to restart the stack after purge: {source}"))]
    RestartAfterPurge { source: RetryError },

    #[snafu(display("failed to stop the stack on restart release: {source}"))]
    StopForRestart { source: StackError },

    #[snafu(display("failed to inspect or modify the storage file during purge: {source}"))]
    Storage { source: StorageError },
}

/// Apply `strategy` to a released stack. Returns whether the instance
/// should be kept warm (stack left running, pushed back into the pool) or
/// discarded (stack stopped; the next acquire starts a fresh one), plus
/// the stack to keep using from here on — `purge` restarts through the
/// bounded-retry wrapper, which hands back a freshly provisioned `Stack`
/// rather than restarting the one passed in. The stack is always handed
/// back, success or failure, so the caller can stop it either way.
pub(crate) async fn apply(
    strategy: ReleaseStrategy,
    stack: Stack,
    ports: PortRegistry,
    process_root: CancellationToken,
) -> (Result<bool, StrategyError>, Stack) {
    match strategy {
        ReleaseStrategy::Restart => restart(stack).await,
        ReleaseStrategy::Clean => clean(stack).await,
        ReleaseStrategy::Purge => purge(stack, ports, process_root).await,
    }
}

async fn connect(stack: &Stack) -> Result<Client, StrategyError> {
    let kubeconfig =
        kube::config::Kubeconfig::read_from(stack.kubeconfig_path()).map_err(|err| {
            StrategyError::Connect {
                source: kube::Error::Kubeconfig(err),
            }
        })?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
        .await
        .context(ConnectSnafu)?;
    Client::try_from(config).context(ConnectSnafu)
}

async fn restart(stack: Stack) -> (Result<bool, StrategyError>, Stack) {
    let result = stack.stop().await.context(StopForRestartSnafu).map(|_| false);
    (result, stack)
}

async fn clean(stack: Stack) -> (Result<bool, StrategyError>, Stack) {
    let client = match connect(&stack).await {
        Ok(client) => client,
        Err(err) => return (Err(err), stack),
    };
    let api: Api<Namespace> = Api::all(client);
    let list = match api.list(&ListParams::default()).await.context(ListNamespacesSnafu) {
        Ok(list) => list,
        Err(err) => return (Err(err), stack),
    };
    let user_namespaces: Vec<String> = list
        .items
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .filter(|name| !is_system_namespace(name))
        .collect();

    if user_namespaces.is_empty() {
        debug!("clean release: no user namespaces, nothing to do");
        return (Ok(true), stack);
    }

    for namespace in &user_namespaces {
        if let Err(err) = api.delete(namespace, &DeleteParams::default()).await {
            warn!(namespace, %err, "failed to delete namespace during clean release");
        }
    }
    (Ok(true), stack)
}

/// Stops `stack`, purges user-written keys from its storage file, and
/// restarts via the bounded-retry wrapper. On any failure the stack handed
/// back is whichever instance is still valid to stop — the original if the
/// restart itself never happened or never succeeded, never one lost to an
/// early return.
async fn purge(
    stack: Stack,
    ports: PortRegistry,
    process_root: CancellationToken,
) -> (Result<bool, StrategyError>, Stack) {
    let db_path = stack.config().db_path();

    match storage::has_user_keys(&db_path).await.context(StorageSnafu) {
        Ok(false) => {
            debug!("purge release: no user keys, nothing to do");
            return (Ok(true), stack);
        }
        Ok(true) => {}
        Err(err) => return (Err(err), stack),
    }

    if let Err(err) = stack.stop().await.context(StopForPurgeSnafu) {
        return (Err(err), stack);
    }

    let deleted = match storage::purge_user_keys(&db_path).await.context(StorageSnafu) {
        Ok(deleted) => deleted,
        Err(err) => return (Err(err), stack),
    };
    debug!(deleted, "purged user keys from storage file");

    let config = stack.config().clone();
    match start_with_retry(DEFAULT_MAX_ATTEMPTS, process_root, CancellationToken::new(), {
        move || Stack::new(config.clone(), ports.clone())
    })
    .await
    {
        Ok(restarted) => (Ok(true), restarted),
        Err(err) => (Err(StrategyError::RestartAfterPurge { source: err }), stack),
    }
}
