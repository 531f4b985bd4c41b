//! Smoke-test binary: builds a small pool, acquires an instance, creates a
//! namespace through its API server, releases it, and shuts the pool down.
//! Not part of the library's public contract — a manual sanity check the
//! way `control-plane/agents/examples/service` exercises the message bus.

use k8s_openapi::api::core::v1::Namespace;
use k8senv_pool::{Pool, PoolConfig, ReleaseStrategy};
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, StructOpt)]
struct CliArgs {
    /// Path to the storage shim binary (speaks the kine wire protocol).
    #[structopt(long)]
    storage_shim_binary: PathBuf,

    /// Path to the control-plane API server binary.
    #[structopt(long)]
    api_server_binary: PathBuf,

    /// Working directory for instance state; created if missing.
    #[structopt(long, default_value = "/tmp/k8senv-demo")]
    root_dir: PathBuf,

    /// Directory of resource manifests to pre-apply via the template
    /// cache. Omit to start every instance from an empty storage file.
    #[structopt(long)]
    manifest_dir: Option<PathBuf>,

    /// Number of instances the pool may hold concurrently.
    #[structopt(long, default_value = "1")]
    pool_size: usize,
}

#[tokio::main]
async fn main() {
    k8senv_pool::test_support::init_tracing();
    let cli_args = CliArgs::from_args();

    let mut config = PoolConfig::new(
        cli_args.pool_size,
        &cli_args.storage_shim_binary,
        &cli_args.api_server_binary,
        &cli_args.root_dir,
    )
    .expect("invalid pool configuration");
    config = config.with_release_strategy(ReleaseStrategy::Clean);
    if let Some(manifest_dir) = &cli_args.manifest_dir {
        config = config.with_manifest_dir(manifest_dir);
    }

    let pool = Pool::new(config);

    info!("initializing pool");
    pool.initialize(CancellationToken::new())
        .await
        .expect("pool initialization failed");

    info!("acquiring an instance");
    let instance = pool
        .acquire(CancellationToken::new())
        .await
        .expect("acquire failed");
    info!(id = instance.id(), "acquired instance");

    let kubeconfig = kube::config::Kubeconfig::read_from(instance.config().kubeconfig_path())
        .expect("failed to read kubeconfig");
    let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
        .await
        .expect("failed to build client config");
    let client = kube::Client::try_from(client_config).expect("failed to build client");

    let namespaces: Api<Namespace> = Api::all(client);
    let demo_namespace = Namespace {
        metadata: kube::core::ObjectMeta {
            name: Some("k8senv-demo".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let created = namespaces
        .create(&PostParams::default(), &demo_namespace)
        .await
        .expect("failed to create demo namespace");
    info!(name = created.name_any(), "created namespace");

    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("releasing instance");
    instance.release().await.expect("release failed");

    info!("shutting down pool");
    pool.shutdown().await.expect("shutdown failed");
}
