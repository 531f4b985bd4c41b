//! A stack: one storage shim + one API server, started together and
//! observed together.

use crate::authfiles::{self, AuthFilesError};
use crate::config::StackConfig;
use crate::kubeconfig::{self, KubeconfigError};
use k8senv_common::port::{PortError, PortRegistry};
use k8senv_process::handle::{ProcessCommand, ProcessError, ProcessHandle};
use k8senv_process::readiness::{wait_ready, ProbeOutcome, ReadinessError};
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Snafu)]
pub enum StackError {
    #[snafu(display("failed to create working directory: {source}"))]
    WorkingDir { source: std::io::Error },

    #[snafu(display("failed to allocate a port pair: {source}"))]
    PortAllocation { source: PortError },

    #[snafu(display("failed to prepare authentication files: {source}"))]
    AuthFiles { source: AuthFilesError },

    #[snafu(display("failed to write kubeconfig: {source}"))]
    Kubeconfig { source: KubeconfigError },

    #[snafu(display("failed to start the storage shim: {source}"))]
    StartStorageShim { source: ProcessError },

    #[snafu(display("failed to start the API server: {source}"))]
    StartApiServer { source: ProcessError },

    #[snafu(display("storage shim never became ready: {source}"))]
    StorageShimNotReady { source: ReadinessError },

    #[snafu(display("API server never became ready: {source}"))]
    ApiServerNotReady { source: ReadinessError },

    #[snafu(display("failed to stop the storage shim: {source}"))]
    StopStorageShim { source: ProcessError },

    #[snafu(display("failed to stop the API server: {source}"))]
    StopApiServer { source: ProcessError },

    #[snafu(display("the stack is already started"))]
    AlreadyStarted,

    #[snafu(display("start was cancelled before the stack became ready"))]
    Cancelled,
}

impl StackError {
    /// True for errors the retry wrapper should never retry: configuration
    /// problems, missing binaries, permission failures, a programming
    /// error (already started), or the caller giving up.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StackError::AlreadyStarted
                | StackError::Cancelled
                | StackError::AuthFiles { .. }
                | StackError::Kubeconfig { .. }
                | StackError::WorkingDir { .. }
        ) || matches!(
            self,
            StackError::StartStorageShim { source } | StackError::StartApiServer { source }
                if is_permanent_process_error(source)
        )
    }
}

fn is_permanent_process_error(err: &ProcessError) -> bool {
    matches!(
        err,
        ProcessError::Spawn { .. } | ProcessError::AlreadyStarted { .. } | ProcessError::LogFile { .. }
    )
}

enum State {
    NotStarted,
    Running {
        storage_port: u16,
        api_port: u16,
        token: String,
    },
    Stopped,
}

/// Coordinates one storage-shim + API-server pair. Not safe for concurrent
/// calls on the same instance; the owning instance serializes `start`/`stop`.
pub struct Stack {
    config: StackConfig,
    ports: PortRegistry,
    storage: ProcessHandle,
    api: ProcessHandle,
    state: Mutex<State>,
}

impl Stack {
    pub fn new(config: StackConfig, ports: PortRegistry) -> Self {
        Self {
            config,
            ports,
            storage: ProcessHandle::new("storage-shim"),
            api: ProcessHandle::new("api-server"),
            state: Mutex::new(State::NotStarted),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Current kubeconfig path, valid regardless of whether the stack is
    /// currently running (it is computed at start and left on disk).
    pub fn kubeconfig_path(&self) -> std::path::PathBuf {
        self.config.kubeconfig_path()
    }

    pub async fn bearer_token(&self) -> Option<String> {
        match &*self.state.lock().await {
            State::Running { token, .. } => Some(token.clone()),
            _ => None,
        }
    }

    /// Start the storage shim and API server and wait for both to become
    /// ready.
    ///
    /// `process_ctx` bounds the lifetime of the spawned OS processes (its
    /// cancellation is checked before any process is spawned); `ready_ctx`
    /// bounds only how long this call waits for readiness.
    pub async fn start(
        &self,
        process_ctx: CancellationToken,
        ready_ctx: CancellationToken,
    ) -> Result<(), StackError> {
        {
            let state = self.state.lock().await;
            if matches!(&*state, State::Running { .. }) {
                return AlreadyStartedSnafu.fail();
            }
        }
        if process_ctx.is_cancelled() || ready_ctx.is_cancelled() {
            return CancelledSnafu.fail();
        }

        tokio::fs::create_dir_all(self.config.db_path().parent().unwrap())
            .await
            .context(WorkingDirSnafu)?;

        let (storage_port, api_port) = self
            .ports
            .allocate_pair()
            .await
            .context(PortAllocationSnafu)?;

        let token = match self
            .start_inner(storage_port, api_port, process_ctx, ready_ctx)
            .await
        {
            Ok(token) => token,
            Err(err) => {
                self.teardown_after_failed_start().await;
                self.ports.release(storage_port);
                self.ports.release(api_port);
                return Err(err);
            }
        };

        let mut state = self.state.lock().await;
        *state = State::Running {
            storage_port,
            api_port,
            token,
        };
        Ok(())
    }

    async fn start_inner(
        &self,
        storage_port: u16,
        api_port: u16,
        process_ctx: CancellationToken,
        ready_ctx: CancellationToken,
    ) -> Result<String, StackError> {
        let token = authfiles::generate_token();
        authfiles::write_token_file(&self.config, &token)
            .await
            .context(AuthFilesSnafu)?;
        authfiles::write_anonymous_auth_config(&self.config)
            .await
            .context(AuthFilesSnafu)?;
        authfiles::write_service_account_key(&self.config)
            .await
            .context(AuthFilesSnafu)?;
        kubeconfig::write(&self.config.kubeconfig_path(), api_port, &token)
            .await
            .context(KubeconfigSnafu)?;

        if process_ctx.is_cancelled() {
            return CancelledSnafu.fail();
        }

        self.storage
            .start(
                self.storage_command(storage_port),
                &self.config.working_dir,
            )
            .await
            .context(StartStorageShimSnafu)?;
        self.api
            .start(
                self.api_server_command(storage_port, api_port),
                &self.config.working_dir,
            )
            .await
            .context(StartApiServerSnafu)?;

        let sub_ctx = ready_ctx.child_token();
        let storage_exited = self
            .storage
            .exited()
            .await
            .expect("storage shim was just started");
        let api_exited = self
            .api
            .exited()
            .await
            .expect("API server was just started");

        let storage_ready = wait_ready(
            self.config.readiness_poll_interval,
            self.config.readiness_timeout,
            sub_ctx.clone(),
            storage_exited,
            {
                let port = storage_port;
                move || storage_probe(port)
            },
        );
        let api_ready = wait_ready(
            self.config.readiness_poll_interval,
            self.config.readiness_timeout,
            sub_ctx.clone(),
            api_exited,
            {
                let port = api_port;
                move || api_probe(port)
            },
        );

        let (storage_result, api_result) = tokio::join!(
            abort_sibling_on_failure(storage_ready, sub_ctx.clone()),
            abort_sibling_on_failure(api_ready, sub_ctx.clone()),
        );

        storage_result.context(StorageShimNotReadySnafu)?;
        api_result.context(ApiServerNotReadySnafu)?;

        info!(storage_port, api_port, "stack ready");
        Ok(token)
    }

    async fn teardown_after_failed_start(&self) {
        if let Err(err) = self.api.stop(self.config.stop_timeout).await {
            warn!(%err, "failed to stop API server while tearing down a failed start");
        }
        if let Err(err) = self.storage.stop(self.config.stop_timeout).await {
            warn!(%err, "failed to stop storage shim while tearing down a failed start");
        }
    }

    fn storage_command(&self, storage_port: u16) -> ProcessCommand {
        ProcessCommand::new(self.config.storage_shim_binary.to_string_lossy())
            .arg("--endpoint")
            .arg(self.config.storage_endpoint())
            .arg("--listen-address")
            .arg(self.config.storage_listen_addr(storage_port))
            .arg("--metrics-bind-address")
            .arg("0")
    }

    fn api_server_command(&self, storage_port: u16, api_port: u16) -> ProcessCommand {
        ProcessCommand::new(self.config.api_server_binary.to_string_lossy())
            .arg("--etcd-servers")
            .arg(format!(
                "http://{}",
                self.config.storage_listen_addr(storage_port)
            ))
            .arg("--bind-address")
            .arg("127.0.0.1")
            .arg("--secure-port")
            .arg(api_port.to_string())
            .arg("--cert-dir")
            .arg(self.config.certs_dir().to_string_lossy())
            .arg("--authentication-config")
            .arg(self.config.auth_config_path().to_string_lossy())
            .arg("--token-auth-file")
            .arg(self.config.token_file_path().to_string_lossy())
            .arg("--authorization-mode")
            .arg("AlwaysAllow")
            .arg("--service-account-key-file")
            .arg(self.config.service_account_key_path().to_string_lossy())
            .arg("--service-account-signing-key-file")
            .arg(self.config.service_account_key_path().to_string_lossy())
            .arg("--service-account-issuer")
            .arg("https://k8senv.local")
            .arg("--service-cluster-ip-range")
            .arg("10.96.0.0/12")
            .arg("--disable-admission-plugins")
            .arg("ServiceAccount")
            .arg("--watch-cache")
            .arg("false")
    }

    /// Stop the API server, then the storage shim: reversed from creation
    /// order. The storage shim stopping first would leave the API server
    /// stalled on reconnection retries during its own shutdown.
    pub async fn stop(&self) -> Result<(), StackError> {
        let mut state = self.state.lock().await;
        let (storage_port, api_port) = match &*state {
            State::Running {
                storage_port,
                api_port,
                ..
            } => (*storage_port, *api_port),
            State::NotStarted | State::Stopped => return Ok(()),
        };

        self.api
            .stop(self.config.stop_timeout)
            .await
            .context(StopApiServerSnafu)?;
        self.storage
            .stop(self.config.stop_timeout)
            .await
            .context(StopStorageShimSnafu)?;

        self.ports.release(storage_port);
        self.ports.release(api_port);
        *state = State::Stopped;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.state.lock().await, State::Running { .. })
    }

    pub async fn ports(&self) -> Option<(u16, u16)> {
        match &*self.state.lock().await {
            State::Running {
                storage_port,
                api_port,
                ..
            } => Some((*storage_port, *api_port)),
            _ => None,
        }
    }
}

/// Race `fut` against `sub_ctx` getting cancelled; on error, cancel
/// `sub_ctx` so a concurrently-polled sibling readiness wait aborts
/// promptly instead of running out its own full timeout.
async fn abort_sibling_on_failure<F>(
    fut: F,
    sub_ctx: CancellationToken,
) -> Result<(), ReadinessError>
where
    F: std::future::Future<Output = Result<(), ReadinessError>>,
{
    let result = fut.await;
    if result.is_err() {
        sub_ctx.cancel();
    }
    result
}

async fn storage_probe(port: u16) -> ProbeOutcome {
    match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
        Ok(_) => ProbeOutcome::Ready,
        Err(_) => ProbeOutcome::NotReady,
    }
}

async fn api_probe(port: u16) -> ProbeOutcome {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(err) => return ProbeOutcome::Fatal(err.to_string()),
    };
    match client
        .get(format!("https://127.0.0.1:{port}/livez"))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => ProbeOutcome::Ready,
        Ok(_) => ProbeOutcome::NotReady,
        Err(_) => ProbeOutcome::NotReady,
    }
}
