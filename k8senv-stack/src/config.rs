//! Static configuration for a stack: where the binaries live, where the
//! stack's state lives on disk, and the fixed authentication token every
//! launched API server is configured with.

use snafu::{ensure, Snafu};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Group granted to the single static bearer token configured on every
/// launched API server. The control plane treats this as its elevated,
/// test-harness-only identity.
pub const STATIC_TOKEN_GROUP: &str = "system:masters";
pub const STATIC_TOKEN_USER: &str = "k8senv";
pub const STATIC_TOKEN_UID: &str = "k8senv-uid";

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("{field} must not be empty"))]
    EmptyField { field: &'static str },

    #[snafu(display("{field} must be a positive duration, got {value:?}"))]
    NonPositiveDuration {
        field: &'static str,
        value: Duration,
    },
}

/// Everything a [`crate::Stack`] needs to launch a storage shim and an API
/// server pointed at each other, rooted at one working directory.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub storage_shim_binary: PathBuf,
    pub api_server_binary: PathBuf,
    pub working_dir: PathBuf,
    pub storage_protocol: String,
    pub readiness_poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub stop_timeout: Duration,
}

impl StackConfig {
    pub fn new(
        storage_shim_binary: impl Into<PathBuf>,
        api_server_binary: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let storage_shim_binary = storage_shim_binary.into();
        let api_server_binary = api_server_binary.into();
        let working_dir = working_dir.into();

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
            !working_dir.as_os_str().is_empty(),
            EmptyFieldSnafu {
                field: "working_dir"
            }
        );

        Ok(Self {
            storage_shim_binary,
            api_server_binary,
            working_dir,
            storage_protocol: "kine".to_string(),
            readiness_poll_interval: Duration::from_millis(100),
            readiness_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_readiness(mut self, poll_interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
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

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
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

    pub fn db_path(&self) -> PathBuf {
        self.working_dir.join("db").join("state.db")
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.working_dir.join("kubeconfig.yaml")
    }

    pub fn token_file_path(&self) -> PathBuf {
        self.working_dir.join("token.csv")
    }

    pub fn auth_config_path(&self) -> PathBuf {
        self.working_dir.join("auth-config.yaml")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.working_dir.join("certs")
    }

    pub fn service_account_key_path(&self) -> PathBuf {
        self.certs_dir().join("service-account.pem")
    }

    pub fn storage_endpoint(&self) -> String {
        format!("{}://{}", self.storage_protocol, self.db_path().display())
    }

    pub fn storage_listen_addr(&self, storage_port: u16) -> String {
        format!("127.0.0.1:{storage_port}")
    }
}

pub(crate) fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
