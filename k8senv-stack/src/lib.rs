//! Coordinated lifecycle of a storage-shim + API-server pair: port
//! assignment, parallel startup with fast-abort readiness, ordered teardown,
//! and a retry wrapper for transient startup failures.

pub mod authfiles;
pub mod config;
pub mod kubeconfig;
pub mod retry;
pub mod stack;

pub use config::{ConfigError, StackConfig};
pub use retry::{start_with_retry, RetryError, DEFAULT_MAX_ATTEMPTS};
pub use stack::{Stack, StackError};
