//! Bounded pool of reusable Kubernetes control-plane environments.
//!
//! Owns the port registry (via each stack it creates), an optional
//! template artifact cache, and a LIFO stack of warm instances. See
//! [`Pool`] and [`Instance`].

pub mod config;
pub mod error;
mod instance;
mod pool;
pub mod storage;
mod strategy;
pub mod test_support;

pub use config::{PoolConfig, PoolConfigError, ReleaseStrategy};
pub use error::PoolError;
pub use instance::Instance;
pub use pool::Pool;
pub use storage::StorageError;
pub use strategy::StrategyError;
