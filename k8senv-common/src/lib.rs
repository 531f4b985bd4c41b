//! Shared foundation for the k8senv pool: the port registry, the
//! system-namespace set, and the error sentinels that the rest of the
//! workspace builds on.

pub mod namespaces;
pub mod port;

pub use namespaces::SYSTEM_NAMESPACES;
pub use port::{PortError, PortRegistry};
