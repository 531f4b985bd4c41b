//! TOCTOU-safe allocation of distinct ephemeral port pairs.
//!
//! A stack needs two ports — one for the storage shim, one for the API
//! server — that are guaranteed distinct and not already reserved by any
//! other stack in this process. The kernel hands out ephemeral ports on
//! request (bind to port 0), but between reading the kernel-assigned port
//! and reserving it in our own bookkeeping, another caller could observe and
//! reserve the same port. We close that window by holding the OS listener
//! open for the full duration of the reservation attempt.

use snafu::{ResultExt, Snafu};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, trace};

/// Bounded retry budget for `allocate_pair`. Exceeding this means every
/// recently kernel-assigned port was already reserved by this process,
/// which in practice only happens under pathological concurrency.
const MAX_ALLOCATE_ATTEMPTS: u32 = 32;

/// Errors from the port registry.
#[derive(Debug, Snafu)]
pub enum PortError {
    #[snafu(display(
        "exhausted {attempts} attempts allocating a free port: every kernel-assigned port was already reserved"
    ))]
    Exhausted { attempts: u32 },

    #[snafu(display("failed to bind an ephemeral loopback listener: {source}"))]
    Bind { source: std::io::Error },

    #[snafu(display("listener returned a non-loopback-v4 address: {addr}"))]
    UnexpectedAddr { addr: SocketAddr },
}

/// Process-wide registry of reserved TCP ports.
///
/// Cheap to clone: the reservation set is the only mutable state and it is
/// shared via an `Arc<Mutex<_>>`, mirroring the registry-handle pattern the
/// rest of this workspace uses for shared mutable state.
#[derive(Debug, Default, Clone)]
pub struct PortRegistry {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve two distinct ports for a stack.
    ///
    /// Both listeners are held open simultaneously until both ports are
    /// reserved, then both are closed. On failure to obtain the second port,
    /// the first listener is closed *before* its port is released from the
    /// registry, so nothing else can bind the socket while we still hold it.
    pub async fn allocate_pair(&self) -> Result<(u16, u16), PortError> {
        let (listener1, port1) = self.bind_and_reserve().await?;
        match self.bind_and_reserve().await {
            Ok((listener2, port2)) => {
                drop(listener1);
                drop(listener2);
                debug!(port1, port2, "reserved port pair");
                Ok((port1, port2))
            }
            Err(err) => {
                drop(listener1);
                self.release(port1);
                Err(err)
            }
        }
    }

    /// Release a single port back to the pool. Idempotent: releasing a port
    /// that isn't reserved (or was already released) is a no-op.
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            trace!(port, "released port");
        }
    }

    /// True if `port` is currently reserved by this registry. Exposed for
    /// tests asserting the stack-start invariant (reserved port implies
    /// registry membership).
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    async fn bind_and_reserve(&self) -> Result<(TcpListener, u16), PortError> {
        for attempt in 1..=MAX_ALLOCATE_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .context(BindSnafu)?;
            let addr = listener.local_addr().context(BindSnafu)?;
            let port = match addr {
                SocketAddr::V4(addr) => addr.port(),
                other => return UnexpectedAddrSnafu { addr: other }.fail(),
            };

            let mut reserved = self.reserved.lock();
            if reserved.insert(port) {
                drop(reserved);
                return Ok((listener, port));
            }
            drop(reserved);
            trace!(port, attempt, "port already reserved, retrying");
            drop(listener);
        }
        ExhaustedSnafu {
            attempts: MAX_ALLOCATE_ATTEMPTS,
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_ports() {
        let registry = PortRegistry::new();
        let (p1, p2) = registry.allocate_pair().await.unwrap();
        assert_ne!(p1, p2);
        assert!(registry.is_reserved(p1));
        assert!(registry.is_reserved(p2));
    }

    #[tokio::test]
    async fn release_frees_the_port() {
        let registry = PortRegistry::new();
        let (p1, p2) = registry.allocate_pair().await.unwrap();
        registry.release(p1);
        assert!(!registry.is_reserved(p1));
        registry.release(p2);
        assert!(!registry.is_reserved(p2));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let registry = PortRegistry::new();
        registry.release(12345);
        registry.release(12345);
    }

    #[tokio::test]
    async fn many_concurrent_allocations_are_all_distinct() {
        let registry = PortRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.allocate_pair().await.unwrap()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            let (p1, p2) = handle.await.unwrap();
            assert!(seen.insert(p1));
            assert!(seen.insert(p2));
        }
    }
}
