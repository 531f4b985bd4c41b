//! Start a stack with bounded retries, each retry using a fresh stack and
//! fresh port allocations.
//!
//! The predominant transient failure is a port colliding with some peer
//! process outside the registry's own bookkeeping (another program on the
//! host grabbed it between our allocation and the child's bind); a fresh
//! allocation resolves it. Permanent errors are never retried.

use crate::stack::{Stack, StackError};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Snafu)]
pub enum RetryError {
    #[snafu(display("start was cancelled after {attempts} attempt(s)"))]
    Cancelled { attempts: u32 },

    #[snafu(display("exhausted {attempts} attempt(s) starting the stack: {source}"))]
    Exhausted { attempts: u32, source: StackError },

    #[snafu(display("permanent failure starting the stack: {source}"))]
    Permanent { source: StackError },
}

/// Build and start a stack, retrying transient failures up to
/// `max_attempts` times. `make_stack` is called once per attempt so each
/// retry gets a fresh `Stack` (and, transitively, a fresh port pair).
pub async fn start_with_retry<F>(
    max_attempts: u32,
    process_ctx: CancellationToken,
    ready_ctx: CancellationToken,
    mut make_stack: F,
) -> Result<Stack, RetryError>
where
    F: FnMut() -> Stack,
{
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        if ready_ctx.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        let stack = make_stack();
        match stack.start(process_ctx.clone(), ready_ctx.clone()).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(attempt, "stack start succeeded after retry");
                }
                return Ok(stack);
            }
            Err(err) if err.is_permanent() => {
                return Err(RetryError::Permanent { source: err });
            }
            Err(err) => {
                warn!(attempt, %err, "transient stack start failure, retrying");
                last_err = Some(err);
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        source: last_err.expect("loop ran at least once"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use k8senv_common::port::PortRegistry;

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let ports = PortRegistry::new();
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = start_with_retry(
            3,
            CancellationToken::new(),
            CancellationToken::new(),
            move || {
                attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let config = StackConfig::new(
                    "/nonexistent/definitely-not-a-binary",
                    "/nonexistent/definitely-not-a-binary",
                    dir.path(),
                )
                .unwrap();
                Stack::new(config, ports.clone())
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_ready_ctx_stops_further_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let ports = PortRegistry::new();
        let ready_ctx = CancellationToken::new();
        ready_ctx.cancel();
        let result = start_with_retry(3, CancellationToken::new(), ready_ctx, move || {
            let config =
                StackConfig::new("/nonexistent/a", "/nonexistent/b", dir.path()).unwrap();
            Stack::new(config, ports.clone())
        })
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
    }
}
