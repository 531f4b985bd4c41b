//! Poll a caller-supplied probe until it reports ready, the process exits,
//! or the overall timeout elapses.
//!
//! Grounded on the control-plane repo's `deployer` readiness loop (it polls a
//! REST health endpoint on an interval with an overall deadline); generalized
//! here to an arbitrary async probe closure so stacks can use it for both the
//! storage shim and the API server without `k8senv-process` knowing anything
//! about HTTP.

use snafu::Snafu;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Snafu)]
pub enum ReadinessError {
    #[snafu(display("process exited before becoming ready"))]
    ProcessExited,

    #[snafu(display("timed out after {timeout:?} waiting for readiness"))]
    Timeout { timeout: Duration },

    #[snafu(display("readiness probe reported a fatal error: {message}"))]
    ProbeFailed { message: String },

    #[snafu(display("readiness wait was cancelled"))]
    Cancelled,
}

/// Outcome of a single probe attempt.
pub enum ProbeOutcome {
    /// Not ready yet, keep polling.
    NotReady,
    /// Ready.
    Ready,
    /// Unrecoverable: stop polling and fail immediately rather than waiting
    /// out the full timeout.
    Fatal(String),
}

/// Poll `probe` on `poll_interval` until it reports [`ProbeOutcome::Ready`],
/// the process behind `exited` exits, `probe` reports
/// [`ProbeOutcome::Fatal`], or `total_timeout` elapses.
///
/// `probe` is never invoked concurrently with itself: each call is awaited
/// to completion before the next tick is considered.
pub async fn wait_ready<P, F>(
    poll_interval: Duration,
    total_timeout: Duration,
    cancel: CancellationToken,
    mut exited: watch::Receiver<bool>,
    mut probe: P,
) -> Result<(), ReadinessError>
where
    P: FnMut() -> F,
    F: Future<Output = ProbeOutcome>,
{
    let deadline = Instant::now() + total_timeout;
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if cancel.is_cancelled() {
            return CancelledSnafu.fail();
        }
        if *exited.borrow() {
            return ProcessExitedSnafu.fail();
        }

        match probe().await {
            ProbeOutcome::Ready => {
                trace!("readiness probe succeeded");
                return Ok(());
            }
            ProbeOutcome::Fatal(message) => {
                debug!(%message, "readiness probe reported a fatal error");
                return ProbeFailedSnafu { message }.fail();
            }
            ProbeOutcome::NotReady => {}
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return TimeoutSnafu { timeout: total_timeout }.fail();
            }
            _ = cancel.cancelled() => {
                return CancelledSnafu.fail();
            }
            changed = exited.changed() => {
                if changed.is_ok() && *exited.borrow() {
                    return ProcessExitedSnafu.fail();
                }
            }
        }

        if Instant::now() >= deadline {
            return TimeoutSnafu {
                timeout: total_timeout,
            }
            .fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_once_probe_reports_ready() {
        let (_tx, rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let result = wait_ready(
            Duration::from_millis(5),
            Duration::from_secs(1),
            CancellationToken::new(),
            rx,
            || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n >= 2 {
                        ProbeOutcome::Ready
                    } else {
                        ProbeOutcome::NotReady
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn process_exit_is_reported_immediately() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = wait_ready(
            Duration::from_millis(5),
            Duration::from_secs(5),
            CancellationToken::new(),
            rx,
            || async { ProbeOutcome::NotReady },
        )
        .await;
        assert!(matches!(result, Err(ReadinessError::ProcessExited)));
    }

    #[tokio::test]
    async fn exit_during_wait_is_observed() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });
        let result = wait_ready(
            Duration::from_millis(100),
            Duration::from_secs(5),
            CancellationToken::new(),
            rx,
            || async { ProbeOutcome::NotReady },
        )
        .await;
        assert!(matches!(result, Err(ReadinessError::ProcessExited)));
    }

    #[tokio::test]
    async fn fatal_probe_error_short_circuits() {
        let (_tx, rx) = watch::channel(false);
        let result = wait_ready(
            Duration::from_millis(5),
            Duration::from_secs(5),
            CancellationToken::new(),
            rx,
            || async { ProbeOutcome::Fatal("connection refused, wrong port".to_string()) },
        )
        .await;
        assert!(matches!(result, Err(ReadinessError::ProbeFailed { .. })));
    }

    #[tokio::test]
    async fn times_out_if_never_ready() {
        let (_tx, rx) = watch::channel(false);
        let result = wait_ready(
            Duration::from_millis(5),
            Duration::from_millis(30),
            CancellationToken::new(),
            rx,
            || async { ProbeOutcome::NotReady },
        )
        .await;
        assert!(matches!(result, Err(ReadinessError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_deadline() {
        let (_tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let result = wait_ready(
            Duration::from_millis(100),
            Duration::from_secs(5),
            cancel,
            rx,
            || async { ProbeOutcome::NotReady },
        )
        .await;
        assert!(matches!(result, Err(ReadinessError::Cancelled)));
    }
}
