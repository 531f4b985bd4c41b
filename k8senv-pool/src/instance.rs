//! A leased control-plane environment: identity, config, and a
//! release-once guard around the underlying stack.

use crate::error::{DoubleReleaseSnafu, PoolError};
use crate::pool::{finish_release, PoolInner};
use k8senv_stack::{Stack, StackConfig};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

enum ReleaseState {
    Active {
        stack: Stack,
        permit: OwnedSemaphorePermit,
    },
    Released,
}

/// A stack plus a stable identity and release discipline, as handed back
/// by [`crate::Pool::acquire`].
pub struct Instance {
    id: String,
    config: StackConfig,
    pool: Arc<PoolInner>,
    state: Mutex<ReleaseState>,
}

impl Instance {
    pub(crate) fn new(
        id: String,
        stack: Stack,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner>,
    ) -> Self {
        let config = stack.config().clone();
        Self {
            id,
            config,
            pool,
            state: Mutex::new(ReleaseState::Active { stack, permit }),
        }
    }

    /// Stable per-acquire identity: unchanged across a warm re-acquire of
    /// the same instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Release this instance back to the owning pool, running the
    /// configured release strategy. A second call returns
    /// [`PoolError::DoubleRelease`] and leaves pool occupancy untouched;
    /// the guard is set before any cleanup begins, so a racing concurrent
    /// call always sees it.
    pub async fn release(&self) -> Result<(), PoolError> {
        let mut guard = self.state.lock().await;
        let (stack, permit) = match std::mem::replace(&mut *guard, ReleaseState::Released) {
            ReleaseState::Active { stack, permit } => (stack, permit),
            ReleaseState::Released => {
                return DoubleReleaseSnafu {
                    id: self.id.clone(),
                }
                .fail();
            }
        };
        drop(guard);

        finish_release(&self.pool, self.id.clone(), stack, permit).await
    }
}
