//! Drain lifecycle shared by the proxy listeners, the bus listener and
//! the pruner.
//!
//! The state only moves forward: `Running → Draining → Stopped`.
//! Observers subscribe to a `watch` channel and react to transitions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    Running,
    Draining,
    Stopped,
}

struct Inner {
    state: watch::Sender<DrainState>,
    healthy: AtomicBool,
}

/// Cloneable handle to the process lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DrainState::Running);
        Self {
            inner: Arc::new(Inner {
                state,
                healthy: AtomicBool::new(true),
            }),
        }
    }

    pub fn state(&self) -> DrainState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DrainState::Running
    }

    /// Whether load-balancer health checks should pass.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire) && self.is_running()
    }

    /// Start failing health checks ahead of the drain itself.
    pub fn fail_health(&self) {
        if self.inner.healthy.swap(false, Ordering::AcqRel) {
            info!("health checks now failing");
        }
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns `false` (and changes nothing) for a backward or repeated
    /// transition.
    pub fn advance(&self, next: DrainState) -> bool {
        let advanced = self.inner.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if advanced {
            info!(state = ?next, "lifecycle transition");
        }
        advanced
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.inner.state.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
