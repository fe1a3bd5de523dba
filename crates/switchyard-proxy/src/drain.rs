//! Graceful shutdown.
//!
//! A drain fails health checks first, waits `drain_wait` so load
//! balancers notice, then moves the lifecycle to `Draining` (listeners
//! close, connections finish their current request). Connections still
//! open after `drain_timeout` are force-closed by the move to `Stopped`.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use switchyard_core::{DrainState, Lifecycle};

use crate::server::ConnectionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections still open when `drain_timeout` expired.
    pub forced: usize,
    pub elapsed: Duration,
}

impl DrainReport {
    pub fn timed_out(&self) -> bool {
        self.forced > 0
    }
}

pub struct DrainController {
    lifecycle: Lifecycle,
    connections: ConnectionTracker,
    drain_wait: Duration,
    drain_timeout: Duration,
}

impl DrainController {
    pub fn new(
        lifecycle: Lifecycle,
        connections: ConnectionTracker,
        drain_wait: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            connections,
            drain_wait,
            drain_timeout,
        }
    }

    pub async fn drain(&self) -> DrainReport {
        let started = Instant::now();
        self.lifecycle.fail_health();

        if !self.drain_wait.is_zero() {
            info!(wait = ?self.drain_wait, "failing health checks before drain");
            tokio::time::sleep(self.drain_wait).await;
        }

        self.lifecycle.advance(DrainState::Draining);
        info!(open = self.connections.active(), "draining connections");

        let forced = match tokio::time::timeout(self.drain_timeout, self.connections.wait_idle()).await
        {
            Ok(()) => 0,
            Err(_) => {
                let open = self.connections.active();
                warn!(
                    open,
                    timeout = ?self.drain_timeout,
                    "DrainTimeoutExceeded: force closing remaining connections"
                );
                open
            }
        };

        self.lifecycle.advance(DrainState::Stopped);
        let report = DrainReport {
            forced,
            elapsed: started.elapsed(),
        };
        info!(forced = report.forced, elapsed = ?report.elapsed, "drain complete");
        report
    }
}
