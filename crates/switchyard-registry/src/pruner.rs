//! Pruner: background task that ages out endpoints whose registrations
//! stopped arriving.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use switchyard_core::{DrainState, Lifecycle};

use crate::table::RouteTable;

/// Shared "is the message bus connected" flag.
///
/// Written by the bus listener, read by the pruner.
#[derive(Debug, Clone)]
pub struct BusHealth(Arc<AtomicBool>);

impl BusHealth {
    pub fn new(available: bool) -> Self {
        Self(Arc::new(AtomicBool::new(available)))
    }

    pub fn set_available(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a single prune tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    Pruned(usize),
    /// The bus is down and pruning is configured to wait for it.
    SuspendedBusDown,
    /// The router is draining; the table is frozen.
    SkippedDraining,
}

pub struct Pruner {
    table: Arc<RouteTable>,
    interval: Duration,
    suspend_if_bus_down: bool,
    bus: BusHealth,
    lifecycle: Lifecycle,
    suspended: AtomicBool,
}

impl Pruner {
    pub fn new(
        table: Arc<RouteTable>,
        interval: Duration,
        suspend_if_bus_down: bool,
        bus: BusHealth,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            table,
            interval,
            suspend_if_bus_down,
            bus,
            lifecycle,
            suspended: AtomicBool::new(false),
        }
    }

    /// Run one sweep as of `now`.
    pub fn tick(&self, now: Instant) -> PruneOutcome {
        if !self.lifecycle.is_running() {
            return PruneOutcome::SkippedDraining;
        }

        if self.suspend_if_bus_down && !self.bus.is_available() {
            if !self.suspended.swap(true, Ordering::AcqRel) {
                warn!("message bus unavailable, suspending route pruning");
            }
            return PruneOutcome::SuspendedBusDown;
        }
        if self.suspended.swap(false, Ordering::AcqRel) {
            info!("message bus available, resuming route pruning");
        }

        let pruned = self.table.prune(now);
        if pruned > 0 {
            info!(pruned, remaining = self.table.endpoint_count(), "pruned stale endpoints");
        }
        PruneOutcome::Pruned(pruned)
    }

    /// Sweep every `interval` until the lifecycle leaves `Running`.
    pub async fn run(self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        debug!(interval = ?self.interval, "pruner starting");

        loop {
            tokio::select! {
                tick = ticker.tick() => {
                    self.tick(tick.into_std());
                }
                changed = lifecycle.changed() => {
                    if changed.is_err() || *lifecycle.borrow() != DrainState::Running {
                        break;
                    }
                }
            }
        }

        debug!("pruner stopped");
    }
}
