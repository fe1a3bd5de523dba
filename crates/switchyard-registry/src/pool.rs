//! Endpoint pools and round-robin selection.
//!
//! A `Pool` is never mutated in place. Writers build the next version
//! with `with_upserted` / `without` / `pruned` and swap it into the
//! table; the round-robin cursor and per-endpoint in-flight counters are
//! shared between versions so selection stays fair across updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use switchyard_core::EndpointRecord;

/// What an upsert did to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new instance joined the pool.
    Added,
    /// An existing instance changed (moved address/port, new metadata).
    Updated,
    /// Identical re-registration; only the timestamp moved.
    Refreshed,
}

/// A registered backend instance plus its table bookkeeping.
#[derive(Debug)]
pub struct Endpoint {
    record: EndpointRecord,
    last_updated: Instant,
    stale_threshold: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl Endpoint {
    pub(crate) fn new(record: EndpointRecord, now: Instant, stale_threshold: Duration) -> Self {
        Self {
            record,
            last_updated: now,
            stale_threshold,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn record(&self) -> &EndpointRecord {
        &self.record
    }

    pub fn instance_id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) > self.stale_threshold
    }

    /// Requests currently being forwarded to this instance.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count a request against this instance until the guard drops.
    pub fn acquire(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }
}

/// Decrements an endpoint's in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The endpoints currently serving one URI.
#[derive(Debug)]
pub struct Pool {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: Arc<AtomicUsize>,
    route_service_url: Option<String>,
}

impl Pool {
    pub(crate) fn single(endpoint: Endpoint, cursor_seed: usize) -> Self {
        Self::from_parts(
            vec![Arc::new(endpoint)],
            Arc::new(AtomicUsize::new(cursor_seed)),
        )
    }

    fn from_parts(endpoints: Vec<Arc<Endpoint>>, cursor: Arc<AtomicUsize>) -> Self {
        // The most recently refreshed endpoint decides the pool's route
        // service, so re-registering without one turns it off.
        let route_service_url = endpoints
            .iter()
            .max_by_key(|e| e.last_updated)
            .and_then(|e| e.record.route_service_url.clone());
        Self {
            endpoints,
            cursor,
            route_service_url,
        }
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn route_service_url(&self) -> Option<&str> {
        self.route_service_url.as_deref()
    }

    pub fn find(&self, instance_id: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.instance_id() == instance_id)
    }

    /// Next endpoint in round-robin order. No member is ever skipped.
    pub fn select(&self) -> Option<Arc<Endpoint>> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(Arc::clone(&self.endpoints[idx]))
    }

    /// Round-robin, skipping members already at `max_conns` in-flight
    /// requests. `max_conns == 0` means unlimited and behaves exactly
    /// like `select`. Returns `None` when every member is saturated.
    pub fn select_within(&self, max_conns: usize) -> Option<Arc<Endpoint>> {
        if max_conns == 0 {
            return self.select();
        }
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| &self.endpoints[start.wrapping_add(offset) % len])
            .find(|e| e.in_flight() < max_conns)
            .map(Arc::clone)
    }

    /// The next version of this pool with `record` inserted or replaced
    /// in place. Insertion order is preserved.
    pub(crate) fn with_upserted(
        &self,
        record: EndpointRecord,
        now: Instant,
        stale_threshold: Duration,
    ) -> (Pool, UpsertOutcome) {
        let mut endpoints = self.endpoints.clone();
        let outcome = match endpoints
            .iter()
            .position(|e| e.instance_id() == record.instance_id)
        {
            Some(idx) => {
                let existing = &endpoints[idx];
                let outcome = if existing.record == record {
                    UpsertOutcome::Refreshed
                } else {
                    UpsertOutcome::Updated
                };
                endpoints[idx] = Arc::new(Endpoint {
                    record,
                    last_updated: now,
                    stale_threshold,
                    in_flight: Arc::clone(&existing.in_flight),
                });
                outcome
            }
            None => {
                endpoints.push(Arc::new(Endpoint::new(record, now, stale_threshold)));
                UpsertOutcome::Added
            }
        };
        (Self::from_parts(endpoints, Arc::clone(&self.cursor)), outcome)
    }

    /// The next version without `instance_id`, or `None` if it is not a
    /// member. The result may be empty; the caller drops empty pools.
    pub(crate) fn without(&self, instance_id: &str) -> Option<Pool> {
        self.find(instance_id)?;
        let endpoints = self
            .endpoints
            .iter()
            .filter(|e| e.instance_id() != instance_id)
            .cloned()
            .collect();
        Some(Self::from_parts(endpoints, Arc::clone(&self.cursor)))
    }

    /// Split into the next version (fresh endpoints) and the stale ones.
    pub(crate) fn pruned(&self, now: Instant) -> (Pool, Vec<Arc<Endpoint>>) {
        let (stale, fresh): (Vec<_>, Vec<_>) =
            self.endpoints.iter().cloned().partition(|e| e.is_stale(now));
        (Self::from_parts(fresh, Arc::clone(&self.cursor)), stale)
    }
}
