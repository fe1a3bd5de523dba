//! The route table: normalized URI → endpoint pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info};

use switchyard_core::{EndpointRecord, Uri, lookup_candidates};

use crate::pool::{Endpoint, Pool, UpsertOutcome};

/// Concurrent routing table shared by the bus listener, the pruner and
/// every request task.
///
/// Each URI's pool is swapped atomically under its shard lock. A pool
/// that would become empty is removed in the same step, so a lookup
/// never returns an empty pool.
pub struct RouteTable {
    pools: DashMap<Uri, Arc<Pool>>,
    default_stale_threshold: Duration,
    cursor_seed: usize,
}

impl RouteTable {
    /// Create an empty table. Registrations that don't carry their own
    /// threshold expire after `default_stale_threshold`.
    pub fn new(default_stale_threshold: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            default_stale_threshold,
            cursor_seed: 0,
        }
    }

    /// Start every new pool's round-robin cursor at `seed`.
    pub fn with_cursor_seed(mut self, seed: usize) -> Self {
        self.cursor_seed = seed;
        self
    }

    pub fn default_stale_threshold(&self) -> Duration {
        self.default_stale_threshold
    }

    /// Register or refresh `record` under `uri`.
    pub fn upsert(&self, uri: &Uri, record: EndpointRecord) -> UpsertOutcome {
        self.upsert_at(uri, record, Instant::now())
    }

    pub fn upsert_at(&self, uri: &Uri, record: EndpointRecord, now: Instant) -> UpsertOutcome {
        let threshold = record
            .stale_threshold()
            .unwrap_or(self.default_stale_threshold);
        let instance_id = record.instance_id.clone();

        let outcome = match self.pools.entry(uri.clone()) {
            Entry::Occupied(mut entry) => {
                let (next, outcome) = entry.get().with_upserted(record, now, threshold);
                entry.insert(Arc::new(next));
                outcome
            }
            Entry::Vacant(entry) => {
                let endpoint = Endpoint::new(record, now, threshold);
                entry.insert(Arc::new(Pool::single(endpoint, self.cursor_seed)));
                UpsertOutcome::Added
            }
        };

        if outcome != UpsertOutcome::Refreshed {
            debug!(%uri, %instance_id, ?outcome, "upserted endpoint");
        }
        outcome
    }

    /// Remove `instance_id` from `uri`. Returns whether anything was
    /// removed; unknown URIs and instances are accepted silently.
    pub fn remove(&self, uri: &Uri, instance_id: &str) -> bool {
        let Entry::Occupied(mut entry) = self.pools.entry(uri.clone()) else {
            return false;
        };
        let Some(next) = entry.get().without(instance_id) else {
            return false;
        };

        if next.is_empty() {
            entry.remove();
            debug!(%uri, %instance_id, "removed last endpoint, dropped route");
        } else {
            entry.insert(Arc::new(next));
            debug!(%uri, %instance_id, "removed endpoint");
        }
        true
    }

    /// Resolve a `Host` header: exact match first, then the longest
    /// wildcard suffix.
    pub fn lookup(&self, host: &str) -> Option<Arc<Pool>> {
        self.lookup_request(host, "/")
    }

    /// Resolve a request by host and path. Hosts are tried exact first,
    /// then by wildcard from longest suffix; within each host the
    /// longest matching path prefix wins.
    pub fn lookup_request(&self, host: &str, path: &str) -> Option<Arc<Pool>> {
        self.resolve(host, path).map(|(_, pool)| pool)
    }

    /// Like `lookup_request`, also returning the route key that matched.
    pub fn resolve(&self, host: &str, path: &str) -> Option<(Uri, Arc<Pool>)> {
        lookup_candidates(host, path).into_iter().find_map(|key| {
            let pool = self.pools.get(&key).map(|pool| Arc::clone(pool.value()))?;
            Some((key, pool))
        })
    }

    /// The pool registered under exactly `uri`, without wildcard or
    /// path fallback.
    pub fn get(&self, uri: &Uri) -> Option<Arc<Pool>> {
        self.pools.get(uri).map(|pool| Arc::clone(pool.value()))
    }

    /// Remove every endpoint not refreshed within its threshold as of
    /// `now`. Returns how many endpoints were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.pools.retain(|uri, pool| {
            let (next, stale) = pool.pruned(now);
            if stale.is_empty() {
                return true;
            }
            removed += stale.len();
            for endpoint in &stale {
                info!(
                    %uri,
                    instance_id = endpoint.instance_id(),
                    address = %endpoint.record().canonical_addr(),
                    "pruned stale endpoint"
                );
            }
            if next.is_empty() {
                false
            } else {
                *pool = Arc::new(next);
                true
            }
        });
        removed
    }

    /// Number of URIs with at least one endpoint.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn endpoint_count(&self) -> usize {
        self.pools.iter().map(|pool| pool.len()).sum()
    }

    /// Point-in-time view of the whole table, keyed by URI.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<EndpointView>> {
        let now = Instant::now();
        self.pools
            .iter()
            .map(|entry| {
                let views = entry
                    .value()
                    .endpoints()
                    .iter()
                    .map(|e| EndpointView::new(e, now))
                    .collect();
                (entry.key().to_string(), views)
            })
            .collect()
    }
}

/// JSON shape of one endpoint in `GET /routes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointView {
    pub address: String,
    pub tls: bool,
    /// Seconds left before the endpoint becomes eligible for pruning.
    pub ttl: u64,
    pub private_instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_cert_domain_san: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl EndpointView {
    fn new(endpoint: &Endpoint, now: Instant) -> Self {
        let record = endpoint.record();
        let address = record
            .tls_addr()
            .filter(|_| record.port == 0)
            .unwrap_or_else(|| record.canonical_addr());
        let age = now.saturating_duration_since(endpoint.last_updated());
        Self {
            address,
            tls: record.tls_port != 0,
            ttl: endpoint.stale_threshold().saturating_sub(age).as_secs(),
            private_instance_id: record.instance_id.clone(),
            route_service_url: record.route_service_url.clone(),
            server_cert_domain_san: record.server_cert_domain_san.clone(),
            app: record.app_id.clone(),
            tags: record.tags.clone(),
        }
    }
}
