//! switchyard-registry — the routing table.
//!
//! Maps normalized URIs to pools of backend endpoints. The table is a
//! sharded `DashMap<Uri, Arc<Pool>>`; each pool is an immutable snapshot
//! replaced wholesale (copy-on-write) under its shard lock, so readers
//! never see a half-updated pool and never hold a lock while forwarding.
//!
//! # Components
//!
//! - **`pool`** — endpoint snapshots with a shared round-robin cursor
//! - **`table`** — upsert/remove/lookup/prune over all pools
//! - **`pruner`** — periodic staleness sweep, suspended during bus outages

pub mod pool;
pub mod pruner;
pub mod table;

pub use pool::{Endpoint, InFlightGuard, Pool, UpsertOutcome};
pub use pruner::{BusHealth, PruneOutcome, Pruner};
pub use table::{EndpointView, RouteTable};
