//! switchyard-mbus — the message-bus side of the router.
//!
//! Subscribes to `router.register`, `router.unregister` and
//! `router.greet` on NATS and applies what arrives to the shared
//! `RouteTable`. Connection loss flips the shared `BusHealth` flag so the
//! pruner can hold off while registrations cannot arrive.
//!
//! # Components
//!
//! - **`handler`** — decodes one message and applies it to the table
//! - **`subscriber`** — NATS connection, subscriptions and reconnects
//! - **`backoff`** — capped exponential reconnect delay

pub mod backoff;
pub mod error;
pub mod handler;
pub mod subscriber;

pub use backoff::ReconnectBackoff;
pub use error::{BusError, BusResult};
pub use handler::{Applied, RegistryHandler};
pub use subscriber::{BusListener, router_start};
