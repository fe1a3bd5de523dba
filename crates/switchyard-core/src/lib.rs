//! switchyard-core — shared types for the Switchyard router.
//!
//! Everything here is a leaf: the endpoint record and URI types, the
//! registration message codec, the TOML configuration, and the drain
//! lifecycle handle that the proxy, bus listener and pruner all observe.

pub mod config;
pub mod duration;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod types;

pub use config::RouterConfig;
pub use error::{ConfigError, MessageError};
pub use lifecycle::{DrainState, Lifecycle};
pub use message::{Registration, RegistryEvent, RouterStart, Subject};
pub use types::*;
