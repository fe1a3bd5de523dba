//! switchyard-proxy — the HTTP data plane.
//!
//! Accepts client connections (plaintext and TLS), resolves each request
//! against the shared `RouteTable`, and forwards it to a backend or via a
//! route service. All per-request failures become HTTP error responses.
//!
//! # Components
//!
//! - **`proxy`** — per-request routing decisions
//! - **`forward`** — backend connections with dial/response timeouts and TLS
//! - **`route_service`** — signed forwarding headers and replay protection
//! - **`tls`** — rustls client/server configuration from PEM config
//! - **`server`** — accept loops and connection tracking
//! - **`drain`** — graceful shutdown sequencing

pub mod body;
pub mod drain;
pub mod error;
pub mod forward;
pub mod headers;
pub mod proxy;
pub mod route_service;
pub mod server;
pub mod tls;

pub use body::{BoxError, ProxyBody};
pub use drain::{DrainController, DrainReport};
pub use error::{ProxyError, SignatureError, TlsError};
pub use forward::Forwarder;
pub use proxy::{ClientInfo, Proxy};
pub use route_service::{RequestMetadata, RouteServiceSigner};
pub use server::{ConnectionTracker, ProxyServer};
