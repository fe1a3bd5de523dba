//! switchyard-api — status endpoints for the router.
//!
//! Served on `status.host:status.port`, separate from the proxy listeners.
//!
//! # Routes
//!
//! | Method | Path | Auth | Description |
//! |---|---|---|---|
//! | GET | `/routes` | basic | Routing table snapshot as JSON |
//! | GET | `/health` | none | `200 ok` while healthy, `503` once draining |

pub mod handlers;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;

use switchyard_core::config::StatusConfig;
use switchyard_core::{DrainState, Lifecycle};
use switchyard_registry::RouteTable;

/// Shared state for the status handlers.
#[derive(Clone)]
pub struct ApiState {
    pub table: Arc<RouteTable>,
    pub lifecycle: Lifecycle,
    /// Basic-auth credentials for `/routes`. An empty user disables auth.
    pub user: String,
    pub pass: String,
}

impl ApiState {
    pub fn new(table: Arc<RouteTable>, lifecycle: Lifecycle, status: &StatusConfig) -> Self {
        Self {
            table,
            lifecycle,
            user: status.user.clone(),
            pass: status.pass.clone(),
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/routes", get(handlers::routes))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve the status API until the lifecycle reaches `Stopped`.
///
/// `/health` keeps answering (with 503) while the proxy drains so load
/// balancers can observe the transition.
pub async fn serve(listener: TcpListener, state: ApiState) -> io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    let mut lifecycle = state.lifecycle.subscribe();
    info!(?addr, "status API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while *lifecycle.borrow_and_update() != DrainState::Stopped {
                if lifecycle.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
