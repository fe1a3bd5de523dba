//! Status API handlers.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::ApiState;

/// GET /routes
pub async fn routes(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        debug!("rejected /routes request without valid credentials");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"switchyard\"")],
            "unauthorized\n",
        )
            .into_response();
    }
    Json(state.table.snapshot()).into_response()
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    if state.lifecycle.is_healthy() {
        (StatusCode::OK, "ok\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining\n")
    }
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    if state.user.is_empty() {
        return true;
    }
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((user, pass)) => user == state.user && pass == state.pass,
        None => false,
    }
}
