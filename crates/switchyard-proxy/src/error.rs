//! Error types for the data plane.

use http::StatusCode;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// A request that could not be served. Each variant maps to one HTTP
/// status and one `X-Cf-Routererror` value.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request has no host")]
    MissingHost,

    #[error("no route registered for {0}")]
    RouteNotFound(String),

    #[error("no endpoint available for {0}")]
    NoAvailableEndpoint(String),

    #[error("backend {addr} failed TLS verification: {reason}")]
    BackendTlsVerificationFailed { addr: String, reason: String },

    #[error("backend {addr} timed out: {stage}")]
    BackendTimeout { addr: String, stage: &'static str },

    #[error("backend {addr} unavailable: {reason}")]
    BackendUnavailable { addr: String, reason: String },

    #[error("route services are not enabled on this router")]
    RouteServiceUnsupported,

    #[error("route service {0} is not served over https")]
    InsecureRouteService(String),

    #[error("invalid route service request: {0}")]
    RouteServiceRequestInvalid(#[from] SignatureError),

    #[error("invalid route service url: {0}")]
    InvalidRouteServiceUrl(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost => StatusCode::BAD_REQUEST,
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NoAvailableEndpoint(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendTlsVerificationFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RouteServiceUnsupported | ProxyError::InsecureRouteService(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::RouteServiceRequestInvalid(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidRouteServiceUrl(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the `X-Cf-Routererror` response header.
    pub fn router_error(&self) -> &'static str {
        match self {
            ProxyError::MissingHost => "empty_host",
            ProxyError::RouteNotFound(_) => "unknown_route",
            ProxyError::NoAvailableEndpoint(_) => "no_endpoints",
            ProxyError::BackendTlsVerificationFailed { .. } => "backend_tls_handshake_failed",
            ProxyError::BackendTimeout { .. } | ProxyError::BackendUnavailable { .. } => {
                "endpoint_failure"
            }
            ProxyError::RouteServiceUnsupported | ProxyError::InsecureRouteService(_) => {
                "route_service_unsupported"
            }
            ProxyError::RouteServiceRequestInvalid(_) => "route_service_request_invalid",
            ProxyError::InvalidRouteServiceUrl(_) => "route_service_failure",
        }
    }

    /// Failures that happened before the backend received the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendTimeout { stage: "dial", .. }
                | ProxyError::BackendUnavailable { .. }
                | ProxyError::BackendTlsVerificationFailed { .. }
        )
    }
}

/// Why a route-service signature was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature")]
    Malformed,

    #[error("signature does not match")]
    BadSignature,

    #[error("signature expired")]
    Expired,

    #[error("forwarded url does not match signature")]
    UrlMismatch,

    #[error("forwarded url belongs to a different route")]
    RouteMismatch,

    #[error("signature already used")]
    Replayed,

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("random source unavailable: {0}")]
    Random(String),
}

/// Errors building rustls configuration from PEM material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificate found in {0}")]
    NoCertificate(&'static str),

    #[error("no private key found in {0}")]
    NoPrivateKey(&'static str),

    #[error("none of the configured cipher suites are supported: {0:?}")]
    NoCipherSuites(Vec<String>),

    #[error("client certificate verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_and_codes() {
        let cases = [
            (ProxyError::MissingHost, 400, "empty_host"),
            (ProxyError::RouteNotFound("a.com".into()), 404, "unknown_route"),
            (ProxyError::NoAvailableEndpoint("a.com".into()), 503, "no_endpoints"),
            (
                ProxyError::BackendTlsVerificationFailed { addr: "x".into(), reason: "r".into() },
                502,
                "backend_tls_handshake_failed",
            ),
            (ProxyError::BackendTimeout { addr: "x".into(), stage: "response" }, 504, "endpoint_failure"),
            (ProxyError::BackendUnavailable { addr: "x".into(), reason: "r".into() }, 502, "endpoint_failure"),
            (ProxyError::RouteServiceUnsupported, 502, "route_service_unsupported"),
            (
                ProxyError::InsecureRouteService("http://rs".into()),
                502,
                "route_service_unsupported",
            ),
            (
                ProxyError::RouteServiceRequestInvalid(SignatureError::RouteMismatch),
                400,
                "route_service_request_invalid",
            ),
            (
                ProxyError::RouteServiceRequestInvalid(SignatureError::Replayed),
                400,
                "route_service_request_invalid",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.router_error(), code, "{err}");
        }
    }

    #[test]
    fn response_timeout_is_not_transport() {
        assert!(ProxyError::BackendTimeout { addr: "x".into(), stage: "dial" }.is_transport());
        assert!(!ProxyError::BackendTimeout { addr: "x".into(), stage: "response" }.is_transport());
    }
}
