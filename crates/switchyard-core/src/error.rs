//! Error types for message decoding and configuration.

use thiserror::Error;

/// A registration payload that failed schema validation.
///
/// These are never fatal: the bus listener logs the error and drops
/// the message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed message: missing required field `{0}`")]
    MissingField(&'static str),

    #[error("malformed message: neither `port` nor `tls_port` is set")]
    NoPort,

    #[error("malformed message: invalid uri `{0}`")]
    InvalidUri(String),
}

/// Errors raised while loading or validating a `RouterConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration `{0}`")]
    Duration(String),

    #[error("at least one nats server must be configured")]
    NoNatsServers,

    #[error("enable_ssl requires tls_pem.cert_chain and tls_pem.private_key")]
    MissingTlsPem,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("port {0} is configured for more than one listener")]
    PortConflict(u16),

    #[error("route_services.secret_previous is set but route_services.secret is empty")]
    PreviousSecretWithoutSecret,
}
