//! Error types for the bus listener.

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to NATS: {0}")]
    Connect(String),

    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("failed to publish on {subject}: {reason}")]
    Publish { subject: String, reason: String },

    #[error("no NATS servers configured")]
    NoServers,

    #[error("random source unavailable: {0}")]
    Random(String),
}
