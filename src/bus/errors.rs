//! Bus error types

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

/// Errors of the broadcast producer, fan-out service, and client
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("broadcast post failed: {0}")]
    PostFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
}
