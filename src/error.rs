//! Error types for the execution engine

use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while setting up or running a session
#[derive(Error, Debug)]
pub enum EngineError {
    /// No tradable expiry on or after the given date
    #[error("no listed expiry found on or after {0}")]
    NoExpiryFound(NaiveDate),

    /// The selected strike has no listed CE and/or PE
    #[error("no listed CE/PE at strike {strike} for expiry {expiry}")]
    NoStrikeMatch { strike: f64, expiry: NaiveDate },

    /// Underlying (or leg) price never arrived within the wait window
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    /// Quantity is not a positive multiple of the lot size
    #[error("quantity {quantity} is not a positive multiple of lot size {lot_size}")]
    InvalidQuantity { quantity: u32, lot_size: u32 },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Instrument catalog could not be loaded
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Order gateway failure
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Programmer-error class; the session halts when this is raised
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Forced exit gave up with legs still open
    #[error("forced exit incomplete: {0}")]
    ExitIncomplete(String),
}

/// Failures reported by an order gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Broker refused the request
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Call did not complete within the configured bound
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// Network / decoding problems
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// Gateway has no record of the order
    #[error("unknown order id {0}")]
    UnknownOrder(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Transport(format!("timeout: {}", err))
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
