//! Core error taxonomy
//!
//! One closed set of tagged error variants for the whole trading kernel.
//! String error codes from upstream layers are never re-introduced; API
//! surfaces get a stable SCREAMING_SNAKE code via [`CoreError::code`].

use crate::models::OrderStatus;
use thiserror::Error;

/// Errors recognised by the trading kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // === Actor-state errors (surfaced, no retry) ===
    #[error("Unknown user")]
    UnknownUser,

    #[error("User account is disabled")]
    Disabled,

    #[error("User account is frozen")]
    Frozen,

    #[error("User has outstanding debt")]
    HasDebt,

    // === Precondition errors (surfaced) ===
    #[error("Insufficient points")]
    InsufficientPoints,

    #[error("Insufficient shares")]
    InsufficientShares,

    #[error("Insufficient IPO shares remaining")]
    InsufficientIpo,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    // === Policy errors (surfaced) ===
    #[error("Market is closed")]
    MarketClosed,

    #[error("Price {price} outside permitted band [{low}, {high}]")]
    PriceOutOfBand { price: u64, low: u64, high: u64 },

    // === Order errors (surfaced) ===
    #[error("Order not found")]
    OrderNotFound,

    #[error("Order belongs to another user")]
    NotOwner,

    #[error("Order cannot be cancelled in status {0:?}")]
    NotCancellable(OrderStatus),

    // === Escrow errors ===
    #[error("Escrow not found or no longer active")]
    EscrowNotActive,

    // === Transient errors (retried by the caller's retry envelope) ===
    #[error("Write conflict")]
    WriteConflict,

    #[error("Operation timed out")]
    Timeout,

    // === Routing errors (surfaced with a retry hint, no automatic retry) ===
    #[error("Shard is busy, retry later")]
    ShardBusy,

    #[error("Router is shut down")]
    ShuttingDown,

    // === Fatal ===
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::UnknownUser => "UNKNOWN_USER",
            CoreError::Disabled => "ACCOUNT_DISABLED",
            CoreError::Frozen => "ACCOUNT_FROZEN",
            CoreError::HasDebt => "HAS_DEBT",
            CoreError::InsufficientPoints => "INSUFFICIENT_POINTS",
            CoreError::InsufficientShares => "INSUFFICIENT_SHARES",
            CoreError::InsufficientIpo => "INSUFFICIENT_IPO",
            CoreError::InvalidArgs(_) => "INVALID_ARGS",
            CoreError::MarketClosed => "MARKET_CLOSED",
            CoreError::PriceOutOfBand { .. } => "PRICE_OUT_OF_BAND",
            CoreError::OrderNotFound => "ORDER_NOT_FOUND",
            CoreError::NotOwner => "NOT_OWNER",
            CoreError::NotCancellable(_) => "NOT_CANCELLABLE",
            CoreError::EscrowNotActive => "ESCROW_NOT_ACTIVE",
            CoreError::WriteConflict => "WRITE_CONFLICT",
            CoreError::Timeout => "TIMEOUT",
            CoreError::ShardBusy => "SHARD_BUSY",
            CoreError::ShuttingDown => "SHUTTING_DOWN",
            CoreError::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }

    /// Whether a retry envelope may re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::WriteConflict | CoreError::Timeout)
    }

    /// Validation errors report before any state change.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownUser
                | CoreError::Disabled
                | CoreError::Frozen
                | CoreError::HasDebt
                | CoreError::InvalidArgs(_)
                | CoreError::MarketClosed
                | CoreError::PriceOutOfBand { .. }
        )
    }
}
