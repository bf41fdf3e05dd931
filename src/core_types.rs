//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// User ID - globally unique, immutable after assignment.
///
/// # Usage:
/// - Primary key for user rows in the ledger
/// - Routing key for the sharded router (FxHash mod N)
pub type UserId = u64;

/// Order ID - unique within the system, assigned by the lifecycle service
pub type OrderId = u64;

/// Trade ID - unique within the system, assigned by the matching engine
pub type TradeId = u64;

/// Escrow ID - ULID string, assigned by the escrow manager
pub type EscrowId = String;

/// Signed points amount.
///
/// All monetary amounts are signed 64-bit integers in "points"; there are
/// no fractional points. Balances never go negative (enforced by the
/// ledger's checked mutations); ledger deltas use the full signed range.
pub type Points = i64;

/// Price of one share, in points.
///
/// Unsigned so the order book can use the `u64::MAX - price` bid-key trick.
pub type Price = u64;

/// Share quantity. No fractional shares.
pub type Qty = u64;

/// UTC epoch milliseconds.
pub type TsMillis = i64;

/// Current UTC time in epoch milliseconds.
#[inline]
pub fn now_ms() -> TsMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Notional value of a fill: `price * qty` as signed points.
///
/// Uses a u128 intermediate so `price * qty` cannot overflow before the
/// range check. Returns None if the product exceeds `Points::MAX`.
#[inline]
pub fn notional(price: Price, qty: Qty) -> Option<Points> {
    let v = price as u128 * qty as u128;
    if v > Points::MAX as u128 {
        None
    } else {
        Some(v as Points)
    }
}
