//! Domain models: orders and trades
//!
//! The single traded instrument has two order types (market, limit) and a
//! five-state order lifecycle. Trades are immutable once recorded.

use crate::core_types::{OrderId, Price, Qty, TradeId, TsMillis, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    MarketUnfilled,
    MarketClosed,
    FinalSettlement,
    ExpiredCleanup,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => "user_requested",
            CancelReason::MarketUnfilled => "market_unfilled",
            CancelReason::MarketClosed => "market_closed",
            CancelReason::FinalSettlement => "final_settlement",
            CancelReason::ExpiredCleanup => "expired_cleanup",
        }
    }
}

/// A single order.
///
/// Limit orders carry a price; market orders carry none and are never
/// resting. An order is resting iff it is non-terminal with quantity left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub uid: UserId,
    pub side: Side,
    pub order_type: OrderType,
    pub qty_original: Qty,
    pub qty_remaining: Qty,
    pub price: Option<Price>,
    pub status: OrderStatus,
    pub ts_created: TsMillis,
    pub ts_executed: Option<TsMillis>,
    pub ts_cancelled: Option<TsMillis>,
    pub cancel_reason: Option<CancelReason>,
}

impl Order {
    pub fn new_limit(
        order_id: OrderId,
        uid: UserId,
        side: Side,
        qty: Qty,
        price: Price,
        ts: TsMillis,
    ) -> Self {
        Self {
            order_id,
            uid,
            side,
            order_type: OrderType::Limit,
            qty_original: qty,
            qty_remaining: qty,
            price: Some(price),
            status: OrderStatus::Pending,
            ts_created: ts,
            ts_executed: None,
            ts_cancelled: None,
            cancel_reason: None,
        }
    }

    pub fn new_market(order_id: OrderId, uid: UserId, side: Side, qty: Qty, ts: TsMillis) -> Self {
        Self {
            order_id,
            uid,
            side,
            order_type: OrderType::Market,
            qty_original: qty,
            qty_remaining: qty,
            price: None,
            status: OrderStatus::Pending,
            ts_created: ts,
            ts_executed: None,
            ts_cancelled: None,
            cancel_reason: None,
        }
    }

    pub fn filled_qty(&self) -> Qty {
        self.qty_original - self.qty_remaining
    }

    pub fn is_filled(&self) -> bool {
        self.qty_remaining == 0
    }

    /// Resting = live in the book with quantity left.
    pub fn is_resting(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Partial)
            && self.qty_remaining > 0
    }

    /// Price of a resting order. Only limit orders rest, so this is total
    /// for book-resident orders.
    pub fn resting_price(&self) -> Price {
        self.price.unwrap_or(0)
    }

    /// Apply a fill of `qty`, updating remaining quantity and status.
    pub fn apply_fill(&mut self, qty: Qty, ts: TsMillis) {
        debug_assert!(qty <= self.qty_remaining, "fill exceeds remaining qty");
        self.qty_remaining -= qty;
        self.ts_executed = Some(ts);
        self.status = if self.qty_remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
    }

    /// Mark the order cancelled; remaining quantity is preserved as the
    /// unfilled quantity at cancel time.
    pub fn mark_cancelled(&mut self, reason: CancelReason, ts: TsMillis) {
        self.status = if reason == CancelReason::ExpiredCleanup {
            OrderStatus::Expired
        } else {
            OrderStatus::Cancelled
        };
        self.ts_cancelled = Some(ts);
        self.cancel_reason = Some(reason);
    }
}

/// An executed trade. Immutable once recorded.
///
/// `sell_order_id` is None for fills allocated from the IPO pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: Option<OrderId>,
    pub price: Price,
    pub qty: Qty,
    pub ts: TsMillis,
}
