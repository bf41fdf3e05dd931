//! OrderBook - BTreeMap-based price-time priority order book
//!
//! This module contains only the OrderBook data structure.
//! The matching logic lives in the engine module.
//!
//! Only resting limit orders live here; market orders are matched or
//! rejected inline and never inserted.

use crate::core_types::{OrderId, Price, Qty};
use crate::models::{Order, Side};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Orders at one price, FIFO by insertion (ties on `ts_created` break by
/// insertion sequence).
pub type PriceLevel = VecDeque<Order>;

/// The OrderBook using BTreeMap for O(log n) operations
///
/// # Key Design:
/// - Asks are stored with normal keys (ascending order, lowest price = best ask)
/// - Bids use negated keys `u64::MAX - price` (so highest price comes first = best bid)
///
/// # Complexity:
/// | Operation | Time |
/// |-----------|------|
/// | Insert | O(log n) |
/// | Best price | O(1) amortized |
/// | Remove by ID | O(1) lookup + O(log n + k) removal |
#[derive(Debug, Default)]
pub struct OrderBook {
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<u64, PriceLevel>,
    /// Buy orders: (MAX - price) -> orders (so highest price first)
    bids: BTreeMap<u64, PriceLevel>,
    /// Order index: OrderId -> (Price, Side) for O(1) cancel lookup
    order_index: FxHashMap<OrderId, (Price, Side)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn key_for(side: Side, price: Price) -> u64 {
        match side {
            Side::Buy => u64::MAX - price,
            Side::Sell => price,
        }
    }

    /// Rest an order in the book.
    ///
    /// The order status must already be set by the caller; this method
    /// only stores the order.
    pub fn insert(&mut self, order: Order) {
        debug_assert!(order.price.is_some(), "market orders never rest");
        let price = order.resting_price();
        let side = order.side;
        self.order_index.insert(order.order_id, (price, side));
        let key = Self::key_for(side, price);
        match side {
            Side::Buy => self.bids.entry(key).or_default().push_back(order),
            Side::Sell => self.asks.entry(key).or_default().push_back(order),
        }
    }

    /// Get the best bid price (highest buy price)
    #[inline]
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first_key_value().map(|(k, _)| u64::MAX - k)
    }

    /// Get the best ask price (lowest sell price)
    #[inline]
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    /// Best resting order on a side (price priority, then FIFO).
    pub fn best(&self, side: Side) -> Option<&Order> {
        let tree = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        tree.first_key_value().and_then(|(_, level)| level.front())
    }

    /// Mutable access to the front order of the best price level.
    pub(crate) fn best_mut(&mut self, side: Side) -> Option<&mut Order> {
        let tree = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        tree.first_entry().and_then(|e| e.into_mut().front_mut())
    }

    /// Pop the front order of the best price level, cleaning up the level
    /// if it empties. Used by the matching loop when an order fills.
    pub(crate) fn pop_best(&mut self, side: Side) -> Option<Order> {
        let tree = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let mut entry = tree.first_entry()?;
        let order = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if let Some(ref o) = order {
            self.order_index.remove(&o.order_id);
        }
        order
    }

    /// Remove an order by ID only (uses order index for fast lookup).
    ///
    /// Returns the removed order if found. Complexity: O(1) index lookup
    /// + O(log n) tree access + O(k) queue scan at that price level.
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let (price, side) = self.order_index.remove(&order_id)?;
        let key = Self::key_for(side, price);
        let tree = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        let level = tree.get_mut(&key)?;
        let pos = level.iter().position(|o| o.order_id == order_id)?;
        let order = level.remove(pos)?;
        if level.is_empty() {
            tree.remove(&key);
        }
        Some(order)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.order_index.contains_key(&order_id)
    }

    /// Number of price levels on each side (bid_levels, ask_levels).
    #[inline]
    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Total resting quantity at a price level for a side.
    pub fn qty_at_price(&self, price: Price, side: Side) -> Qty {
        let key = Self::key_for(side, price);
        let tree = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        tree.get(&key)
            .map(|level| level.iter().map(|o| o.qty_remaining).sum())
            .unwrap_or(0)
    }

    /// All resting orders: bids first (best price, then FIFO), then asks.
    pub fn all_orders(&self) -> Vec<&Order> {
        self.bids
            .values()
            .flat_map(|level| level.iter())
            .chain(self.asks.values().flat_map(|level| level.iter()))
            .collect()
    }

    /// Take every resting order out of the book (session end, forced
    /// settlement). The book is empty afterwards.
    pub fn drain_all(&mut self) -> Vec<Order> {
        let orders: Vec<Order> = self
            .bids
            .values()
            .flat_map(|level| level.iter().cloned())
            .chain(self.asks.values().flat_map(|level| level.iter().cloned()))
            .collect();
        self.bids.clear();
        self.asks.clear();
        self.order_index.clear();
        orders
    }

    /// Market depth snapshot: top N price levels per side with aggregated
    /// remaining quantity. Bids descend, asks ascend.
    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        let bids: Vec<(Price, Qty)> = self
            .bids
            .iter()
            .take(levels)
            .map(|(&key, orders)| {
                let price = u64::MAX - key;
                let qty: Qty = orders.iter().map(|o| o.qty_remaining).sum();
                (price, qty)
            })
            .collect();

        let asks: Vec<(Price, Qty)> = self
            .asks
            .iter()
            .take(levels)
            .map(|(&price, orders)| {
                let qty: Qty = orders.iter().map(|o| o.qty_remaining).sum();
                (price, qty)
            })
            .collect();

        DepthSnapshot { bids, asks }
    }
}

/// Aggregated market depth.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub bids: Vec<(Price, Qty)>, // (price, total_qty)
    pub asks: Vec<(Price, Qty)>,
}
