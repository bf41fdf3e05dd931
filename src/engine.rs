//! Matching engine - continuous match and call auction
//!
//! Owns the order book plus the session price state (reference price,
//! open/high/low/volume, recent trades). Settlement is the lifecycle
//! service's job; the engine only rewrites orders, emits fills and keeps
//! price statistics.
//!
//! # Price rules
//! - Trade price is always the maker's (resting order's) price.
//! - Ties between equally-priced makers break FIFO by arrival.
//! - A trade never prints outside the current price band: the match loop
//!   stops when the best opposite price leaves the band.
//! - The call auction clears at the single price maximising executed
//!   volume; ties break by closeness to the reference price, then to the
//!   bid/ask midpoint, then downwards.

use crate::core_types::{OrderId, Price, Qty, TradeId, TsMillis, UserId, now_ms};
use crate::errors::CoreError;
use crate::models::{Order, OrderType, Side, Trade};
use crate::orderbook::{DepthSnapshot, OrderBook};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};

/// How many trades the in-memory tape retains.
const TRADE_TAPE_CAP: usize = 10_000;

// ============================================================
// PRICE BAND
// ============================================================

/// Permitted price range around the reference price.
///
/// `low = floor(ref * (1 - bps/10000))`, `high = ceil(ref * (1 + bps/10000))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceBand {
    pub low: Price,
    pub high: Price,
}

impl PriceBand {
    pub fn around(ref_price: Price, band_bps: u32) -> Self {
        let bps = band_bps as u128;
        let r = ref_price as u128;
        let low = (r * (10_000u128.saturating_sub(bps))) / 10_000;
        let high = (r * (10_000 + bps)).div_ceil(10_000);
        Self {
            low: low.min(u64::MAX as u128) as Price,
            high: high.min(u64::MAX as u128) as Price,
        }
    }

    #[inline]
    pub fn contains(&self, price: Price) -> bool {
        price >= self.low && price <= self.high
    }
}

// ============================================================
// FILLS
// ============================================================

/// One executed fill, ready for settlement.
///
/// `seller` is None when the shares came from the IPO pool.
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade: Trade,
    pub buyer: UserId,
    pub seller: Option<UserId>,
}

/// Result of matching one incoming order.
///
/// `touched` holds the post-match state of every resting order whose
/// quantity changed, for the order store and reservation bookkeeping.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub touched: Vec<Order>,
}

/// Result of a call auction.
#[derive(Debug, Default)]
pub struct AuctionOutcome {
    pub clearing_price: Option<Price>,
    pub fills: Vec<Fill>,
    pub touched: Vec<Order>,
}

/// Session price statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MarketStats {
    pub ref_price: Price,
    pub last: Option<Price>,
    pub session_open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub volume: Qty,
    pub last_close: Option<Price>,
}

// ============================================================
// ENGINE
// ============================================================

#[derive(Debug)]
pub struct MatchingEngine {
    book: OrderBook,
    /// Last trade price of the session; falls back to the IPO price.
    ref_price: Price,
    ipo_fallback: Price,
    session_open: Option<Price>,
    high: Option<Price>,
    low: Option<Price>,
    volume: Qty,
    last_close: Option<Price>,
    trades: VecDeque<Trade>,
    trade_seq: TradeId,
}

impl MatchingEngine {
    pub fn new(ipo_price: Price) -> Self {
        Self {
            book: OrderBook::new(),
            ref_price: ipo_price,
            ipo_fallback: ipo_price,
            session_open: None,
            high: None,
            low: None,
            volume: 0,
            last_close: None,
            trades: VecDeque::new(),
            trade_seq: 0,
        }
    }

    // ============================================================
    // QUERIES
    // ============================================================

    #[inline]
    pub fn ref_price(&self) -> Price {
        self.ref_price
    }

    pub fn band(&self, band_bps: u32) -> PriceBand {
        PriceBand::around(self.ref_price, band_bps)
    }

    pub fn stats(&self) -> MarketStats {
        MarketStats {
            ref_price: self.ref_price,
            last: self.trades.back().map(|t| t.price),
            session_open: self.session_open,
            high: self.high,
            low: self.low,
            volume: self.volume,
            last_close: self.last_close,
        }
    }

    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        self.book.depth(levels)
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.trades.iter().rev().take(limit).cloned().collect()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Validate a limit price against the current band.
    pub fn validate_limit_price(&self, price: Price, band_bps: u32) -> Result<(), CoreError> {
        let band = self.band(band_bps);
        if !band.contains(price) {
            return Err(CoreError::PriceOutOfBand {
                price,
                low: band.low,
                high: band.high,
            });
        }
        Ok(())
    }

    // ============================================================
    // BOOK MUTATION (lifecycle-facing)
    // ============================================================

    /// Rest a limit order with its current status.
    pub fn insert_resting(&mut self, order: Order) {
        self.book.insert(order);
    }

    /// Remove a resting order (cancellation path).
    pub fn remove_order(&mut self, order_id: OrderId) -> Option<Order> {
        self.book.remove(order_id)
    }

    /// Take every resting order out of the book.
    pub fn drain_book(&mut self) -> Vec<Order> {
        self.book.drain_all()
    }

    // ============================================================
    // CONTINUOUS MATCHING
    // ============================================================

    /// Match an incoming order against the opposite side of the book.
    ///
    /// The taker is mutated in place (quantity, status, timestamps); the
    /// caller settles the returned fills and decides what to do with any
    /// residual (rest it, IPO-fill it, or cancel it).
    pub fn match_order(&mut self, taker: &mut Order, band_bps: u32) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let opp = taker.side.opposite();

        while taker.qty_remaining > 0 {
            let band = self.band(band_bps);
            let best_price = match opp {
                Side::Sell => self.book.best_ask(),
                Side::Buy => self.book.best_bid(),
            };
            let Some(best_price) = best_price else { break };

            // Limit takers only cross while the prices overlap.
            if taker.order_type == OrderType::Limit {
                let limit_price = taker.resting_price();
                let crosses = match taker.side {
                    Side::Buy => limit_price >= best_price,
                    Side::Sell => limit_price <= best_price,
                };
                if !crosses {
                    break;
                }
            }

            // A maker whose price has drifted outside the band cannot
            // print; the band moves with ref_price between fills.
            if !band.contains(best_price) {
                break;
            }

            let ts = now_ms();
            let (maker_copy, trade_qty) = {
                let Some(maker) = self.book.best_mut(opp) else {
                    break;
                };
                let trade_qty = taker.qty_remaining.min(maker.qty_remaining);
                maker.apply_fill(trade_qty, ts);
                (maker.clone(), trade_qty)
            };
            taker.apply_fill(trade_qty, ts);

            let (buyer, seller, buy_id, sell_id) = match taker.side {
                Side::Buy => (taker.uid, maker_copy.uid, taker.order_id, maker_copy.order_id),
                Side::Sell => (maker_copy.uid, taker.uid, maker_copy.order_id, taker.order_id),
            };

            // Maker price wins.
            let trade = self.record_trade(buy_id, Some(sell_id), best_price, trade_qty, ts);
            outcome.fills.push(Fill {
                trade,
                buyer,
                seller: Some(seller),
            });

            if maker_copy.is_filled() {
                self.book.pop_best(opp);
            }
            outcome.touched.push(maker_copy);
        }

        outcome
    }

    /// Fill a residual market buy from the IPO pool at the fixed price.
    pub fn record_ipo_fill(&mut self, taker: &mut Order, qty: Qty, price: Price) -> Fill {
        let ts = now_ms();
        taker.apply_fill(qty, ts);
        let trade = self.record_trade(taker.order_id, None, price, qty, ts);
        Fill {
            trade,
            buyer: taker.uid,
            seller: None,
        }
    }

    // ============================================================
    // CALL AUCTION
    // ============================================================

    /// Batch-match all resting orders at the volume-maximising price.
    ///
    /// Residual quantity stays on the book. Returns an empty outcome when
    /// no price crosses.
    pub fn run_call_auction(&mut self) -> AuctionOutcome {
        let mut outcome = AuctionOutcome::default();

        let Some(p_star) = self.clearing_price() else {
            return outcome;
        };

        loop {
            let (bid_price, ask_price) = (self.book.best_bid(), self.book.best_ask());
            let crossing = matches!(
                (bid_price, ask_price),
                (Some(b), Some(a)) if b >= p_star && a <= p_star
            );
            if !crossing {
                break;
            }

            let ts = now_ms();
            let bid_qty = self
                .book
                .best(Side::Buy)
                .map(|o| o.qty_remaining)
                .unwrap_or(0);
            let ask_qty = self
                .book
                .best(Side::Sell)
                .map(|o| o.qty_remaining)
                .unwrap_or(0);
            let qty = bid_qty.min(ask_qty);
            if qty == 0 {
                break;
            }

            let Some(bid_copy) = self.book.best_mut(Side::Buy).map(|o| {
                o.apply_fill(qty, ts);
                o.clone()
            }) else {
                break;
            };
            let Some(ask_copy) = self.book.best_mut(Side::Sell).map(|o| {
                o.apply_fill(qty, ts);
                o.clone()
            }) else {
                break;
            };

            let trade = self.record_trade(
                bid_copy.order_id,
                Some(ask_copy.order_id),
                p_star,
                qty,
                ts,
            );
            outcome.fills.push(Fill {
                trade,
                buyer: bid_copy.uid,
                seller: Some(ask_copy.uid),
            });

            if bid_copy.is_filled() {
                self.book.pop_best(Side::Buy);
            }
            if ask_copy.is_filled() {
                self.book.pop_best(Side::Sell);
            }
            outcome.touched.push(bid_copy);
            outcome.touched.push(ask_copy);
        }

        if !outcome.fills.is_empty() {
            outcome.clearing_price = Some(p_star);
            tracing::info!(
                clearing_price = p_star,
                fills = outcome.fills.len(),
                "call auction executed"
            );
        }
        outcome
    }

    /// The volume-maximising clearing price, if any volume crosses.
    fn clearing_price(&self) -> Option<Price> {
        let orders = self.book.all_orders();
        if orders.is_empty() {
            return None;
        }

        let candidates: BTreeSet<Price> = orders.iter().map(|o| o.resting_price()).collect();
        let bids: Vec<(Price, Qty)> = orders
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(|o| (o.resting_price(), o.qty_remaining))
            .collect();
        let asks: Vec<(Price, Qty)> = orders
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(|o| (o.resting_price(), o.qty_remaining))
            .collect();

        let midpoint2 = match (self.book.best_bid(), self.book.best_ask()) {
            // Doubled midpoint avoids a fractional tie-break key.
            (Some(b), Some(a)) => b as i128 + a as i128,
            _ => return None,
        };

        let mut best: Option<(Qty, i128, i128, Price)> = None;
        for &p in &candidates {
            let buy_vol: Qty = bids.iter().filter(|(bp, _)| *bp >= p).map(|(_, q)| q).sum();
            let sell_vol: Qty = asks.iter().filter(|(ap, _)| *ap <= p).map(|(_, q)| q).sum();
            let vol = buy_vol.min(sell_vol);
            if vol == 0 {
                continue;
            }
            let ref_dist = (p as i128 - self.ref_price as i128).abs();
            let mid_dist = (2 * p as i128 - midpoint2).abs();
            let better = match &best {
                None => true,
                Some((bv, brd, bmd, bp)) => {
                    (vol, std::cmp::Reverse(ref_dist), std::cmp::Reverse(mid_dist), std::cmp::Reverse(p))
                        > (*bv, std::cmp::Reverse(*brd), std::cmp::Reverse(*bmd), std::cmp::Reverse(*bp))
                }
            };
            if better {
                best = Some((vol, ref_dist, mid_dist, p));
            }
        }
        best.map(|(_, _, _, p)| p)
    }

    // ============================================================
    // SESSION CONTROL
    // ============================================================

    /// Reset session statistics at market open. The reference price falls
    /// back to the IPO price until the session's first trade.
    pub fn start_session(&mut self) {
        self.session_open = None;
        self.high = None;
        self.low = None;
        self.volume = 0;
        self.ref_price = self.ipo_fallback;
    }

    /// Close the session; the last trade price becomes the session close.
    pub fn end_session(&mut self) -> Option<Price> {
        let close = self.trades.back().map(|t| t.price);
        if let Some(close) = close {
            self.last_close = Some(close);
        }
        close
    }

    /// Update the fallback used when a session has no trades yet (admin
    /// IPO price changes).
    pub fn set_ipo_fallback(&mut self, price: Price) {
        self.ipo_fallback = price;
        if self.volume == 0 && self.session_open.is_none() {
            self.ref_price = price;
        }
    }

    // ============================================================
    // INTERNAL
    // ============================================================

    fn record_trade(
        &mut self,
        buy_order_id: OrderId,
        sell_order_id: Option<OrderId>,
        price: Price,
        qty: Qty,
        ts: TsMillis,
    ) -> Trade {
        self.trade_seq += 1;
        let trade = Trade {
            trade_id: self.trade_seq,
            buy_order_id,
            sell_order_id,
            price,
            qty,
            ts,
        };
        self.trades.push_back(trade.clone());
        if self.trades.len() > TRADE_TAPE_CAP {
            self.trades.pop_front();
        }

        self.session_open.get_or_insert(price);
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.volume += qty;
        self.ref_price = price;
        trade
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;

    const BAND: u32 = 2000; // 20%

    fn limit(id: OrderId, uid: UserId, side: Side, qty: Qty, price: Price) -> Order {
        Order::new_limit(id, uid, side, qty, price, id as i64)
    }

    fn market(id: OrderId, uid: UserId, side: Side, qty: Qty) -> Order {
        Order::new_market(id, uid, side, qty, id as i64)
    }

    #[test]
    fn test_band_math() {
        // ref 20, 15%: [17, 23]
        let band = PriceBand::around(20, 1500);
        assert_eq!(band, PriceBand { low: 17, high: 23 });
        assert!(band.contains(17));
        assert!(band.contains(23));
        assert!(!band.contains(24));

        // ref 20, 20%: [16, 24]
        let band = PriceBand::around(20, 2000);
        assert_eq!(band, PriceBand { low: 16, high: 24 });

        // ceil on the upper bound: ref 21, 20% -> 25.2 -> 26
        let band = PriceBand::around(21, 2000);
        assert_eq!(band.low, 16); // 16.8 floors
        assert_eq!(band.high, 26);
    }

    #[test]
    fn test_validate_limit_price() {
        let engine = MatchingEngine::new(20);
        assert!(engine.validate_limit_price(23, 1500).is_ok());
        let err = engine.validate_limit_price(24, 1500).unwrap_err();
        assert_eq!(
            err,
            CoreError::PriceOutOfBand {
                price: 24,
                low: 17,
                high: 23
            }
        );
    }

    #[test]
    fn test_full_match_at_maker_price() {
        let mut engine = MatchingEngine::new(20);
        let mut sell = limit(1, 10, Side::Sell, 3, 21);
        let out = engine.match_order(&mut sell, BAND);
        assert!(out.fills.is_empty());
        engine.insert_resting(sell);

        let mut buy = limit(2, 11, Side::Buy, 3, 24);
        let out = engine.match_order(&mut buy, BAND);
        assert_eq!(out.fills.len(), 1);
        let fill = &out.fills[0];
        assert_eq!(fill.trade.price, 21); // Maker price wins
        assert_eq!(fill.trade.qty, 3);
        assert_eq!(fill.buyer, 11);
        assert_eq!(fill.seller, Some(10));
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(engine.ref_price(), 21);
        assert_eq!(engine.book().level_counts(), (0, 0));
    }

    #[test]
    fn test_partial_fill_keeps_maker_resting() {
        let mut engine = MatchingEngine::new(30);
        let mut sell = limit(1, 10, Side::Sell, 10, 30);
        engine.match_order(&mut sell, BAND);
        engine.insert_resting(sell);

        let mut buy = limit(2, 11, Side::Buy, 3, 30);
        let out = engine.match_order(&mut buy, BAND);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].trade.qty, 3);
        assert_eq!(out.touched[0].status, OrderStatus::Partial);
        assert_eq!(out.touched[0].qty_remaining, 7);
        assert_eq!(engine.book().qty_at_price(30, Side::Sell), 7);
    }

    #[test]
    fn test_fifo_tie_break() {
        let mut engine = MatchingEngine::new(100);
        let mut s1 = limit(1, 10, Side::Sell, 5, 100);
        engine.match_order(&mut s1, BAND);
        engine.insert_resting(s1);
        let mut s2 = limit(2, 11, Side::Sell, 5, 100);
        engine.match_order(&mut s2, BAND);
        engine.insert_resting(s2);

        let mut buy = market(3, 12, Side::Buy, 5);
        let out = engine.match_order(&mut buy, BAND);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].trade.sell_order_id, Some(1)); // First in first out
    }

    #[test]
    fn test_price_priority_walks_levels() {
        let mut engine = MatchingEngine::new(100);
        for (id, price) in [(1u64, 102u64), (2, 100), (3, 101)] {
            let mut s = limit(id, 10 + id, Side::Sell, 5, price);
            engine.match_order(&mut s, BAND);
            engine.insert_resting(s);
        }

        let mut buy = limit(4, 20, Side::Buy, 10, 105);
        let out = engine.match_order(&mut buy, BAND);
        assert_eq!(out.fills.len(), 2);
        assert_eq!(out.fills[0].trade.price, 100);
        assert_eq!(out.fills[1].trade.price, 101);
        assert_eq!(buy.status, OrderStatus::Filled);
    }

    #[test]
    fn test_limit_no_cross_rests() {
        let mut engine = MatchingEngine::new(20);
        let mut sell = limit(1, 10, Side::Sell, 3, 22);
        engine.match_order(&mut sell, BAND);
        engine.insert_resting(sell);

        let mut buy = limit(2, 11, Side::Buy, 3, 21);
        let out = engine.match_order(&mut buy, BAND);
        assert!(out.fills.is_empty());
        assert_eq!(buy.qty_remaining, 3);
    }

    #[test]
    fn test_band_guard_stops_matching() {
        // Maker at 30 rested, then ref collapses to 20: 30 > high(24),
        // so an incoming market buy cannot print against it.
        let mut engine = MatchingEngine::new(30);
        let mut sell = limit(1, 10, Side::Sell, 3, 30);
        engine.match_order(&mut sell, BAND);
        engine.insert_resting(sell);

        engine.ref_price = 20;
        let mut buy = market(2, 11, Side::Buy, 3);
        let out = engine.match_order(&mut buy, BAND);
        assert!(out.fills.is_empty());
        assert_eq!(buy.qty_remaining, 3);
    }

    #[test]
    fn test_ipo_fill_records_trade_without_seller() {
        let mut engine = MatchingEngine::new(20);
        let mut buy = market(1, 11, Side::Buy, 3);
        let fill = engine.record_ipo_fill(&mut buy, 3, 20);
        assert_eq!(fill.trade.sell_order_id, None);
        assert_eq!(fill.seller, None);
        assert_eq!(fill.trade.price, 20);
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(engine.stats().volume, 3);
    }

    #[test]
    fn test_call_auction_maximises_volume() {
        let mut engine = MatchingEngine::new(20);
        // Buys: 5 @ 22, 5 @ 21. Sells: 4 @ 20, 4 @ 21.
        for (id, uid, side, qty, price) in [
            (1u64, 10u64, Side::Buy, 5u64, 22u64),
            (2, 11, Side::Buy, 5, 21),
            (3, 12, Side::Sell, 4, 20),
            (4, 13, Side::Sell, 4, 21),
        ] {
            engine.insert_resting(limit(id, uid, side, qty, price));
        }

        // V(20)=min(10,4)=4, V(21)=min(10,8)=8, V(22)=min(5,8)=5.
        let out = engine.run_call_auction();
        assert_eq!(out.clearing_price, Some(21));
        let traded: Qty = out.fills.iter().map(|f| f.trade.qty).sum();
        assert_eq!(traded, 8);
        for f in &out.fills {
            assert_eq!(f.trade.price, 21);
        }
        // Residual: buys had 10, sells 8 -> 2 shares of buy interest rest.
        assert_eq!(engine.book().qty_at_price(21, Side::Buy), 2);
        assert_eq!(engine.ref_price(), 21);
    }

    #[test]
    fn test_call_auction_no_cross() {
        let mut engine = MatchingEngine::new(20);
        engine.insert_resting(limit(1, 10, Side::Buy, 5, 19));
        engine.insert_resting(limit(2, 11, Side::Sell, 5, 21));
        let out = engine.run_call_auction();
        assert_eq!(out.clearing_price, None);
        assert!(out.fills.is_empty());
        assert_eq!(engine.book().level_counts(), (1, 1));
    }

    #[test]
    fn test_call_auction_tie_breaks_toward_ref() {
        let mut engine = MatchingEngine::new(20);
        // Both 19 and 21 clear 5; 21 is closer to ref 20? both dist 1.
        // Midpoint (19+21)/2 = 20, both dist 1 again -> lower price wins.
        engine.insert_resting(limit(1, 10, Side::Buy, 5, 21));
        engine.insert_resting(limit(2, 11, Side::Sell, 5, 19));
        let out = engine.run_call_auction();
        assert_eq!(out.clearing_price, Some(19));
    }

    #[test]
    fn test_session_lifecycle() {
        let mut engine = MatchingEngine::new(20);
        let mut sell = limit(1, 10, Side::Sell, 3, 21);
        engine.match_order(&mut sell, BAND);
        engine.insert_resting(sell);
        let mut buy = limit(2, 11, Side::Buy, 3, 22);
        engine.match_order(&mut buy, BAND);

        assert_eq!(engine.stats().session_open, Some(21));
        assert_eq!(engine.end_session(), Some(21));

        engine.start_session();
        let stats = engine.stats();
        assert_eq!(stats.session_open, None);
        assert_eq!(stats.volume, 0);
        assert_eq!(stats.ref_price, 20); // Falls back to IPO price
        assert_eq!(stats.last_close, Some(21));
    }
}
