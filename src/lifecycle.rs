//! Order lifecycle - validate, reserve, match, settle, notify
//!
//! Entry point for every order-related command. A buy order reserves
//! points in escrow at the worst-case price before it may touch the book;
//! a sell order locks shares in the holdings book. The matching kernel
//! (engine + book) sits behind one mutex: lifecycle entry points are the
//! funnel through which every shard worker reaches it, and no await ever
//! happens while it is held.
//!
//! Settlement per fill: consume the buyer's escrow, credit the seller,
//! move shares, journal everything. When an order terminates, its
//! reservation is finalized - escrow completed (with refund of price
//! headroom and unfilled quantity) or residual shares unlocked.

use crate::config::MarketConfig;
use crate::core_types::{EscrowId, OrderId, Points, Price, Qty, UserId, notional, now_ms};
use crate::engine::{Fill, MarketStats, MatchingEngine};
use crate::errors::CoreError;
use crate::escrow::{EscrowKind, EscrowManager};
use crate::events::{EventBus, Topic};
use crate::holdings::HoldingsBook;
use crate::ipo::IpoService;
use crate::journal::EntryKind;
use crate::clock::MarketClock;
use crate::ledger::Ledger;
use crate::models::{CancelReason, Order, OrderStatus, OrderType, Side, Trade};
use crate::orderbook::DepthSnapshot;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

// ============================================================
// ACKS
// ============================================================

/// Result of placing an order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub immediate_fills: Vec<Trade>,
    pub residual_status: OrderStatus,
}

/// Result of cancelling an order.
#[derive(Debug, Clone, Serialize)]
pub struct CancelAck {
    pub order_id: OrderId,
    pub qty_unfilled: Qty,
}

/// What an order holds while live: a point escrow for buys. Sell orders
/// lock shares instead; the locked residual always equals the order's
/// remaining quantity, so no extra state is needed.
#[derive(Debug, Clone)]
struct Reservation {
    escrow_id: Option<EscrowId>,
}

type PendingEvent = (Topic, Option<UserId>, serde_json::Value);

// ============================================================
// LIFECYCLE SERVICE
// ============================================================

pub struct OrderLifecycle {
    ledger: Arc<Ledger>,
    escrows: Arc<EscrowManager>,
    holdings: Arc<HoldingsBook>,
    ipo: Arc<IpoService>,
    clock: Arc<MarketClock>,
    bus: Arc<EventBus>,
    market_cfg: Arc<RwLock<MarketConfig>>,
    engine: Mutex<MatchingEngine>,
    orders: DashMap<OrderId, Order>,
    reservations: DashMap<OrderId, Reservation>,
    order_seq: AtomicU64,
    /// Last market state this service applied transitions for.
    market_open_state: Mutex<bool>,
}

impl OrderLifecycle {
    pub fn new(
        ledger: Arc<Ledger>,
        escrows: Arc<EscrowManager>,
        holdings: Arc<HoldingsBook>,
        ipo: Arc<IpoService>,
        clock: Arc<MarketClock>,
        bus: Arc<EventBus>,
        market_cfg: Arc<RwLock<MarketConfig>>,
    ) -> Self {
        let ipo_price = market_cfg
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ipo_price;
        Self {
            ledger,
            escrows,
            holdings,
            ipo,
            clock,
            bus,
            market_cfg,
            engine: Mutex::new(MatchingEngine::new(ipo_price)),
            orders: DashMap::new(),
            reservations: DashMap::new(),
            order_seq: AtomicU64::new(1),
            market_open_state: Mutex::new(false),
        }
    }

    fn engine_lock(&self) -> MutexGuard<'_, MatchingEngine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cfg(&self) -> MarketConfig {
        self.market_cfg
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ============================================================
    // PLACE ORDER
    // ============================================================

    pub fn place_order(
        &self,
        uid: UserId,
        side: Side,
        order_type: OrderType,
        qty: Qty,
        price: Option<Price>,
    ) -> Result<OrderAck, CoreError> {
        // Validation reports before any state change.
        self.ledger.check_actor(uid)?;
        if qty == 0 {
            return Err(CoreError::InvalidArgs("qty must be positive".into()));
        }
        match (order_type, price) {
            (OrderType::Limit, Some(p)) if p > 0 => {}
            (OrderType::Limit, _) => {
                return Err(CoreError::InvalidArgs(
                    "limit orders require a positive price".into(),
                ));
            }
            (OrderType::Market, None) => {}
            (OrderType::Market, Some(_)) => {
                return Err(CoreError::InvalidArgs(
                    "market orders carry no price".into(),
                ));
            }
        }
        if !self.clock.is_open() {
            return Err(CoreError::MarketClosed);
        }

        let cfg = self.cfg();
        let order_id = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let ts = now_ms();
        let mut order = match order_type {
            OrderType::Limit => Order::new_limit(order_id, uid, side, qty, price.unwrap_or(0), ts),
            OrderType::Market => Order::new_market(order_id, uid, side, qty, ts),
        };

        let mut events: Vec<PendingEvent> = Vec::new();
        let result = {
            let mut engine = self.engine_lock();

            // Any limit price outside the band is rejected outright.
            if order_type == OrderType::Limit {
                engine.validate_limit_price(order.resting_price(), cfg.band_bps)?;
            }

            // Reserve.
            match side {
                Side::Buy => {
                    let cap = match order_type {
                        OrderType::Limit => order.resting_price(),
                        OrderType::Market => engine.band(cfg.band_bps).high,
                    };
                    if cap == 0 {
                        return Err(CoreError::InvalidArgs(
                            "no reference price to cap a market buy".into(),
                        ));
                    }
                    let cost = notional(cap, qty)
                        .ok_or_else(|| CoreError::InvalidArgs("order too large".into()))?;
                    let reserved = cost + cfg.order_fee_for(cost);
                    let escrow_id =
                        self.escrows
                            .create(uid, reserved, EscrowKind::Order, &order_id.to_string())?;
                    self.reservations.insert(
                        order_id,
                        Reservation {
                            escrow_id: Some(escrow_id),
                        },
                    );
                }
                Side::Sell => {
                    self.holdings.lock(uid, qty)?;
                    self.reservations
                        .insert(order_id, Reservation { escrow_id: None });
                }
            }

            self.orders.insert(order_id, order.clone());
            events.push((
                Topic::OrderCreated,
                Some(uid),
                json!({
                    "order_id": order_id,
                    "side": side.as_str(),
                    "qty": qty,
                    "price": price,
                }),
            ));

            self.run_match(&mut engine, &mut order, &cfg, &mut events)
        };

        match result {
            Ok(fills) => {
                let ack = OrderAck {
                    order_id,
                    immediate_fills: fills,
                    residual_status: order.status,
                };
                self.flush_events(events);
                Ok(ack)
            }
            Err(e) => {
                self.bus.publish(
                    Topic::OrderFailed,
                    Some(uid),
                    json!({ "order_id": order_id, "error": e.code() }),
                );
                self.flush_events(events);
                self.escalate(&e);
                Err(e)
            }
        }
    }

    /// Match, settle, handle the residual, finalize. Runs entirely under
    /// the engine lock.
    fn run_match(
        &self,
        engine: &mut MatchingEngine,
        order: &mut Order,
        cfg: &MarketConfig,
        events: &mut Vec<PendingEvent>,
    ) -> Result<Vec<Trade>, CoreError> {
        let outcome = engine.match_order(order, cfg.band_bps);
        let mut trades: Vec<Trade> = Vec::new();

        for fill in &outcome.fills {
            self.settle_fill(fill, cfg, events)?;
            trades.push(fill.trade.clone());
        }
        for maker in &outcome.touched {
            self.apply_maker_update(maker)?;
        }

        // Residual handling.
        if order.qty_remaining > 0 {
            match order.order_type {
                OrderType::Market => {
                    if order.side == Side::Buy {
                        if let Some(fill) = self.try_ipo_residual(engine, order, cfg)? {
                            self.settle_fill(&fill, cfg, events)?;
                            trades.push(fill.trade.clone());
                        }
                    }
                    if order.qty_remaining > 0 {
                        // Market orders never rest.
                        order.mark_cancelled(CancelReason::MarketUnfilled, now_ms());
                        events.push((
                            Topic::OrderCancelled,
                            Some(order.uid),
                            json!({
                                "order_id": order.order_id,
                                "reason": CancelReason::MarketUnfilled.as_str(),
                                "qty_unfilled": order.qty_remaining,
                            }),
                        ));
                    }
                }
                OrderType::Limit => {
                    engine.insert_resting(order.clone());
                }
            }
        }

        self.orders.insert(order.order_id, order.clone());
        if order.status.is_terminal() {
            self.finalize_reservation(order)?;
        }

        if !trades.is_empty() {
            events.push((
                Topic::PriceUpdated,
                None,
                json!({
                    "last": engine.ref_price(),
                    "volume": trades.iter().map(|t| t.qty).sum::<Qty>(),
                }),
            ));
        }
        Ok(trades)
    }

    /// Fill a residual market buy from the IPO pool, limited by the
    /// remaining escrow headroom.
    fn try_ipo_residual(
        &self,
        engine: &mut MatchingEngine,
        order: &mut Order,
        cfg: &MarketConfig,
    ) -> Result<Option<Fill>, CoreError> {
        let escrow_id = self
            .reservations
            .get(&order.order_id)
            .and_then(|r| r.escrow_id.clone())
            .ok_or_else(|| {
                CoreError::InvariantViolation(format!(
                    "buy order {} has no escrow reservation",
                    order.order_id
                ))
            })?;
        let headroom = self.escrows.remaining(&escrow_id)?;
        let price = self.ipo.status().price;
        if price == 0 {
            return Ok(None);
        }

        // Largest q with price*q + fee(price*q) <= headroom.
        let per_unit = price as u128 * (10_000 + cfg.order_fee_bps as u128);
        let mut q = ((headroom as u128 * 10_000) / per_unit) as Qty;
        while q + 1 <= order.qty_remaining && Self::cost_with_fee(price, q + 1, cfg) <= headroom {
            q += 1;
        }
        let q = q.min(order.qty_remaining);
        if q == 0 {
            return Ok(None);
        }

        let (taken, price) = self.ipo.take_up_to(q);
        if taken == 0 {
            return Ok(None);
        }
        Ok(Some(engine.record_ipo_fill(order, taken, price)))
    }

    fn cost_with_fee(price: Price, qty: Qty, cfg: &MarketConfig) -> Points {
        let cost = notional(price, qty).unwrap_or(Points::MAX);
        cost.saturating_add(cfg.order_fee_for(cost))
    }

    /// Settle one fill: buyer escrow spend (+fee), seller share spend and
    /// proceeds credit (+fee), holdings update.
    fn settle_fill(
        &self,
        fill: &Fill,
        cfg: &MarketConfig,
        events: &mut Vec<PendingEvent>,
    ) -> Result<(), CoreError> {
        let trade = &fill.trade;
        let amount = notional(trade.price, trade.qty).ok_or_else(|| {
            CoreError::InvariantViolation(format!("trade {} notional overflow", trade.trade_id))
        })?;
        let fee = cfg.order_fee_for(amount);

        // Buyer pays out of the order escrow.
        let escrow_id = self
            .reservations
            .get(&trade.buy_order_id)
            .and_then(|r| r.escrow_id.clone())
            .ok_or_else(|| {
                CoreError::InvariantViolation(format!(
                    "buy order {} has no escrow reservation",
                    trade.buy_order_id
                ))
            })?;
        self.escrows.spend(
            &escrow_id,
            amount,
            EntryKind::TradeBuy,
            &format!("trade {}", trade.trade_id),
        )?;
        if fee > 0 {
            self.escrows.spend(
                &escrow_id,
                fee,
                EntryKind::Fee,
                &format!("order fee trade {}", trade.trade_id),
            )?;
        }
        self.holdings.buy_fill(fill.buyer, trade.qty, trade.price);

        // Seller hands over locked shares and receives the proceeds.
        if let Some(seller) = fill.seller {
            self.holdings.spend_locked(seller, trade.qty)?;
            self.ledger.credit(
                seller,
                amount,
                EntryKind::TradeSell,
                &format!("trade {}", trade.trade_id),
            )?;
            if fee > 0 {
                self.ledger.debit_checked(
                    seller,
                    fee,
                    EntryKind::Fee,
                    &format!("order fee trade {}", trade.trade_id),
                )?;
            }
        }

        events.push((
            Topic::OrderMatched,
            Some(fill.buyer),
            json!({
                "trade_id": trade.trade_id,
                "buy_order_id": trade.buy_order_id,
                "sell_order_id": trade.sell_order_id,
                "price": trade.price,
                "qty": trade.qty,
                "buyer": fill.buyer,
                "seller": fill.seller,
            }),
        ));
        events.push((Topic::UserPortfolioUpdated, Some(fill.buyer), json!({})));
        if let Some(seller) = fill.seller {
            events.push((Topic::UserPortfolioUpdated, Some(seller), json!({})));
        }
        Ok(())
    }

    /// Refresh the stored copy of a resting order the matcher touched and
    /// finalize it if it filled completely.
    fn apply_maker_update(&self, maker: &Order) -> Result<(), CoreError> {
        self.orders.insert(maker.order_id, maker.clone());
        if maker.status.is_terminal() {
            self.finalize_reservation(maker)?;
        }
        Ok(())
    }

    /// Release whatever a terminated order still holds.
    fn finalize_reservation(&self, order: &Order) -> Result<(), CoreError> {
        let Some((_, reservation)) = self.reservations.remove(&order.order_id) else {
            return Ok(()); // Already finalized
        };
        match order.side {
            Side::Buy => {
                if let Some(escrow_id) = reservation.escrow_id {
                    match order.status {
                        OrderStatus::Filled => {
                            let actual = self
                                .escrows
                                .get(&escrow_id)
                                .map(|e| e.spent)
                                .unwrap_or(0);
                            self.escrows.complete(&escrow_id, actual)?;
                        }
                        OrderStatus::Cancelled | OrderStatus::Expired => {
                            let reason = order
                                .cancel_reason
                                .map(|r| r.as_str())
                                .unwrap_or("cancelled");
                            self.escrows.cancel(&escrow_id, reason)?;
                        }
                        _ => {
                            return Err(CoreError::InvariantViolation(format!(
                                "finalizing non-terminal order {}",
                                order.order_id
                            )));
                        }
                    }
                }
            }
            Side::Sell => {
                if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Expired) {
                    self.holdings.unlock(order.uid, order.qty_remaining)?;
                }
            }
        }
        Ok(())
    }

    // ============================================================
    // CANCEL
    // ============================================================

    /// Cancel a resting order. Allowed while the market is closed.
    pub fn cancel_order(
        &self,
        uid: UserId,
        order_id: OrderId,
        reason: CancelReason,
    ) -> Result<CancelAck, CoreError> {
        {
            let stored = self.orders.get(&order_id).ok_or(CoreError::OrderNotFound)?;
            if stored.uid != uid {
                return Err(CoreError::NotOwner);
            }
        }

        let cancelled = {
            let mut engine = self.engine_lock();
            // Re-read under the lock: a fill may have raced ahead.
            let current = self
                .orders
                .get(&order_id)
                .map(|o| o.clone())
                .ok_or(CoreError::OrderNotFound)?;
            if !current.is_resting() {
                return Err(CoreError::NotCancellable(current.status));
            }
            let mut order = engine.remove_order(order_id).unwrap_or(current);
            order.mark_cancelled(reason, now_ms());
            self.orders.insert(order_id, order.clone());
            self.finalize_reservation(&order)?;
            order
        };

        self.bus.publish(
            Topic::OrderCancelled,
            Some(uid),
            json!({
                "order_id": order_id,
                "reason": reason.as_str(),
                "qty_unfilled": cancelled.qty_remaining,
            }),
        );
        Ok(CancelAck {
            order_id,
            qty_unfilled: cancelled.qty_remaining,
        })
    }

    /// Cancel every resting order (session end, forced settlement).
    pub fn cancel_all(&self, reason: CancelReason) -> Vec<OrderId> {
        let mut events: Vec<PendingEvent> = Vec::new();
        let cancelled: Vec<OrderId> = {
            let mut engine = self.engine_lock();
            let resting = engine.drain_book();
            let mut ids = Vec::with_capacity(resting.len());
            for mut order in resting {
                order.mark_cancelled(reason, now_ms());
                self.orders.insert(order.order_id, order.clone());
                if let Err(e) = self.finalize_reservation(&order) {
                    self.escalate(&e);
                }
                events.push((
                    Topic::OrderCancelled,
                    Some(order.uid),
                    json!({
                        "order_id": order.order_id,
                        "reason": reason.as_str(),
                        "qty_unfilled": order.qty_remaining,
                    }),
                ));
                ids.push(order.order_id);
            }
            ids
        };
        self.flush_events(events);
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), reason = reason.as_str(), "orders force-cancelled");
        }
        cancelled
    }

    /// Cancel resting orders older than `max_age_ms` (escrow janitor).
    pub fn cancel_stale_orders(&self, max_age_ms: i64) -> usize {
        let cutoff = now_ms() - max_age_ms;
        let stale: Vec<(OrderId, UserId)> = self
            .orders
            .iter()
            .filter(|o| o.is_resting() && o.ts_created < cutoff)
            .map(|o| (o.order_id, o.uid))
            .collect();
        let mut count = 0;
        for (order_id, uid) in stale {
            match self.cancel_order(uid, order_id, CancelReason::ExpiredCleanup) {
                Ok(_) => count += 1,
                Err(CoreError::NotCancellable(_)) | Err(CoreError::OrderNotFound) => {}
                Err(e) => self.escalate(&e),
            }
        }
        count
    }

    // ============================================================
    // IPO PURCHASE
    // ============================================================

    /// Buy directly from the primary pool at the fixed IPO price.
    pub fn ipo_buy(&self, uid: UserId, qty: Qty) -> Result<OrderAck, CoreError> {
        self.ledger.check_actor(uid)?;
        if qty == 0 {
            return Err(CoreError::InvalidArgs("qty must be positive".into()));
        }
        if !self.clock.is_open() {
            return Err(CoreError::MarketClosed);
        }

        let cfg = self.cfg();
        let price = self.ipo.status().price;
        let cost = notional(price, qty)
            .ok_or_else(|| CoreError::InvalidArgs("order too large".into()))?;
        let reserved = cost + cfg.order_fee_for(cost);

        let order_id = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let mut order = Order::new_market(order_id, uid, Side::Buy, qty, now_ms());

        let escrow_id = self
            .escrows
            .create(uid, reserved, EscrowKind::Order, &order_id.to_string())?;
        self.reservations.insert(
            order_id,
            Reservation {
                escrow_id: Some(escrow_id.clone()),
            },
        );

        if let Err(e) = self.ipo.take_exact(qty) {
            self.reservations.remove(&order_id);
            self.escrows.cancel(&escrow_id, "ipo_unavailable")?;
            return Err(e);
        }

        let mut events: Vec<PendingEvent> = Vec::new();
        let result: Result<Trade, CoreError> = {
            let mut engine = self.engine_lock();
            let fill = engine.record_ipo_fill(&mut order, qty, price);
            self.settle_fill(&fill, &cfg, &mut events).map(|_| fill.trade)
        };

        match result {
            Ok(trade) => {
                self.orders.insert(order_id, order.clone());
                self.finalize_reservation(&order)?;
                self.flush_events(events);
                Ok(OrderAck {
                    order_id,
                    immediate_fills: vec![trade],
                    residual_status: order.status,
                })
            }
            Err(e) => {
                // Allocation succeeded but settlement failed: put the
                // shares back and refund the reserve.
                self.ipo.put_back(qty);
                self.reservations.remove(&order_id);
                if let Err(inner) = self.escrows.cancel(&escrow_id, "settlement_failed") {
                    self.escalate(&inner);
                }
                self.flush_events(events);
                self.escalate(&e);
                Err(e)
            }
        }
    }

    // ============================================================
    // MARKET TRANSITIONS
    // ============================================================

    /// Apply any pending open/close transition. Idempotent; called by the
    /// clock watcher and directly after admin overrides.
    pub fn sync_market_state(&self) {
        let open_now = self.clock.is_open();
        let mut state = self
            .market_open_state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *state == open_now {
            return;
        }
        *state = open_now;

        if open_now {
            self.engine_lock().start_session();
            self.run_call_auction();
            self.bus.publish(Topic::MarketOpened, None, json!({}));
            tracing::info!("market opened");
        } else {
            self.cancel_all(CancelReason::MarketClosed);
            let close = self.engine_lock().end_session();
            self.bus
                .publish(Topic::MarketClosed, None, json!({ "close": close }));
            tracing::info!(close, "market closed");
        }
    }

    /// Batch-match all resting orders at one clearing price. Publishes a
    /// single aggregated price update on success.
    pub fn run_call_auction(&self) -> Option<Price> {
        let cfg = self.cfg();
        let mut events: Vec<PendingEvent> = Vec::new();
        let clearing = {
            let mut engine = self.engine_lock();
            let outcome = engine.run_call_auction();
            for fill in &outcome.fills {
                // Auction fills settle like continuous fills but publish
                // only the aggregated price update below.
                let mut fill_events = Vec::new();
                if let Err(e) = self.settle_fill(fill, &cfg, &mut fill_events) {
                    self.escalate(&e);
                }
            }
            for touched in &outcome.touched {
                if let Err(e) = self.apply_maker_update(touched) {
                    self.escalate(&e);
                }
            }
            if let Some(p) = outcome.clearing_price {
                let volume: Qty = outcome.fills.iter().map(|f| f.trade.qty).sum();
                events.push((
                    Topic::PriceUpdated,
                    None,
                    json!({ "last": p, "auction_volume": volume }),
                ));
            }
            outcome.clearing_price
        };
        self.flush_events(events);
        clearing
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn market_stats(&self) -> MarketStats {
        self.engine_lock().stats()
    }

    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        self.engine_lock().depth(levels)
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.engine_lock().recent_trades(limit)
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|o| o.clone())
    }

    /// A user's orders, newest first.
    pub fn order_history(&self, uid: UserId, limit: usize) -> Vec<Order> {
        let mut mine: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.uid == uid)
            .map(|o| o.clone())
            .collect();
        mine.sort_by(|a, b| {
            b.ts_created
                .cmp(&a.ts_created)
                .then(b.order_id.cmp(&a.order_id))
        });
        mine.truncate(limit);
        mine
    }

    pub fn resting_order_count(&self) -> usize {
        self.orders.iter().filter(|o| o.is_resting()).count()
    }

    // ============================================================
    // INTERNAL
    // ============================================================

    /// Admin hook: IPO price changes move the pre-trade reference price.
    pub(crate) fn set_ipo_fallback(&self, price: Price) {
        self.engine_lock().set_ipo_fallback(price);
    }

    fn flush_events(&self, events: Vec<PendingEvent>) {
        for (topic, uid, payload) in events {
            self.bus.publish(topic, uid, payload);
        }
    }

    /// Invariant violations are fatal for the operation: log, emit
    /// SYSTEM_MAINTENANCE, and let the caller surface a generic error.
    fn escalate(&self, e: &CoreError) {
        if let CoreError::InvariantViolation(msg) = e {
            tracing::error!(error = %msg, "invariant violation");
            self.bus
                .publish(Topic::SystemMaintenance, None, json!({ "error": msg }));
        }
    }
}
