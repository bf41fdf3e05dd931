//! Market query API - read-only views for outer layers
//!
//! Everything the HTTP/bot collaborators need to render prices, depth,
//! portfolios and history. Pure reads; no state changes.

use crate::clock::MarketClock;
use crate::config::{MarketConfig, TradingWindow};
use crate::core_types::{Points, Price, Qty, TsMillis, UserId};
use crate::errors::CoreError;
use crate::holdings::{HoldingView, HoldingsBook};
use crate::ipo::{IpoService, IpoStatus};
use crate::journal::JournalEntry;
use crate::ledger::Ledger;
use crate::lifecycle::OrderLifecycle;
use crate::models::{Order, Trade};
use crate::orderbook::DepthSnapshot;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, RwLock};

pub const DEFAULT_DEPTH_LEVELS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct PriceSummary {
    pub last: Option<Price>,
    pub open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub change: Points,
    /// Percent change since open, truncated to two decimals.
    pub change_pct: Option<Decimal>,
    pub volume: Qty,
    pub band_bps: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub is_open: bool,
    pub next_transition_ts: Option<TsMillis>,
    pub windows: Vec<TradingWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub uid: UserId,
    pub points: Points,
    pub escrow: Points,
    pub owed: Points,
    pub holdings: Vec<HoldingView>,
    pub total_value_at_ref_price: Points,
}

pub struct MarketQuery {
    ledger: Arc<Ledger>,
    holdings: Arc<HoldingsBook>,
    lifecycle: Arc<OrderLifecycle>,
    clock: Arc<MarketClock>,
    ipo: Arc<IpoService>,
    market_cfg: Arc<RwLock<MarketConfig>>,
}

impl MarketQuery {
    pub fn new(
        ledger: Arc<Ledger>,
        holdings: Arc<HoldingsBook>,
        lifecycle: Arc<OrderLifecycle>,
        clock: Arc<MarketClock>,
        ipo: Arc<IpoService>,
        market_cfg: Arc<RwLock<MarketConfig>>,
    ) -> Self {
        Self {
            ledger,
            holdings,
            lifecycle,
            clock,
            ipo,
            market_cfg,
        }
    }

    pub fn price_summary(&self) -> PriceSummary {
        let stats = self.lifecycle.market_stats();
        let band_bps = self
            .market_cfg
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .band_bps;

        let change = match (stats.last, stats.session_open) {
            (Some(last), Some(open)) => last as Points - open as Points,
            _ => 0,
        };
        let change_pct = stats.session_open.filter(|&o| o > 0).map(|open| {
            (Decimal::from(change) * Decimal::from(100) / Decimal::from(open)).trunc_with_scale(2)
        });

        PriceSummary {
            last: stats.last,
            open: stats.session_open,
            high: stats.high,
            low: stats.low,
            change,
            change_pct,
            volume: stats.volume,
            band_bps,
        }
    }

    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        self.lifecycle.depth(if levels == 0 { DEFAULT_DEPTH_LEVELS } else { levels })
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.lifecycle.recent_trades(limit)
    }

    pub fn market_status(&self) -> MarketStatus {
        MarketStatus {
            is_open: self.clock.is_open(),
            next_transition_ts: self.clock.next_transition_ts(),
            windows: self.clock.windows(),
        }
    }

    pub fn ipo_status(&self) -> IpoStatus {
        self.ipo.status()
    }

    pub fn portfolio(&self, uid: UserId) -> Result<Portfolio, CoreError> {
        let snap = self.ledger.snapshot(uid)?;
        let holding = self.holdings.view(uid);
        let ref_price = self.lifecycle.market_stats().ref_price;
        let share_value = (holding.shares + holding.locked) as i128 * ref_price as i128;
        let total = snap.points as i128 + snap.escrow as i128 + share_value;

        let holdings = if holding.shares + holding.locked > 0 {
            vec![holding]
        } else {
            Vec::new()
        };
        Ok(Portfolio {
            uid,
            points: snap.points,
            escrow: snap.escrow,
            owed: snap.owed,
            holdings,
            total_value_at_ref_price: total.min(Points::MAX as i128) as Points,
        })
    }

    pub fn order_history(&self, uid: UserId, limit: usize) -> Vec<Order> {
        self.lifecycle.order_history(uid, limit)
    }

    pub fn ledger_history(&self, uid: UserId, limit: usize) -> Vec<JournalEntry> {
        self.ledger.entries_for(uid, limit)
    }
}
