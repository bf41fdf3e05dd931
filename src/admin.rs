//! Admin operations - grants, market policy, session control, settlement
//!
//! Thin orchestration over the core services. Everything here is an
//! operator action; user-facing flows never call into this module.

use crate::auditor::{AuditReport, IntegrityAuditor};
use crate::clock::MarketClock;
use crate::config::{MarketConfig, TradingWindow};
use crate::core_types::{Points, Price, Qty, UserId, notional};
use crate::errors::CoreError;
use crate::events::{EventBus, Topic};
use crate::holdings::HoldingsBook;
use crate::ipo::IpoService;
use crate::journal::EntryKind;
use crate::ledger::Ledger;
use crate::lifecycle::OrderLifecycle;
use crate::models::CancelReason;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, RwLock};

/// Recipient of an admin grant.
#[derive(Debug, Clone)]
pub enum GrantTarget {
    User(UserId),
    Team(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub orders_cancelled: usize,
    pub users_settled: usize,
    pub shares_converted: Qty,
    pub points_paid: Points,
}

pub struct AdminService {
    ledger: Arc<Ledger>,
    lifecycle: Arc<OrderLifecycle>,
    holdings: Arc<HoldingsBook>,
    ipo: Arc<IpoService>,
    clock: Arc<MarketClock>,
    auditor: Arc<IntegrityAuditor>,
    bus: Arc<EventBus>,
    market_cfg: Arc<RwLock<MarketConfig>>,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        lifecycle: Arc<OrderLifecycle>,
        holdings: Arc<HoldingsBook>,
        ipo: Arc<IpoService>,
        clock: Arc<MarketClock>,
        auditor: Arc<IntegrityAuditor>,
        bus: Arc<EventBus>,
        market_cfg: Arc<RwLock<MarketConfig>>,
    ) -> Self {
        Self {
            ledger,
            lifecycle,
            holdings,
            ipo,
            clock,
            auditor,
            bus,
            market_cfg,
        }
    }

    // ============================================================
    // GRANTS
    // ============================================================

    /// Credit points to a user or to every member of a team. Returns the
    /// number of users credited.
    pub fn give_points(
        &self,
        target: GrantTarget,
        amount: Points,
        note: &str,
    ) -> Result<usize, CoreError> {
        let uids = match &target {
            GrantTarget::User(uid) => vec![*uid],
            GrantTarget::Team(team) => {
                let members = self.ledger.users_in_team(team);
                if members.is_empty() {
                    return Err(CoreError::InvalidArgs(format!("unknown team: {team}")));
                }
                members
            }
        };
        for &uid in &uids {
            self.ledger
                .credit(uid, amount, EntryKind::AdminGrant, note)?;
            self.bus
                .publish(Topic::UserPointsUpdated, Some(uid), json!({}));
        }
        tracing::info!(count = uids.len(), amount, "admin grant applied");
        Ok(uids.len())
    }

    pub fn set_user_enabled(&self, uid: UserId, enabled: bool) -> Result<(), CoreError> {
        self.ledger.set_enabled(uid, enabled)
    }

    pub fn set_user_frozen(&self, uid: UserId, frozen: bool) -> Result<(), CoreError> {
        self.ledger.set_frozen(uid, frozen)
    }

    // ============================================================
    // MARKET POLICY
    // ============================================================

    /// Set the up/down limit, in basis points.
    pub fn set_band(&self, band_bps: u32) {
        self.market_cfg
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .band_bps = band_bps;
        tracing::info!(band_bps, "price band updated");
    }

    pub fn set_windows(&self, windows: Vec<TradingWindow>) {
        self.market_cfg
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .windows = windows.clone();
        self.clock.set_windows(windows);
        self.lifecycle.sync_market_state();
    }

    // ============================================================
    // SESSION CONTROL
    // ============================================================

    pub fn manual_open(&self) {
        self.clock.force_open();
        self.lifecycle.sync_market_state();
    }

    pub fn manual_close(&self) {
        self.clock.force_close();
        self.lifecycle.sync_market_state();
    }

    /// Back to schedule-driven open/close.
    pub fn clear_override(&self) {
        self.clock.clear_override();
        self.lifecycle.sync_market_state();
    }

    pub fn manual_call_auction(&self) -> Option<Price> {
        self.lifecycle.run_call_auction()
    }

    // ============================================================
    // IPO
    // ============================================================

    pub fn ipo_reset(&self, shares: Qty, price: Price) {
        self.ipo.admin_reset(shares, price);
        self.lifecycle.set_ipo_fallback(price);
        let mut cfg = self.market_cfg.write().unwrap_or_else(|e| e.into_inner());
        cfg.ipo_shares = shares;
        cfg.ipo_price = price;
    }

    pub fn ipo_update(&self, shares: Option<Qty>, price: Option<Price>) {
        self.ipo.admin_update(shares, price);
        if let Some(price) = price {
            self.lifecycle.set_ipo_fallback(price);
            self.market_cfg
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .ipo_price = price;
        }
        if let Some(shares) = shares {
            self.market_cfg
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .ipo_shares = shares;
        }
    }

    // ============================================================
    // SETTLEMENT & AUDIT
    // ============================================================

    /// Cancel every open order, then convert every holding to points at
    /// the given price. Share total drops to zero.
    pub fn final_settlement(&self, price: Price) -> Result<SettlementReport, CoreError> {
        let cancelled = self.lifecycle.cancel_all(CancelReason::FinalSettlement);

        let positions = self.holdings.drain_all();
        let mut users_settled = 0;
        let mut shares_converted = 0;
        let mut points_paid = 0;
        for (uid, qty) in positions {
            shares_converted += qty;
            let value = notional(price, qty).ok_or_else(|| {
                CoreError::InvariantViolation(format!("settlement overflow for uid {uid}"))
            })?;
            if value > 0 {
                self.ledger
                    .credit(uid, value, EntryKind::Settlement, "final settlement")?;
                points_paid += value;
            }
            users_settled += 1;
            self.bus
                .publish(Topic::UserPointsUpdated, Some(uid), json!({}));
        }

        let report = SettlementReport {
            orders_cancelled: cancelled.len(),
            users_settled,
            shares_converted,
            points_paid,
        };
        tracing::info!(?report, price, "final settlement complete");
        self.bus.publish(
            Topic::SystemMaintenance,
            None,
            json!({ "final_settlement": { "price": price, "users": users_settled } }),
        );
        Ok(report)
    }

    pub fn check_negative_balances(&self, fix: bool) -> AuditReport {
        self.auditor.run(fix)
    }
}
