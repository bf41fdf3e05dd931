//! Holdings - share inventory per user
//!
//! Tracks avail and locked (reserved for resting sell orders) share
//! amounts plus the average cost of the position. Average cost is a
//! `Decimal` updated as a weighted mean on buys and left unchanged on
//! sells; it is truncated to two fractional digits only for display.

use crate::core_types::{Price, Qty, UserId};
use crate::errors::CoreError;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

/// Share position of a single user.
///
/// A holding with zero shares may exist; it is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Holding {
    avail: Qty,  // Sellable
    locked: Qty, // Reserved by resting sell orders
    avg_cost: Decimal,
}

impl Holding {
    #[inline]
    pub fn avail(&self) -> Qty {
        self.avail
    }

    #[inline]
    pub fn locked(&self) -> Qty {
        self.locked
    }

    /// Total position = avail + locked.
    #[inline]
    pub fn total(&self) -> Qty {
        self.avail + self.locked
    }

    #[inline]
    pub fn avg_cost(&self) -> Decimal {
        self.avg_cost
    }
}

/// Read-only view for the portfolio API.
#[derive(Debug, Clone, Serialize)]
pub struct HoldingView {
    pub uid: UserId,
    pub shares: Qty,
    pub locked: Qty,
    pub avg_cost: Decimal,
}

/// All user holdings for the single instrument.
#[derive(Debug, Default)]
pub struct HoldingsBook {
    holdings: DashMap<UserId, Holding>,
}

impl HoldingsBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit shares from a buy fill, updating the average cost as a
    /// weighted mean over the whole position.
    pub fn buy_fill(&self, uid: UserId, qty: Qty, price: Price) {
        let mut h = self.holdings.entry(uid).or_default();
        let old_total = h.total();
        let new_total = old_total + qty;
        if new_total > 0 {
            let old_value = h.avg_cost * Decimal::from(old_total);
            let fill_value = Decimal::from(price) * Decimal::from(qty);
            h.avg_cost = (old_value + fill_value) / Decimal::from(new_total);
        }
        h.avail += qty;
    }

    /// Reserve shares for a sell order. The check and the decrement are
    /// one step under the entry lock.
    pub fn lock(&self, uid: UserId, qty: Qty) -> Result<(), CoreError> {
        let mut h = self.holdings.entry(uid).or_default();
        if h.avail < qty {
            return Err(CoreError::InsufficientShares);
        }
        h.avail -= qty;
        h.locked += qty;
        Ok(())
    }

    /// Return reserved shares (order cancelled or residual unfilled).
    pub fn unlock(&self, uid: UserId, qty: Qty) -> Result<(), CoreError> {
        if qty == 0 {
            return Ok(());
        }
        let mut h = self
            .holdings
            .get_mut(&uid)
            .ok_or_else(|| CoreError::InvariantViolation(format!("no holding for uid {uid}")))?;
        if h.locked < qty {
            return Err(CoreError::InvariantViolation(format!(
                "unlock {qty} exceeds locked {} for uid {uid}",
                h.locked
            )));
        }
        h.locked -= qty;
        h.avail += qty;
        Ok(())
    }

    /// Consume reserved shares on a sell fill. Average cost is unchanged.
    pub fn spend_locked(&self, uid: UserId, qty: Qty) -> Result<(), CoreError> {
        let mut h = self
            .holdings
            .get_mut(&uid)
            .ok_or_else(|| CoreError::InvariantViolation(format!("no holding for uid {uid}")))?;
        if h.locked < qty {
            return Err(CoreError::InvariantViolation(format!(
                "sell fill {qty} exceeds locked {} for uid {uid}",
                h.locked
            )));
        }
        h.locked -= qty;
        Ok(())
    }

    pub fn view(&self, uid: UserId) -> HoldingView {
        let h = self.holdings.get(&uid);
        match h {
            Some(h) => HoldingView {
                uid,
                shares: h.avail,
                locked: h.locked,
                avg_cost: h.avg_cost,
            },
            None => HoldingView {
                uid,
                shares: 0,
                locked: 0,
                avg_cost: Decimal::ZERO,
            },
        }
    }

    pub fn total_of(&self, uid: UserId) -> Qty {
        self.holdings.get(&uid).map(|h| h.total()).unwrap_or(0)
    }

    /// Total shares across all users (conservation check input).
    pub fn total_shares(&self) -> Qty {
        self.holdings.iter().map(|h| h.total()).sum()
    }

    pub fn all(&self) -> Vec<HoldingView> {
        self.holdings
            .iter()
            .map(|h| HoldingView {
                uid: *h.key(),
                shares: h.avail,
                locked: h.locked,
                avg_cost: h.avg_cost,
            })
            .collect()
    }

    /// Take every position, zeroing the book. Used by final settlement;
    /// returns `(uid, total_shares)` for each non-empty holding.
    pub fn drain_all(&self) -> Vec<(UserId, Qty)> {
        let mut out = Vec::new();
        for mut h in self.holdings.iter_mut() {
            let total = h.total();
            if total > 0 {
                out.push((*h.key(), total));
            }
            h.avail = 0;
            h.locked = 0;
            h.avg_cost = Decimal::ZERO;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_buy_updates_weighted_avg_cost() {
        let book = HoldingsBook::new();
        book.buy_fill(1, 1, 20);
        assert_eq!(book.view(1).avg_cost, dec("20"));

        // 1 @ 20 then 3 @ 21: avg = (20 + 63) / 4 = 20.75
        book.buy_fill(1, 3, 21);
        assert_eq!(book.view(1).avg_cost, dec("20.75"));
        assert_eq!(book.view(1).shares, 4);
    }

    #[test]
    fn test_sell_leaves_avg_cost_unchanged() {
        let book = HoldingsBook::new();
        book.buy_fill(1, 4, 20);
        book.lock(1, 2).unwrap();
        book.spend_locked(1, 2).unwrap();

        let v = book.view(1);
        assert_eq!(v.shares, 2);
        assert_eq!(v.locked, 0);
        assert_eq!(v.avg_cost, dec("20"));
    }

    #[test]
    fn test_lock_checks_avail() {
        let book = HoldingsBook::new();
        book.buy_fill(1, 10, 30);

        book.lock(1, 10).unwrap();
        assert_eq!(book.view(1).shares, 0);
        assert_eq!(book.view(1).locked, 10);

        assert_eq!(book.lock(1, 1), Err(CoreError::InsufficientShares));
        assert_eq!(book.lock(2, 1), Err(CoreError::InsufficientShares));
    }

    #[test]
    fn test_partial_fill_then_unlock() {
        // Seller locks 10, fills 3, cancels: 7 shares come back.
        let book = HoldingsBook::new();
        book.buy_fill(1, 10, 30);
        book.lock(1, 10).unwrap();
        book.spend_locked(1, 3).unwrap();
        book.unlock(1, 7).unwrap();

        let v = book.view(1);
        assert_eq!(v.shares, 7);
        assert_eq!(v.locked, 0);
    }

    #[test]
    fn test_total_shares_conservation() {
        let book = HoldingsBook::new();
        book.buy_fill(1, 3, 20);
        book.buy_fill(2, 1, 20);
        book.lock(1, 3).unwrap();
        assert_eq!(book.total_shares(), 4);
    }

    #[test]
    fn test_drain_all() {
        let book = HoldingsBook::new();
        book.buy_fill(1, 4, 20);
        book.buy_fill(2, 2, 25);

        let mut drained = book.drain_all();
        drained.sort_unstable();
        assert_eq!(drained, vec![(1, 4), (2, 2)]);
        assert_eq!(book.total_shares(), 0);
    }

    #[test]
    fn test_avg_cost_survives_many_buys() {
        let book = HoldingsBook::new();
        for _ in 0..10_000 {
            book.buy_fill(1, 1, 33);
        }
        // Exact: every buy at 33 keeps the mean at exactly 33.
        assert_eq!(book.view(1).avg_cost, dec("33"));
        assert_eq!(book.view(1).shares, 10_000);
    }
}
