//! Escrow manager - reserve, spend, complete, cancel
//!
//! Point escrow works like a bank hold: funds move from `points` to
//! `escrow` at reservation and leave `escrow` as fills consume them; the
//! unconsumed remainder returns to `points` when the escrow terminates.
//!
//! State machine per escrow: `active -> completed` or `active -> cancelled`.
//! No other transitions.
//!
//! Every mutation runs under the owner's ledger row lock so the balance
//! move, the escrow record update and the journal append are one unit;
//! the invariant `sum(remaining over active escrows of uid) = user.escrow`
//! holds after every operation.

use crate::core_types::{EscrowId, Points, TsMillis, UserId, now_ms};
use crate::errors::CoreError;
use crate::journal::EntryKind;
use crate::ledger::Ledger;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowKind {
    Order,
    Transfer,
    Pvp,
}

impl EscrowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowKind::Order => "order",
            EscrowKind::Transfer => "transfer",
            EscrowKind::Pvp => "pvp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Active,
    Completed,
    Cancelled,
}

/// One escrow record.
///
/// A completed or cancelled escrow satisfies
/// `actual_amount + refund = amount_reserved`.
#[derive(Debug, Clone, Serialize)]
pub struct Escrow {
    pub escrow_id: EscrowId,
    pub uid: UserId,
    pub amount_reserved: Points,
    /// Consumed so far by fills / fees.
    pub spent: Points,
    pub kind: EscrowKind,
    /// Related entity (order id, transfer tx, pvp challenge).
    pub ref_id: String,
    pub status: EscrowStatus,
    pub ts_created: TsMillis,
    pub ts_completed: Option<TsMillis>,
    pub ts_cancelled: Option<TsMillis>,
    pub cancel_reason: Option<String>,
    pub actual_amount: Option<Points>,
    pub refund: Option<Points>,
}

impl Escrow {
    /// Reserved amount not yet consumed.
    #[inline]
    pub fn remaining(&self) -> Points {
        self.amount_reserved - self.spent
    }
}

pub struct EscrowManager {
    ledger: Arc<Ledger>,
    records: DashMap<EscrowId, Escrow>,
}

impl EscrowManager {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            records: DashMap::new(),
        }
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Reserve `amount` points for a pending obligation.
    ///
    /// The balance move, the record insert and the `escrow_reserve`
    /// journal entry happen under one row lock.
    pub fn create(
        &self,
        uid: UserId,
        amount: Points,
        kind: EscrowKind,
        ref_id: &str,
    ) -> Result<EscrowId, CoreError> {
        if amount <= 0 {
            return Err(CoreError::InvalidArgs(format!(
                "escrow amount must be positive, got {amount}"
            )));
        }
        let escrow_id = ulid::Ulid::new().to_string();
        self.ledger.with_row(uid, |row, journal| {
            Ledger::journalled_move_to_escrow(
                row,
                journal,
                amount,
                &format!("escrow {} {}", kind.as_str(), ref_id),
                Some(&escrow_id),
            )?;
            self.records.insert(
                escrow_id.clone(),
                Escrow {
                    escrow_id: escrow_id.clone(),
                    uid,
                    amount_reserved: amount,
                    spent: 0,
                    kind,
                    ref_id: ref_id.to_string(),
                    status: EscrowStatus::Active,
                    ts_created: now_ms(),
                    ts_completed: None,
                    ts_cancelled: None,
                    cancel_reason: None,
                    actual_amount: None,
                    refund: None,
                },
            );
            Ok(())
        })?;
        tracing::debug!(uid, amount, kind = kind.as_str(), escrow_id = %escrow_id, "escrow created");
        Ok(escrow_id)
    }

    /// Consume part of an active escrow (a fill debit or an escrowed fee).
    pub fn spend(
        &self,
        escrow_id: &str,
        amount: Points,
        entry_kind: EntryKind,
        note: &str,
    ) -> Result<(), CoreError> {
        if amount == 0 {
            return Ok(());
        }
        let uid = self.uid_of_active(escrow_id)?;
        self.ledger.with_row(uid, |row, journal| {
            let mut rec = self
                .records
                .get_mut(escrow_id)
                .ok_or(CoreError::EscrowNotActive)?;
            if rec.status != EscrowStatus::Active {
                return Err(CoreError::EscrowNotActive);
            }
            if rec.remaining() < amount {
                return Err(CoreError::InvariantViolation(format!(
                    "escrow {escrow_id} spend {amount} exceeds remaining {}",
                    rec.remaining()
                )));
            }
            Ledger::journalled_spend_from_escrow(
                row,
                journal,
                amount,
                entry_kind,
                note,
                Some(escrow_id),
            )?;
            rec.spent += amount;
            Ok(())
        })
    }

    /// Complete an active escrow.
    ///
    /// `actual` must equal the consumed amount recorded by `spend`; the
    /// unconsumed remainder is refunded to `points` and journalled as
    /// `escrow_release`. Returns the refund.
    pub fn complete(&self, escrow_id: &str, actual: Points) -> Result<Points, CoreError> {
        self.finalize(escrow_id, Some(actual), None)
    }

    /// Cancel an active escrow: everything not yet consumed is refunded.
    ///
    /// For an untouched escrow this returns the full reserved amount,
    /// like `complete(escrow_id, 0)` with different bookkeeping fields.
    pub fn cancel(&self, escrow_id: &str, reason: &str) -> Result<Points, CoreError> {
        self.finalize(escrow_id, None, Some(reason.to_string()))
    }

    fn finalize(
        &self,
        escrow_id: &str,
        expect_actual: Option<Points>,
        cancel_reason: Option<String>,
    ) -> Result<Points, CoreError> {
        let uid = self.uid_of_active(escrow_id)?;
        let refund = self.ledger.with_row(uid, |row, journal| {
            let mut rec = self
                .records
                .get_mut(escrow_id)
                .ok_or(CoreError::EscrowNotActive)?;
            if rec.status != EscrowStatus::Active {
                return Err(CoreError::EscrowNotActive);
            }
            if let Some(actual) = expect_actual {
                if actual != rec.spent {
                    return Err(CoreError::InvariantViolation(format!(
                        "escrow {escrow_id} completed with actual {actual} but {} consumed",
                        rec.spent
                    )));
                }
            }
            let refund = rec.remaining();
            Ledger::journalled_release_from_escrow(
                row,
                journal,
                refund,
                &format!("escrow {} release", rec.kind.as_str()),
                Some(escrow_id),
            )?;
            let ts = now_ms();
            rec.actual_amount = Some(rec.spent);
            rec.refund = Some(refund);
            if cancel_reason.is_some() {
                rec.status = EscrowStatus::Cancelled;
                rec.ts_cancelled = Some(ts);
                rec.cancel_reason = cancel_reason.clone();
            } else {
                rec.status = EscrowStatus::Completed;
                rec.ts_completed = Some(ts);
            }
            Ok(refund)
        })?;
        tracing::debug!(escrow_id, refund, cancelled = cancel_reason.is_some(), "escrow finalized");
        Ok(refund)
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn get(&self, escrow_id: &str) -> Option<Escrow> {
        self.records.get(escrow_id).map(|r| r.clone())
    }

    /// Unconsumed reserve of an active escrow.
    pub fn remaining(&self, escrow_id: &str) -> Result<Points, CoreError> {
        let rec = self
            .records
            .get(escrow_id)
            .ok_or(CoreError::EscrowNotActive)?;
        if rec.status != EscrowStatus::Active {
            return Err(CoreError::EscrowNotActive);
        }
        Ok(rec.remaining())
    }

    pub fn list_active(&self, uid: UserId) -> Vec<Escrow> {
        self.records
            .iter()
            .filter(|r| r.uid == uid && r.status == EscrowStatus::Active)
            .map(|r| r.clone())
            .collect()
    }

    /// Sum of unconsumed reserves over a user's active escrows. Must
    /// equal `user.escrow` at all times.
    pub fn total_active(&self, uid: UserId) -> Points {
        self.records
            .iter()
            .filter(|r| r.uid == uid && r.status == EscrowStatus::Active)
            .map(|r| r.remaining())
            .sum()
    }

    // ============================================================
    // JANITOR
    // ============================================================

    /// Cancel active escrows older than `max_age_ms` with reason
    /// `expired_cleanup`. Returns the cancelled records so the caller can
    /// cancel any linked orders.
    pub fn cleanup_expired(&self, max_age_ms: i64) -> Vec<Escrow> {
        let cutoff = now_ms() - max_age_ms;
        let stale: Vec<EscrowId> = self
            .records
            .iter()
            .filter(|r| r.status == EscrowStatus::Active && r.ts_created < cutoff)
            .map(|r| r.escrow_id.clone())
            .collect();

        let mut cancelled = Vec::new();
        for id in stale {
            match self.cancel(&id, "expired_cleanup") {
                Ok(_) => {
                    if let Some(rec) = self.get(&id) {
                        cancelled.push(rec);
                    }
                }
                // Raced with a concurrent completion; nothing to clean.
                Err(CoreError::EscrowNotActive) => {}
                Err(e) => {
                    tracing::error!(escrow_id = %id, error = %e, "escrow cleanup failed");
                }
            }
        }
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "expired escrows cancelled");
        }
        cancelled
    }

    fn uid_of_active(&self, escrow_id: &str) -> Result<UserId, CoreError> {
        let rec = self
            .records
            .get(escrow_id)
            .ok_or(CoreError::EscrowNotActive)?;
        if rec.status != EscrowStatus::Active {
            return Err(CoreError::EscrowNotActive);
        }
        Ok(rec.uid)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;

    fn setup(points: Points) -> (Arc<Ledger>, EscrowManager) {
        let ledger = Arc::new(Ledger::new(Journal::new()));
        ledger.register_user(1, "alice", "red", None, points).unwrap();
        let escrows = EscrowManager::new(ledger.clone());
        (ledger, escrows)
    }

    #[test]
    fn test_create_then_cancel_restores_points() {
        let (ledger, escrows) = setup(100);
        let id = escrows.create(1, 40, EscrowKind::Order, "ord-1").unwrap();

        let snap = ledger.snapshot(1).unwrap();
        assert_eq!((snap.points, snap.escrow), (60, 40));
        assert_eq!(escrows.total_active(1), 40);

        let refund = escrows.cancel(&id, "user_requested").unwrap();
        assert_eq!(refund, 40);

        let snap = ledger.snapshot(1).unwrap();
        assert_eq!((snap.points, snap.escrow), (100, 0));
        assert_eq!(escrows.total_active(1), 0);

        let rec = escrows.get(&id).unwrap();
        assert_eq!(rec.status, EscrowStatus::Cancelled);
        assert_eq!(rec.actual_amount, Some(0));
        assert_eq!(rec.refund, Some(40));
        assert!(ledger.conservation_audit().is_empty());
    }

    #[test]
    fn test_spend_then_complete_with_refund() {
        let (ledger, escrows) = setup(100);
        let id = escrows.create(1, 75, EscrowKind::Order, "ord-2").unwrap();

        escrows.spend(&id, 63, EntryKind::TradeBuy, "fill").unwrap();
        assert_eq!(escrows.remaining(&id).unwrap(), 12);
        assert_eq!(escrows.total_active(1), 12);
        assert_eq!(ledger.snapshot(1).unwrap().escrow, 12);

        let refund = escrows.complete(&id, 63).unwrap();
        assert_eq!(refund, 12);

        let snap = ledger.snapshot(1).unwrap();
        assert_eq!((snap.points, snap.escrow), (37, 0)); // pre - 63

        let rec = escrows.get(&id).unwrap();
        assert_eq!(rec.status, EscrowStatus::Completed);
        assert_eq!(rec.actual_amount, Some(63));
        assert_eq!(rec.refund, Some(12));
        assert_eq!(rec.actual_amount.unwrap() + rec.refund.unwrap(), 75);
        assert!(ledger.conservation_audit().is_empty());
    }

    #[test]
    fn test_insufficient_points() {
        let (_ledger, escrows) = setup(30);
        let err = escrows
            .create(1, 40, EscrowKind::Order, "ord-3")
            .unwrap_err();
        assert_eq!(err, CoreError::InsufficientPoints);
        assert!(escrows.list_active(1).is_empty());
    }

    #[test]
    fn test_no_double_finalize() {
        let (_ledger, escrows) = setup(100);
        let id = escrows.create(1, 40, EscrowKind::Transfer, "tx-1").unwrap();
        escrows.complete(&id, 0).unwrap();
        assert_eq!(
            escrows.complete(&id, 0).unwrap_err(),
            CoreError::EscrowNotActive
        );
        assert_eq!(
            escrows.cancel(&id, "late").unwrap_err(),
            CoreError::EscrowNotActive
        );
    }

    #[test]
    fn test_complete_with_wrong_actual_rejected() {
        let (_ledger, escrows) = setup(100);
        let id = escrows.create(1, 40, EscrowKind::Order, "ord-4").unwrap();
        escrows.spend(&id, 10, EntryKind::TradeBuy, "fill").unwrap();
        let err = escrows.complete(&id, 25).unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
        // Still active and intact
        assert_eq!(escrows.remaining(&id).unwrap(), 30);
    }

    #[test]
    fn test_cleanup_expired_only_old_ones() {
        let (ledger, escrows) = setup(100);
        let old = escrows.create(1, 10, EscrowKind::Pvp, "pvp-1").unwrap();
        // Backdate the record
        escrows.records.get_mut(&old).unwrap().ts_created -= 10_000;
        let fresh = escrows.create(1, 10, EscrowKind::Pvp, "pvp-2").unwrap();

        let cancelled = escrows.cleanup_expired(5_000);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].escrow_id, old);
        assert_eq!(cancelled[0].cancel_reason.as_deref(), Some("expired_cleanup"));
        assert_eq!(escrows.remaining(&fresh).unwrap(), 10);
        assert_eq!(ledger.snapshot(1).unwrap().escrow, 10);
    }
}
