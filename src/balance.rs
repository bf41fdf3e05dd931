/// ENFORCED BALANCE TYPE - Used by the Ledger
///
/// This is the SINGLE source of truth for balance mutations.
/// ALL balance changes MUST go through these methods.
///
/// # Enforcement Strategy:
/// 1. Fields are PRIVATE - no direct access
/// 2. All mutations return Result - errors are explicit
/// 3. checked arithmetic - overflow protection
/// 4. Type system prevents bypassing validation
use crate::core_types::Points;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    #[error("insufficient balance")]
    Insufficient,
    #[error("balance arithmetic overflow")]
    Overflow,
}

/// Deltas applied by a negative-balance repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairDelta {
    pub points_restored: Points,
    pub escrow_restored: Points,
}

/// Point balance of a single user.
///
/// # Invariants (ENFORCED by private fields):
/// - `points >= 0`, `escrow >= 0`, `owed >= 0`
/// - The only way down for `points` is `debit_checked` / `move_to_escrow`,
///   both of which check-and-decrement in one step
/// - `escrow` is only consumed by `spend_from_escrow` and only returned by
///   `release_from_escrow`
///
/// A user with `owed > 0` is implicitly frozen from spending until the
/// debt is repaid; repayment happens inside [`Balance::credit`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    points: Points, // PRIVATE - available points
    escrow: Points, // PRIVATE - reserved for pending obligations
    owed: Points,   // PRIVATE - outstanding debt
}

impl Balance {
    pub fn with_points(points: Points) -> Self {
        Self {
            points,
            escrow: 0,
            owed: 0,
        }
    }

    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    #[inline(always)]
    pub const fn points(&self) -> Points {
        self.points
    }

    #[inline(always)]
    pub const fn escrow(&self) -> Points {
        self.escrow
    }

    #[inline(always)]
    pub const fn owed(&self) -> Points {
        self.owed
    }

    /// Total points under this user's control (available + reserved).
    #[inline(always)]
    pub const fn total(&self) -> Points {
        self.points + self.escrow
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    /// Credit points, repaying outstanding debt first.
    ///
    /// Returns `(repaid, credited)`: `repaid` went to debt, `credited`
    /// landed on `points`. `repaid + credited = amount`.
    pub fn credit(&mut self, amount: Points) -> Result<(Points, Points), BalanceError> {
        let repaid = self.owed.min(amount);
        let credited = amount - repaid;
        self.owed -= repaid;
        self.points = self
            .points
            .checked_add(credited)
            .ok_or(BalanceError::Overflow)?;
        Ok((repaid, credited))
    }

    /// Atomic check-and-decrement of `points`.
    ///
    /// This is the sole legal path for reducing `points` directly; the
    /// check and the subtraction are one step, so `points >= 0` is a
    /// structural invariant, not a convention.
    pub fn debit_checked(&mut self, amount: Points) -> Result<(), BalanceError> {
        if self.points < amount {
            return Err(BalanceError::Insufficient);
        }
        self.points -= amount;
        Ok(())
    }

    /// Atomic `points -= amount; escrow += amount` subject to sufficiency.
    pub fn move_to_escrow(&mut self, amount: Points) -> Result<(), BalanceError> {
        if self.points < amount {
            return Err(BalanceError::Insufficient);
        }
        self.points -= amount;
        self.escrow = self
            .escrow
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        Ok(())
    }

    /// Consume reserved points (trade settlement, fees taken from escrow).
    pub fn spend_from_escrow(&mut self, amount: Points) -> Result<(), BalanceError> {
        if self.escrow < amount {
            return Err(BalanceError::Insufficient);
        }
        self.escrow -= amount;
        Ok(())
    }

    /// Return reserved points to the available balance.
    pub fn release_from_escrow(&mut self, amount: Points) -> Result<(), BalanceError> {
        if self.escrow < amount {
            return Err(BalanceError::Insufficient);
        }
        self.escrow -= amount;
        self.points = self
            .points
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        Ok(())
    }

    /// Record debt against the user.
    pub fn add_debt(&mut self, amount: Points) -> Result<(), BalanceError> {
        self.owed = self.owed.checked_add(amount).ok_or(BalanceError::Overflow)?;
        Ok(())
    }

    /// Zero out negative components, converting the deficit into debt.
    ///
    /// Negative balances are structurally impossible through the methods
    /// above; this exists for the integrity auditor's repair path.
    pub fn repair_negative(&mut self) -> Option<RepairDelta> {
        if self.points >= 0 && self.escrow >= 0 {
            return None;
        }
        let points_restored = (-self.points).max(0);
        let escrow_restored = (-self.escrow).max(0);
        self.points += points_restored;
        self.escrow += escrow_restored;
        self.owed += points_restored + escrow_restored;
        Some(RepairDelta {
            points_restored,
            escrow_restored,
        })
    }
}

// ============================================================
// TESTS - Prove enforcement works
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit() {
        let mut bal = Balance::default();
        assert_eq!(bal.credit(100), Ok((0, 100)));
        assert_eq!(bal.points(), 100);
        assert_eq!(bal.total(), 100);
    }

    #[test]
    fn test_debit_checked() {
        let mut bal = Balance::with_points(100);
        bal.debit_checked(60).unwrap();
        assert_eq!(bal.points(), 40);

        assert_eq!(bal.debit_checked(50), Err(BalanceError::Insufficient));
        assert_eq!(bal.points(), 40); // Unchanged
    }

    #[test]
    fn test_escrow_roundtrip() {
        let mut bal = Balance::with_points(100);
        bal.move_to_escrow(75).unwrap();
        assert_eq!(bal.points(), 25);
        assert_eq!(bal.escrow(), 75);

        bal.spend_from_escrow(63).unwrap();
        assert_eq!(bal.escrow(), 12);

        bal.release_from_escrow(12).unwrap();
        assert_eq!(bal.points(), 37);
        assert_eq!(bal.escrow(), 0);
        assert_eq!(bal.total(), 37); // pre - 63
    }

    #[test]
    fn test_escrow_insufficient() {
        let mut bal = Balance::with_points(50);
        assert_eq!(bal.move_to_escrow(60), Err(BalanceError::Insufficient));
        assert_eq!(bal.spend_from_escrow(1), Err(BalanceError::Insufficient));
        assert_eq!(bal.points(), 50);
        assert_eq!(bal.escrow(), 0);
    }

    #[test]
    fn test_credit_repays_debt_first() {
        let mut bal = Balance::default();
        bal.add_debt(30).unwrap();

        let (repaid, credited) = bal.credit(100).unwrap();
        assert_eq!(repaid, 30);
        assert_eq!(credited, 70);
        assert_eq!(bal.owed(), 0);
        assert_eq!(bal.points(), 70);
    }

    #[test]
    fn test_partial_debt_repayment() {
        let mut bal = Balance::default();
        bal.add_debt(100).unwrap();

        let (repaid, credited) = bal.credit(40).unwrap();
        assert_eq!(repaid, 40);
        assert_eq!(credited, 0);
        assert_eq!(bal.owed(), 60);
        assert_eq!(bal.points(), 0);
    }

    #[test]
    fn test_credit_overflow() {
        let mut bal = Balance::with_points(Points::MAX);
        assert_eq!(bal.credit(1), Err(BalanceError::Overflow));
    }

    #[test]
    fn test_repair_negative_noop_on_healthy() {
        let mut bal = Balance::with_points(10);
        assert_eq!(bal.repair_negative(), None);
    }
}
