//! Ledger - the balance core service
//!
//! ALL point mutations go through this service. Each user row lives in a
//! `DashMap`; every mutation happens inside one entry lock, which realises
//! the compare-and-decrement primitive the accounting model requires: the
//! sufficiency check and the subtraction are a single atomic step, so
//! `points >= 0` holds structurally.
//!
//! # Lock ordering
//!
//! user row -> escrow/holding record -> journal. Nothing acquires a user
//! row while holding any other lock, and the journal mutex is always
//! innermost. Two user rows are never held at once.

use crate::balance::{Balance, BalanceError};
use crate::core_types::{Points, UserId, now_ms};
use crate::errors::CoreError;
use crate::journal::{EntryKind, Journal, JournalEntry};
use dashmap::DashMap;
use serde::Serialize;

// ============================================================
// USER ROW
// ============================================================

/// One user's mutable row. Identity fields are immutable after
/// registration; the balance only changes through [`Balance`]'s checked
/// mutations.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub uid: UserId,
    pub username: String,
    pub team: String,
    pub telegram_id: Option<i64>,
    pub enabled: bool,
    pub frozen: bool,
    pub balance: Balance,
}

impl UserRow {
    /// Spending requires: enabled, not frozen, no outstanding debt.
    pub fn can_spend(&self) -> Result<(), CoreError> {
        if !self.enabled {
            return Err(CoreError::Disabled);
        }
        if self.frozen {
            return Err(CoreError::Frozen);
        }
        if self.balance.owed() > 0 {
            return Err(CoreError::HasDebt);
        }
        Ok(())
    }
}

/// Read-only view of a user row.
#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub uid: UserId,
    pub username: String,
    pub team: String,
    pub telegram_id: Option<i64>,
    pub enabled: bool,
    pub frozen: bool,
    pub points: Points,
    pub escrow: Points,
    pub owed: Points,
}

impl From<&UserRow> for UserSnapshot {
    fn from(row: &UserRow) -> Self {
        Self {
            uid: row.uid,
            username: row.username.clone(),
            team: row.team.clone(),
            telegram_id: row.telegram_id,
            enabled: row.enabled,
            frozen: row.frozen,
            points: row.balance.points(),
            escrow: row.balance.escrow(),
            owed: row.balance.owed(),
        }
    }
}

// ============================================================
// LEDGER SERVICE
// ============================================================

pub struct Ledger {
    users: DashMap<UserId, UserRow>,
    by_username: DashMap<String, UserId>,
    journal: Journal,
}

impl Ledger {
    pub fn new(journal: Journal) -> Self {
        Self {
            users: DashMap::new(),
            by_username: DashMap::new(),
            journal,
        }
    }

    // ============================================================
    // REGISTRATION & QUERIES
    // ============================================================

    /// Register a user with an initial point grant.
    pub fn register_user(
        &self,
        uid: UserId,
        username: &str,
        team: &str,
        telegram_id: Option<i64>,
        initial_points: Points,
    ) -> Result<(), CoreError> {
        if initial_points < 0 {
            return Err(CoreError::InvalidArgs("negative initial grant".into()));
        }
        match self.by_username.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoreError::InvalidArgs(format!(
                    "username already taken: {username}"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(uid);
            }
        }
        match self.users.entry(uid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.by_username.remove(username);
                return Err(CoreError::InvalidArgs(format!("uid already exists: {uid}")));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(UserRow {
                    uid,
                    username: username.to_string(),
                    team: team.to_string(),
                    telegram_id,
                    enabled: true,
                    frozen: false,
                    balance: Balance::with_points(initial_points),
                });
            }
        }
        if initial_points > 0 {
            self.journal.append(JournalEntry {
                uid,
                delta: initial_points,
                kind: EntryKind::IpoGrant,
                note: "initial grant".to_string(),
                balance_after: initial_points,
                ts: now_ms(),
                tx_id: None,
                fee_from_escrow: false,
            });
        }
        tracing::info!(uid, username, team, initial_points, "user registered");
        Ok(())
    }

    pub fn snapshot(&self, uid: UserId) -> Result<UserSnapshot, CoreError> {
        self.users
            .get(&uid)
            .map(|r| UserSnapshot::from(&*r))
            .ok_or(CoreError::UnknownUser)
    }

    pub fn snapshots(&self) -> Vec<UserSnapshot> {
        self.users.iter().map(|r| UserSnapshot::from(&*r)).collect()
    }

    pub fn resolve_username(&self, username: &str) -> Option<UserId> {
        self.by_username.get(username).map(|v| *v)
    }

    pub fn users_in_team(&self, team: &str) -> Vec<UserId> {
        self.users
            .iter()
            .filter(|r| r.team == team)
            .map(|r| r.uid)
            .collect()
    }

    pub fn telegram_id_of(&self, uid: UserId) -> Option<i64> {
        self.users.get(&uid).and_then(|r| r.telegram_id)
    }

    /// Validate that a user may spend (exists, enabled, not frozen, no
    /// debt). Pure read; no side effects.
    pub fn check_actor(&self, uid: UserId) -> Result<(), CoreError> {
        let row = self.users.get(&uid).ok_or(CoreError::UnknownUser)?;
        row.can_spend()
    }

    pub fn set_enabled(&self, uid: UserId, enabled: bool) -> Result<(), CoreError> {
        let mut row = self.users.get_mut(&uid).ok_or(CoreError::UnknownUser)?;
        row.enabled = enabled;
        Ok(())
    }

    pub fn set_frozen(&self, uid: UserId, frozen: bool) -> Result<(), CoreError> {
        let mut row = self.users.get_mut(&uid).ok_or(CoreError::UnknownUser)?;
        row.frozen = frozen;
        Ok(())
    }

    // ============================================================
    // BALANCE MUTATIONS
    // ============================================================

    /// Run `f` under the user's row lock.
    ///
    /// This is the transaction boundary for anything that must mutate the
    /// balance and a dependent record (escrow row) as one unit. `f` must
    /// not touch another user row.
    pub(crate) fn with_row<R>(
        &self,
        uid: UserId,
        f: impl FnOnce(&mut UserRow, &Journal) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        let mut row = self.users.get_mut(&uid).ok_or(CoreError::UnknownUser)?;
        f(&mut row, &self.journal)
    }

    /// Credit points. Outstanding debt is repaid first; the repaid slice
    /// is journalled as `debt_repayment`.
    pub fn credit(
        &self,
        uid: UserId,
        amount: Points,
        kind: EntryKind,
        note: &str,
    ) -> Result<Points, CoreError> {
        Self::require_positive(amount)?;
        self.with_row(uid, |row, journal| {
            let (repaid, _credited) = row
                .balance
                .credit(amount)
                .map_err(|e| Self::balance_error(uid, e))?;
            let after = row.balance.points();
            let ts = now_ms();
            journal.append(JournalEntry {
                uid,
                delta: amount,
                kind,
                note: note.to_string(),
                balance_after: after,
                ts,
                tx_id: None,
                fee_from_escrow: false,
            });
            if repaid > 0 {
                journal.append(JournalEntry {
                    uid,
                    delta: -repaid,
                    kind: EntryKind::DebtRepayment,
                    note: format!("debt repaid from {}", kind.as_str()),
                    balance_after: after,
                    ts,
                    tx_id: None,
                    fee_from_escrow: false,
                });
                if row.balance.owed() == 0 {
                    tracing::info!(uid, repaid, "debt fully repaid");
                }
            }
            Ok(after)
        })
    }

    /// Atomic check-and-decrement of available points. The sole legal
    /// path for reducing `points` outside the escrow flow.
    pub fn debit_checked(
        &self,
        uid: UserId,
        amount: Points,
        kind: EntryKind,
        note: &str,
    ) -> Result<Points, CoreError> {
        Self::require_positive(amount)?;
        self.with_row(uid, |row, journal| {
            row.balance
                .debit_checked(amount)
                .map_err(|e| Self::balance_error(uid, e))?;
            let after = row.balance.points();
            journal.append(JournalEntry {
                uid,
                delta: -amount,
                kind,
                note: note.to_string(),
                balance_after: after,
                ts: now_ms(),
                tx_id: None,
                fee_from_escrow: false,
            });
            Ok(after)
        })
    }

    /// Debit a total made of several parts (e.g. transfer amount + fee) as
    /// one atomic check-and-decrement, journalling one entry per part.
    pub fn debit_split(
        &self,
        uid: UserId,
        parts: &[(Points, EntryKind, String)],
        tx_id: Option<&str>,
    ) -> Result<Points, CoreError> {
        let total: Points = parts.iter().map(|(a, _, _)| *a).sum();
        Self::require_positive(total)?;
        self.with_row(uid, |row, journal| {
            row.balance
                .debit_checked(total)
                .map_err(|e| Self::balance_error(uid, e))?;
            let mut running = row.balance.points() + total;
            let ts = now_ms();
            for (amount, kind, note) in parts {
                running -= amount;
                journal.append(JournalEntry {
                    uid,
                    delta: -amount,
                    kind: *kind,
                    note: note.clone(),
                    balance_after: running,
                    ts,
                    tx_id: tx_id.map(|s| s.to_string()),
                    fee_from_escrow: false,
                });
            }
            Ok(row.balance.points())
        })
    }

    /// Atomic `points -= amount; escrow += amount`.
    pub fn move_to_escrow(
        &self,
        uid: UserId,
        amount: Points,
        note: &str,
        tx_id: Option<&str>,
    ) -> Result<(), CoreError> {
        Self::require_positive(amount)?;
        self.with_row(uid, |row, journal| {
            Self::journalled_move_to_escrow(row, journal, amount, note, tx_id)
        })
    }

    /// Row-lock-scoped variant for callers composing a larger transaction
    /// (the escrow manager inserts its record under the same lock).
    pub(crate) fn journalled_move_to_escrow(
        row: &mut UserRow,
        journal: &Journal,
        amount: Points,
        note: &str,
        tx_id: Option<&str>,
    ) -> Result<(), CoreError> {
        row.balance
            .move_to_escrow(amount)
            .map_err(|e| Self::balance_error(row.uid, e))?;
        journal.append(JournalEntry {
            uid: row.uid,
            delta: -amount,
            kind: EntryKind::EscrowReserve,
            note: note.to_string(),
            balance_after: row.balance.points(),
            ts: now_ms(),
            tx_id: tx_id.map(|s| s.to_string()),
            fee_from_escrow: false,
        });
        Ok(())
    }

    /// Consume reserved points (a trade debit or an escrowed fee).
    pub(crate) fn journalled_spend_from_escrow(
        row: &mut UserRow,
        journal: &Journal,
        amount: Points,
        kind: EntryKind,
        note: &str,
        tx_id: Option<&str>,
    ) -> Result<(), CoreError> {
        row.balance
            .spend_from_escrow(amount)
            .map_err(|e| Self::balance_error(row.uid, e))?;
        journal.append(JournalEntry {
            uid: row.uid,
            delta: -amount,
            kind,
            note: note.to_string(),
            balance_after: row.balance.points(),
            ts: now_ms(),
            tx_id: tx_id.map(|s| s.to_string()),
            fee_from_escrow: kind == EntryKind::Fee,
        });
        Ok(())
    }

    /// Return reserved points to the available balance.
    pub(crate) fn journalled_release_from_escrow(
        row: &mut UserRow,
        journal: &Journal,
        amount: Points,
        note: &str,
        tx_id: Option<&str>,
    ) -> Result<(), CoreError> {
        if amount == 0 {
            return Ok(());
        }
        row.balance
            .release_from_escrow(amount)
            .map_err(|e| Self::balance_error(row.uid, e))?;
        journal.append(JournalEntry {
            uid: row.uid,
            delta: amount,
            kind: EntryKind::EscrowRelease,
            note: note.to_string(),
            balance_after: row.balance.points(),
            ts: now_ms(),
            tx_id: tx_id.map(|s| s.to_string()),
            fee_from_escrow: false,
        });
        Ok(())
    }

    /// Record debt against a user (auditor escalation path).
    pub fn add_debt(&self, uid: UserId, amount: Points) -> Result<(), CoreError> {
        Self::require_positive(amount)?;
        self.with_row(uid, |row, _| {
            row.balance
                .add_debt(amount)
                .map_err(|e| Self::balance_error(uid, e))
        })
    }

    /// Zero out negative balance components, converting the deficit into
    /// debt, and journal a compensating `admin_grant`.
    pub fn repair_negative(&self, uid: UserId) -> Result<Option<Points>, CoreError> {
        self.with_row(uid, |row, journal| {
            let Some(delta) = row.balance.repair_negative() else {
                return Ok(None);
            };
            let restored = delta.points_restored + delta.escrow_restored;
            journal.append(JournalEntry {
                uid,
                delta: restored,
                kind: EntryKind::AdminGrant,
                note: "negative balance repair".to_string(),
                balance_after: row.balance.points(),
                ts: now_ms(),
                tx_id: None,
                fee_from_escrow: false,
            });
            tracing::warn!(uid, restored, "negative balance repaired");
            Ok(Some(restored))
        })
    }

    // ============================================================
    // AUDIT
    // ============================================================

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn entries_for(&self, uid: UserId, limit: usize) -> Vec<JournalEntry> {
        self.journal.entries_for(uid, limit)
    }

    /// Replay the journal and compare against live balances.
    ///
    /// Returns the uids whose current `(points, escrow)` disagree with
    /// what the journal implies.
    pub fn conservation_audit(&self) -> Vec<UserId> {
        let replayed = self.journal.replay();
        let mut discrepant = Vec::new();
        for row in self.users.iter() {
            let expect = replayed.get(&row.uid).copied().unwrap_or((0, 0));
            let actual = (row.balance.points(), row.balance.escrow());
            if expect != actual {
                tracing::error!(
                    uid = row.uid,
                    ?expect,
                    ?actual,
                    "conservation audit mismatch"
                );
                discrepant.push(row.uid);
            }
        }
        discrepant.sort_unstable();
        discrepant
    }

    // ============================================================
    // HELPERS
    // ============================================================

    fn require_positive(amount: Points) -> Result<(), CoreError> {
        if amount <= 0 {
            return Err(CoreError::InvalidArgs(format!(
                "amount must be positive, got {amount}"
            )));
        }
        Ok(())
    }

    fn balance_error(uid: UserId, e: BalanceError) -> CoreError {
        match e {
            BalanceError::Insufficient => CoreError::InsufficientPoints,
            BalanceError::Overflow => {
                CoreError::InvariantViolation(format!("balance overflow for uid {uid}"))
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_user(uid: UserId, points: Points) -> Ledger {
        let ledger = Ledger::new(Journal::new());
        ledger
            .register_user(uid, &format!("user{uid}"), "red", None, points)
            .unwrap();
        ledger
    }

    #[test]
    fn test_register_and_snapshot() {
        let ledger = ledger_with_user(1, 100);
        let snap = ledger.snapshot(1).unwrap();
        assert_eq!(snap.points, 100);
        assert_eq!(snap.escrow, 0);
        assert!(snap.enabled);
        assert_eq!(ledger.resolve_username("user1"), Some(1));
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let ledger = ledger_with_user(1, 100);
        let err = ledger
            .register_user(2, "user1", "blue", None, 50)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGS");
        assert_eq!(ledger.snapshot(2).unwrap_err(), CoreError::UnknownUser);
    }

    #[test]
    fn test_debit_checked_is_sole_down_path() {
        let ledger = ledger_with_user(1, 100);
        assert_eq!(
            ledger
                .debit_checked(1, 60, EntryKind::TransferOut, "t")
                .unwrap(),
            40
        );
        assert_eq!(
            ledger.debit_checked(1, 50, EntryKind::TransferOut, "t"),
            Err(CoreError::InsufficientPoints)
        );
        // Failed debit leaves no journal entry
        assert_eq!(ledger.entries_for(1, 10).len(), 2); // grant + one debit
    }

    #[test]
    fn test_debit_split_atomicity() {
        let ledger = ledger_with_user(1, 100);
        // 90 + 20 = 110 > 100: whole split fails, nothing recorded
        let err = ledger
            .debit_split(
                1,
                &[
                    (90, EntryKind::TransferOut, "x".into()),
                    (20, EntryKind::Fee, "fee".into()),
                ],
                None,
            )
            .unwrap_err();
        assert_eq!(err, CoreError::InsufficientPoints);
        assert_eq!(ledger.snapshot(1).unwrap().points, 100);

        // 50 + 5 succeeds with two entries
        let after = ledger
            .debit_split(
                1,
                &[
                    (50, EntryKind::TransferOut, "x".into()),
                    (5, EntryKind::Fee, "fee".into()),
                ],
                Some("tx1"),
            )
            .unwrap();
        assert_eq!(after, 45);
        let entries = ledger.entries_for(1, 2);
        assert_eq!(entries[0].kind, EntryKind::Fee);
        assert_eq!(entries[0].balance_after, 45);
        assert_eq!(entries[1].kind, EntryKind::TransferOut);
        assert_eq!(entries[1].balance_after, 50);
    }

    #[test]
    fn test_escrow_flow_and_conservation() {
        let ledger = ledger_with_user(1, 100);
        ledger.move_to_escrow(1, 75, "order", None).unwrap();
        let snap = ledger.snapshot(1).unwrap();
        assert_eq!((snap.points, snap.escrow), (25, 75));

        ledger
            .with_row(1, |row, journal| {
                Ledger::journalled_spend_from_escrow(
                    row,
                    journal,
                    63,
                    EntryKind::TradeBuy,
                    "fill",
                    None,
                )?;
                Ledger::journalled_release_from_escrow(row, journal, 12, "refund", None)
            })
            .unwrap();

        let snap = ledger.snapshot(1).unwrap();
        assert_eq!((snap.points, snap.escrow), (37, 0));
        assert!(ledger.conservation_audit().is_empty());
    }

    #[test]
    fn test_credit_repays_debt_and_journals_it() {
        let ledger = ledger_with_user(1, 0);
        ledger.add_debt(1, 30).unwrap();
        assert_eq!(ledger.check_actor(1), Err(CoreError::HasDebt));

        ledger
            .credit(1, 100, EntryKind::TransferIn, "gift")
            .unwrap();
        let snap = ledger.snapshot(1).unwrap();
        assert_eq!(snap.points, 70);
        assert_eq!(snap.owed, 0);
        assert!(ledger.check_actor(1).is_ok());

        let entries = ledger.entries_for(1, 2);
        assert_eq!(entries[0].kind, EntryKind::DebtRepayment);
        assert_eq!(entries[0].delta, -30);
        assert_eq!(entries[1].kind, EntryKind::TransferIn);
        assert_eq!(entries[1].delta, 100);
        assert!(ledger.conservation_audit().is_empty());
    }

    #[test]
    fn test_actor_checks() {
        let ledger = ledger_with_user(1, 10);
        ledger.set_enabled(1, false).unwrap();
        assert_eq!(ledger.check_actor(1), Err(CoreError::Disabled));
        ledger.set_enabled(1, true).unwrap();
        ledger.set_frozen(1, true).unwrap();
        assert_eq!(ledger.check_actor(1), Err(CoreError::Frozen));
        ledger.set_frozen(1, false).unwrap();
        assert!(ledger.check_actor(1).is_ok());
        assert_eq!(ledger.check_actor(99), Err(CoreError::UnknownUser));
    }

    #[test]
    fn test_team_lookup() {
        let ledger = Ledger::new(Journal::new());
        ledger.register_user(1, "a", "red", None, 0).unwrap();
        ledger.register_user(2, "b", "red", None, 0).unwrap();
        ledger.register_user(3, "c", "blue", None, 0).unwrap();
        let mut reds = ledger.users_in_team("red");
        reds.sort_unstable();
        assert_eq!(reds, vec![1, 2]);
    }
}
