//! Integrity auditor - periodic and on-demand consistency scans
//!
//! Checks, per user: `points >= 0`, `escrow >= 0`, and that the sum of
//! active escrow reserves equals the escrow balance. Also replays the
//! journal (conservation audit). Findings are emitted as events; the
//! repair path zeroes negative balances with a compensating `admin_grant`
//! and escalates the deficit into owed points.

use crate::core_types::UserId;
use crate::escrow::EscrowManager;
use crate::events::{EventBus, Topic};
use crate::ledger::Ledger;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub negative_points: Vec<UserId>,
    pub negative_escrow: Vec<UserId>,
    pub escrow_mismatch: Vec<UserId>,
    pub ledger_discrepant: Vec<UserId>,
    pub repaired: Vec<UserId>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.negative_points.is_empty()
            && self.negative_escrow.is_empty()
            && self.escrow_mismatch.is_empty()
            && self.ledger_discrepant.is_empty()
    }
}

pub struct IntegrityAuditor {
    ledger: Arc<Ledger>,
    escrows: Arc<EscrowManager>,
    bus: Arc<EventBus>,
}

impl IntegrityAuditor {
    pub fn new(ledger: Arc<Ledger>, escrows: Arc<EscrowManager>, bus: Arc<EventBus>) -> Self {
        Self {
            ledger,
            escrows,
            bus,
        }
    }

    /// Full scan. With `fix`, negative balances are zeroed and converted
    /// into owed points.
    pub fn run(&self, fix: bool) -> AuditReport {
        let mut report = AuditReport::default();

        for snap in self.ledger.snapshots() {
            if snap.points < 0 {
                report.negative_points.push(snap.uid);
            }
            if snap.escrow < 0 {
                report.negative_escrow.push(snap.uid);
            }
            if self.escrow_sum_mismatch(snap.uid) {
                report.escrow_mismatch.push(snap.uid);
            }
        }
        report.ledger_discrepant = self.ledger.conservation_audit();

        if fix {
            let broken: Vec<UserId> = report
                .negative_points
                .iter()
                .chain(report.negative_escrow.iter())
                .copied()
                .collect();
            for uid in broken {
                match self.ledger.repair_negative(uid) {
                    Ok(Some(_)) => report.repaired.push(uid),
                    Ok(None) => {}
                    Err(e) => tracing::error!(uid, error = %e, "balance repair failed"),
                }
            }
            report.repaired.dedup();
        }

        if !report.is_clean() {
            tracing::warn!(?report, "integrity audit found problems");
            self.bus.publish(
                Topic::SystemMaintenance,
                None,
                json!({
                    "audit": {
                        "negative_points": report.negative_points,
                        "negative_escrow": report.negative_escrow,
                        "escrow_mismatch": report.escrow_mismatch,
                        "ledger_discrepant": report.ledger_discrepant,
                        "repaired": report.repaired,
                    }
                }),
            );
        }
        report
    }

    /// A user's live escrow balance vs the sum over their active escrow
    /// records. Checked twice: a single mismatch may just be an operation
    /// in flight on another shard.
    fn escrow_sum_mismatch(&self, uid: UserId) -> bool {
        for _ in 0..2 {
            let escrow = match self.ledger.snapshot(uid) {
                Ok(s) => s.escrow,
                Err(_) => return false,
            };
            if self.escrows.total_active(uid) == escrow {
                return false;
            }
        }
        true
    }
}
