//! Journal - append-only audit log for all balance changes
//!
//! Every point movement is recorded as one immutable entry. Replaying the
//! journal from an empty state reproduces every user's current
//! `(points, escrow)` - this is the basis of the conservation audit.
//!
//! # Replay semantics per kind
//! - `escrow_reserve`: points -= amount, escrow += amount
//! - `trade_buy` / fees taken from escrow: escrow -= amount
//! - `escrow_release`: escrow -= amount, points += amount
//! - everything else (including `debt_repayment`, whose negative delta is
//!   the slice of an incoming credit that went to debt): points += delta

use crate::core_types::{Points, TsMillis, UserId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Mutex;

// ============================================================
// ENTRY KINDS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    IpoGrant,
    TradeBuy,
    TradeSell,
    TransferIn,
    TransferOut,
    Fee,
    EscrowReserve,
    EscrowRelease,
    AdminGrant,
    PvpWin,
    PvpLoss,
    ArcadeAdjust,
    Settlement,
    DebtRepayment,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::IpoGrant => "ipo_grant",
            EntryKind::TradeBuy => "trade_buy",
            EntryKind::TradeSell => "trade_sell",
            EntryKind::TransferIn => "transfer_in",
            EntryKind::TransferOut => "transfer_out",
            EntryKind::Fee => "fee",
            EntryKind::EscrowReserve => "escrow_reserve",
            EntryKind::EscrowRelease => "escrow_release",
            EntryKind::AdminGrant => "admin_grant",
            EntryKind::PvpWin => "pvp_win",
            EntryKind::PvpLoss => "pvp_loss",
            EntryKind::ArcadeAdjust => "arcade_adjust",
            EntryKind::Settlement => "settlement",
            EntryKind::DebtRepayment => "debt_repayment",
        }
    }
}

// ============================================================
// JOURNAL ENTRY
// ============================================================

/// One immutable journal line.
///
/// `balance_after` captures `points` immediately after the change the
/// entry describes; `fee_from_escrow` marks Fee entries whose amount was
/// consumed from escrow rather than from available points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub uid: UserId,
    pub delta: Points,
    pub kind: EntryKind,
    pub note: String,
    pub balance_after: Points,
    pub ts: TsMillis,
    pub tx_id: Option<String>,
    pub fee_from_escrow: bool,
}

impl JournalEntry {
    pub fn csv_header() -> &'static str {
        "ts,uid,kind,delta,balance_after,tx_id,note"
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.ts,
            self.uid,
            self.kind.as_str(),
            self.delta,
            self.balance_after,
            self.tx_id.as_deref().unwrap_or(""),
            self.note.replace(',', ";")
        )
    }
}

// ============================================================
// JOURNAL
// ============================================================

/// Append-only journal with an optional CSV mirror.
///
/// The in-memory log is the source of truth for history queries and the
/// conservation audit; the CSV file is an operator-facing audit trail.
pub struct Journal {
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    entries: Vec<JournalEntry>,
    csv: Option<CsvWriter>,
}

struct CsvWriter {
    writer: BufWriter<File>,
    count: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                entries: Vec::new(),
                csv: None,
            }),
        }
    }

    /// Mirror every entry to a CSV file at `path`.
    pub fn with_csv(path: &str) -> io::Result<Self> {
        let file = File::create(path)?;
        // 1MB buffer to reduce syscalls under sustained trading
        let mut writer = BufWriter::with_capacity(1024 * 1024, file);
        writeln!(writer, "{}", JournalEntry::csv_header())?;

        Ok(Self {
            inner: Mutex::new(JournalInner {
                entries: Vec::new(),
                csv: Some(CsvWriter { writer, count: 0 }),
            }),
        })
    }

    pub fn append(&self, entry: JournalEntry) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(csv) = inner.csv.as_mut() {
            if let Err(e) = writeln!(csv.writer, "{}", entry.to_csv()) {
                tracing::error!("journal csv write failed: {e}");
            } else {
                csv.count += 1;
            }
        }
        inner.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest entries for a user, newest first.
    pub fn entries_for(&self, uid: UserId, limit: usize) -> Vec<JournalEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.uid == uid)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Replay all entries from an empty state.
    ///
    /// Returns `(points, escrow)` per user as implied by the journal.
    pub fn replay(&self) -> FxHashMap<UserId, (Points, Points)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut state: FxHashMap<UserId, (Points, Points)> = FxHashMap::default();
        for e in inner.entries.iter() {
            let (points, escrow) = state.entry(e.uid).or_default();
            match e.kind {
                EntryKind::EscrowReserve => {
                    *points += e.delta; // delta is negative
                    *escrow -= e.delta;
                }
                EntryKind::TradeBuy => {
                    *escrow += e.delta; // delta is negative
                }
                EntryKind::Fee if e.fee_from_escrow => {
                    *escrow += e.delta;
                }
                EntryKind::EscrowRelease => {
                    *escrow -= e.delta; // delta is positive
                    *points += e.delta;
                }
                _ => {
                    *points += e.delta;
                }
            }
        }
        state
    }

    /// Flush the CSV mirror to disk.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(csv) = inner.csv.as_mut() {
            if let Err(e) = csv.writer.flush() {
                tracing::error!("journal csv flush failed: {e}");
            }
        }
    }

    pub fn csv_count(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .csv
            .as_ref()
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.flush();
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uid: UserId, delta: Points, kind: EntryKind, balance_after: Points) -> JournalEntry {
        JournalEntry {
            uid,
            delta,
            kind,
            note: String::new(),
            balance_after,
            ts: 0,
            tx_id: None,
            fee_from_escrow: false,
        }
    }

    #[test]
    fn test_replay_escrow_cycle() {
        let journal = Journal::new();
        // Grant 100, reserve 75, spend 63 from escrow, release 12.
        journal.append(entry(1, 100, EntryKind::AdminGrant, 100));
        journal.append(entry(1, -75, EntryKind::EscrowReserve, 25));
        journal.append(entry(1, -63, EntryKind::TradeBuy, 25));
        journal.append(entry(1, 12, EntryKind::EscrowRelease, 37));

        let state = journal.replay();
        assert_eq!(state.get(&1), Some(&(37, 0)));
    }

    #[test]
    fn test_replay_transfer_with_fee() {
        let journal = Journal::new();
        journal.append(entry(1, 1000, EntryKind::IpoGrant, 1000));
        journal.append(entry(1, -500, EntryKind::TransferOut, 500));
        journal.append(entry(1, -50, EntryKind::Fee, 450));
        journal.append(entry(2, 500, EntryKind::TransferIn, 500));

        let state = journal.replay();
        assert_eq!(state.get(&1), Some(&(450, 0)));
        assert_eq!(state.get(&2), Some(&(500, 0)));
    }

    #[test]
    fn test_entries_for_newest_first() {
        let journal = Journal::new();
        journal.append(entry(1, 10, EntryKind::AdminGrant, 10));
        journal.append(entry(2, 5, EntryKind::AdminGrant, 5));
        journal.append(entry(1, 20, EntryKind::AdminGrant, 30));

        let out = journal.entries_for(1, 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].delta, 20);
        assert_eq!(out[1].delta, 10);

        let out = journal.entries_for(1, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delta, 20);
    }

    #[test]
    fn test_csv_mirror() {
        let path = format!("/tmp/test_campex_journal_{}.csv", std::process::id());
        {
            let journal = Journal::with_csv(&path).expect("csv journal");
            journal.append(entry(7, 42, EntryKind::AdminGrant, 42));
            assert_eq!(journal.csv_count(), 1);
            journal.flush();
        }

        let content = std::fs::read_to_string(&path).expect("read back");
        assert!(content.contains(JournalEntry::csv_header()));
        assert!(content.contains("7,admin_grant,42,42"));
        std::fs::remove_file(&path).ok();
    }
}
