//! Configuration types and loaders
//!
//! Two configuration layers:
//! - [`AppConfig`] - process-level settings (logging, shards, bus sizing,
//!   background task cadence). Loaded once at startup.
//! - [`MarketConfig`] - market policy (price band, IPO terms, trading
//!   windows, fee policies). Mutable at runtime through the admin API.

use crate::core_types::{Points, Price, Qty, TsMillis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What the router does when a shard is at its load cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the operation with a retry hint.
    Reject,
    /// Redirect to the least-loaded shard.
    Redirect,
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Logging
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    /// "hourly" | "daily" | anything else = never rotate
    pub rotation: String,
    pub use_json: bool,

    // Sharded router
    pub shard_count: usize,
    pub shard_queue_depth: usize,
    pub shard_max_load: usize,
    pub overflow_policy: OverflowPolicy,

    // Event bus
    pub bus_buffer: usize,
    pub bus_history: usize,
    pub bus_max_retries: u32,

    // Background tasks
    pub escrow_max_age_secs: u64,
    pub audit_interval_secs: u64,
    pub notify_flush_secs: u64,

    /// Outbound notification endpoint; None disables delivery.
    pub notify_endpoint: Option<String>,

    /// Optional CSV journal file mirroring the in-memory ledger journal.
    pub journal_csv_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "campex.log".to_string(),
            log_level: "info".to_string(),
            rotation: "daily".to_string(),
            use_json: false,
            shard_count: 16,
            shard_queue_depth: 256,
            shard_max_load: 128,
            overflow_policy: OverflowPolicy::Reject,
            bus_buffer: 4096,
            bus_history: 10_000,
            bus_max_retries: 3,
            escrow_max_age_secs: 3600,
            audit_interval_secs: 300,
            notify_flush_secs: 30,
            notify_endpoint: None,
            journal_csv_path: None,
        }
    }
}

impl AppConfig {
    /// Load from a YAML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Transfer fee policy: `fee = max(min_fee, floor(amount * rate_pct / 100))`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeePolicy {
    pub rate_pct: u32,
    pub min_fee: Points,
}

impl FeePolicy {
    pub fn fee_for(&self, amount: Points) -> Points {
        let pct = (amount as i128 * self.rate_pct as i128) / 100;
        (pct as Points).max(self.min_fee)
    }
}

/// One scheduled trading window, UTC epoch milliseconds, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingWindow {
    pub start_ms: TsMillis,
    pub end_ms: TsMillis,
}

impl TradingWindow {
    pub fn contains(&self, ts: TsMillis) -> bool {
        ts >= self.start_ms && ts < self.end_ms
    }
}

/// Market policy singleton.
///
/// The band percent is stored in basis points (1 bp = 0.01%) exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Up/down limit around the reference price, in basis points.
    pub band_bps: u32,
    /// Fixed primary-issue price.
    pub ipo_price: Price,
    /// Shares available in the primary pool at startup.
    pub ipo_shares: Qty,
    /// Scheduled trading windows.
    pub windows: Vec<TradingWindow>,
    /// P2P transfer fee policy.
    pub transfer_fee: FeePolicy,
    /// Order fee on traded notional, in basis points. Zero disables.
    pub order_fee_bps: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            band_bps: 2000,
            ipo_price: 20,
            ipo_shares: 10_000,
            windows: Vec::new(),
            transfer_fee: FeePolicy {
                rate_pct: 10,
                min_fee: 1,
            },
            order_fee_bps: 0,
        }
    }
}

impl MarketConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Order fee on a traded notional. Floor division, no minimum.
    pub fn order_fee_for(&self, notional: Points) -> Points {
        ((notional as i128 * self.order_fee_bps as i128) / 10_000) as Points
    }
}
