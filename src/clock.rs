//! Market clock - open/close state
//!
//! Two sources decide whether the market is open: the scheduled windows in
//! the market config, and a manual override. The manual override, when
//! set, wins over the windows. Transitions are applied by the lifecycle
//! service (call auction at open, cancel-all at close); the clock itself
//! only answers "is the market open" and "when does that next change".

use crate::config::TradingWindow;
use crate::core_types::{TsMillis, now_ms};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MarketClock {
    windows: RwLock<Vec<TradingWindow>>,
    manual: RwLock<Option<bool>>,
}

impl MarketClock {
    pub fn new(windows: Vec<TradingWindow>) -> Self {
        Self {
            windows: RwLock::new(windows),
            manual: RwLock::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(now_ms())
    }

    pub fn is_open_at(&self, ts: TsMillis) -> bool {
        if let Some(forced) = *self.manual.read().unwrap_or_else(|e| e.into_inner()) {
            return forced;
        }
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|w| w.contains(ts))
    }

    pub fn windows(&self) -> Vec<TradingWindow> {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_windows(&self, windows: Vec<TradingWindow>) {
        tracing::info!(count = windows.len(), "trading windows updated");
        *self.windows.write().unwrap_or_else(|e| e.into_inner()) = windows;
    }

    pub fn manual_override(&self) -> Option<bool> {
        *self.manual.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn force_open(&self) {
        tracing::info!("market forced open");
        *self.manual.write().unwrap_or_else(|e| e.into_inner()) = Some(true);
    }

    pub fn force_close(&self) {
        tracing::info!("market forced closed");
        *self.manual.write().unwrap_or_else(|e| e.into_inner()) = Some(false);
    }

    /// Back to schedule-driven state.
    pub fn clear_override(&self) {
        *self.manual.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Next instant at which `is_open` changes, or None while a manual
    /// override pins the state (or no scheduled change remains).
    pub fn next_transition_ts(&self) -> Option<TsMillis> {
        if self.manual_override().is_some() {
            return None;
        }
        let now = now_ms();
        let open_now = self.is_open_at(now);
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());

        let mut boundaries: Vec<TsMillis> = windows
            .iter()
            .flat_map(|w| [w.start_ms, w.end_ms])
            .filter(|&b| b > now)
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        drop(windows);
        boundaries
            .into_iter()
            .find(|&b| self.is_open_at(b) != open_now)
    }
}
