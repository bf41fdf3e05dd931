//! IPO - primary-issue share allocator
//!
//! Holds the remaining primary pool at a fixed price. Direct purchases
//! take an exact quantity or fail; residual market-buy fills take as much
//! as is left. All state changes are atomic under one mutex.

use crate::core_types::{Price, Qty};
use crate::errors::CoreError;
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IpoStatus {
    pub shares_remaining: Qty,
    pub price: Price,
}

#[derive(Debug)]
pub struct IpoService {
    state: Mutex<IpoStatus>,
}

impl IpoService {
    pub fn new(shares: Qty, price: Price) -> Self {
        Self {
            state: Mutex::new(IpoStatus {
                shares_remaining: shares,
                price,
            }),
        }
    }

    pub fn status(&self) -> IpoStatus {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically take exactly `qty` shares. All-or-nothing.
    pub fn take_exact(&self, qty: Qty) -> Result<Price, CoreError> {
        if qty == 0 {
            return Err(CoreError::InvalidArgs("qty must be positive".into()));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shares_remaining < qty {
            return Err(CoreError::InsufficientIpo);
        }
        state.shares_remaining -= qty;
        Ok(state.price)
    }

    /// Atomically take up to `max_qty` shares; returns `(taken, price)`.
    /// Used by the matching engine for residual market buys.
    pub fn take_up_to(&self, max_qty: Qty) -> (Qty, Price) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let taken = state.shares_remaining.min(max_qty);
        state.shares_remaining -= taken;
        (taken, state.price)
    }

    /// Return shares to the pool (settlement of a failed allocation).
    pub fn put_back(&self, qty: Qty) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shares_remaining += qty;
    }

    /// Replace the pool outright.
    pub fn admin_reset(&self, shares: Qty, price: Price) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shares_remaining = shares;
        state.price = price;
        tracing::info!(shares, price, "ipo pool reset");
    }

    /// Update either field, leaving the other untouched.
    pub fn admin_update(&self, shares: Option<Qty>, price: Option<Price>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shares) = shares {
            state.shares_remaining = shares;
        }
        if let Some(price) = price {
            state.price = price;
        }
        tracing::info!(
            shares = state.shares_remaining,
            price = state.price,
            "ipo pool updated"
        );
    }
}
