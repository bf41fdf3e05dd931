//! Transfer service - P2P point transfers with fees
//!
//! The sender pays `amount + fee` in one atomic check-and-decrement
//! (`debit_split`), then the recipient is credited. Transient persistence
//! failures are retried with exponential backoff and jitter; when the
//! retry budget runs out the operation degrades to exactly this
//! non-transactional two-step, which is safe because the checked debit
//! alone preserves non-negativity - the two legs are just not strictly
//! simultaneous.

use crate::config::MarketConfig;
use crate::core_types::{Points, UserId};
use crate::errors::CoreError;
use crate::events::{EventBus, Topic};
use crate::journal::EntryKind;
use crate::ledger::Ledger;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct TransferAck {
    pub tx_id: String,
    pub fee: Points,
}

/// Retry envelope for transient persistence errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

/// Run `op`, retrying transient errors with exponential backoff + jitter.
pub async fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let exp = policy
                    .base_delay_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16))
                    .min(policy.max_delay_ms);
                let jitter = rand::thread_rng().gen_range(0..=exp / 2);
                tracing::warn!(attempt, delay_ms = exp + jitter, "transient error, retrying");
                tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
            }
            other => return other,
        }
    }
}

pub struct TransferService {
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    market_cfg: Arc<RwLock<MarketConfig>>,
    retry: RetryPolicy,
}

impl TransferService {
    pub fn new(
        ledger: Arc<Ledger>,
        bus: Arc<EventBus>,
        market_cfg: Arc<RwLock<MarketConfig>>,
    ) -> Self {
        Self {
            ledger,
            bus,
            market_cfg,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Transfer points to another user by username.
    ///
    /// Fee = `max(min_fee, floor(amount * rate_pct / 100))`, retained by
    /// the system. The sender gets two journal entries (`transfer_out`,
    /// `fee`), the recipient one (`transfer_in`).
    pub async fn transfer(
        &self,
        from_uid: UserId,
        to_username: &str,
        amount: Points,
        note: &str,
    ) -> Result<TransferAck, CoreError> {
        if amount <= 0 {
            return Err(CoreError::InvalidArgs("amount must be positive".into()));
        }
        let to_uid = self
            .ledger
            .resolve_username(to_username)
            .ok_or(CoreError::UnknownUser)?;
        if to_uid == from_uid {
            return Err(CoreError::InvalidArgs("self-transfer not allowed".into()));
        }
        self.ledger.check_actor(from_uid)?;

        let fee = {
            let cfg = self.market_cfg.read().unwrap_or_else(|e| e.into_inner());
            cfg.transfer_fee.fee_for(amount)
        };
        let tx_id = ulid::Ulid::new().to_string();

        self.bus.publish_with_correlation(
            Topic::TransferInitiated,
            Some(from_uid),
            json!({ "to": to_uid, "amount": amount, "fee": fee }),
            Some(tx_id.clone()),
        );

        let result = with_retry(&self.retry, || {
            self.execute(from_uid, to_uid, amount, fee, &tx_id, note)
        })
        .await;

        match result {
            Ok(()) => {
                self.bus.publish_with_correlation(
                    Topic::TransferCompleted,
                    Some(from_uid),
                    json!({ "to": to_uid, "amount": amount, "fee": fee }),
                    Some(tx_id.clone()),
                );
                self.bus
                    .publish(Topic::UserPointsUpdated, Some(from_uid), json!({}));
                self.bus
                    .publish(Topic::UserPointsUpdated, Some(to_uid), json!({}));
                tracing::info!(from_uid, to_uid, amount, fee, tx_id = %tx_id, "transfer completed");
                Ok(TransferAck { tx_id, fee })
            }
            Err(e) => {
                self.bus.publish_with_correlation(
                    Topic::TransferFailed,
                    Some(from_uid),
                    json!({ "to": to_uid, "amount": amount, "error": e.code() }),
                    Some(tx_id),
                );
                Err(e)
            }
        }
    }

    /// The two-legged move. The checked sender debit is the safety net:
    /// it either fully applies (both journal entries included) or nothing
    /// happens.
    fn execute(
        &self,
        from_uid: UserId,
        to_uid: UserId,
        amount: Points,
        fee: Points,
        tx_id: &str,
        note: &str,
    ) -> Result<(), CoreError> {
        self.ledger.debit_split(
            from_uid,
            &[
                (amount, EntryKind::TransferOut, note.to_string()),
                (fee, EntryKind::Fee, "transfer fee".to_string()),
            ],
            Some(tx_id),
        )?;

        // Users are never deleted, so the credit can only fail on
        // arithmetic overflow - an invariant violation needing a human.
        self.ledger
            .credit(to_uid, amount, EntryKind::TransferIn, note)
            .map_err(|e| {
                tracing::error!(
                    from_uid,
                    to_uid,
                    amount,
                    tx_id,
                    error = %e,
                    "recipient credit failed after sender debit"
                );
                CoreError::InvariantViolation(format!(
                    "transfer {tx_id} debited sender but credit failed: {e}"
                ))
            })?;
        Ok(())
    }
}

// ============================================================
// TESTS
// ============================================================
