//! Outbound notifications - best-effort HTTP delivery
//!
//! Posts `{user_telegram_id, payload}` to the configured endpoint with a
//! 5 second timeout. Any non-2xx or timeout parks the notification in a
//! retry store that a background task flushes later; delivery problems
//! never propagate back to the trading caller.

use crate::core_types::UserId;
use crate::events::{Event, EventHandler, Topic};
use crate::ledger::Ledger;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Retry store cap; beyond it the oldest undelivered payloads are shed.
const PENDING_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_telegram_id: i64,
    pub payload: serde_json::Value,
}

pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<String>,
    pending: Mutex<VecDeque<Notification>>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Notifier {
    pub fn new(endpoint: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            pending: Mutex::new(VecDeque::new()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Deliver one notification; on failure it is queued for retry.
    pub async fn send(&self, notification: Notification) {
        let Some(endpoint) = self.endpoint.clone() else {
            return; // Delivery disabled
        };
        match self.post(&endpoint, &notification).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "notification delivery failed, queued for retry");
                self.park(notification);
            }
        }
    }

    async fn post(&self, endpoint: &str, notification: &Notification) -> anyhow::Result<()> {
        let response = self
            .client
            .post(endpoint)
            .json(notification)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("notification endpoint returned {}", response.status());
        }
        Ok(())
    }

    fn park(&self, notification: Notification) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push_back(notification);
        while pending.len() > PENDING_CAP {
            pending.pop_front();
        }
    }

    /// Re-attempt everything in the retry store. Failures go back to the
    /// end of the queue. Returns how many were delivered.
    pub async fn flush_pending(&self) -> usize {
        let Some(endpoint) = self.endpoint.clone() else {
            return 0;
        };
        let batch: Vec<Notification> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for notification in batch {
            match self.post(&endpoint, &notification).await {
                Ok(()) => {
                    delivered += 1;
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => self.park(notification),
            }
        }
        if delivered > 0 {
            tracing::info!(delivered, "flushed pending notifications");
        }
        delivered
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

// ============================================================
// EVENT BRIDGE
// ============================================================

/// Subscribes to user-facing topics and forwards them as notifications.
pub struct NotificationHandler {
    notifier: Arc<Notifier>,
    ledger: Arc<Ledger>,
}

impl NotificationHandler {
    pub fn new(notifier: Arc<Notifier>, ledger: Arc<Ledger>) -> Self {
        Self { notifier, ledger }
    }

    fn telegram_id(&self, uid: UserId) -> Option<i64> {
        self.ledger.telegram_id_of(uid)
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    fn name(&self) -> &str {
        "notifications"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![
            Topic::OrderMatched,
            Topic::OrderCancelled,
            Topic::TransferCompleted,
        ]
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let Some(uid) = event.uid else { return Ok(()) };
        let Some(telegram_id) = self.telegram_id(uid) else {
            return Ok(()); // No external identity linked
        };
        self.notifier
            .send(Notification {
                user_telegram_id: telegram_id,
                payload: json!({
                    "topic": event.topic.as_str(),
                    "ts": event.ts,
                    "data": event.payload,
                }),
            })
            .await;
        Ok(())
    }
}
