//! Event bus - in-process topic pub/sub
//!
//! Publish is non-blocking: events land in a bounded lock-free buffer and
//! a dedicated dispatcher task fans them out to all subscribed handlers.
//! A handler that errors is retried with exponential backoff up to
//! `max_retries`; final failure is logged and counted but never blocks
//! further events.
//!
//! # Ordering
//! Per single handler, events arrive in publish order. Across handlers
//! there is no ordering guarantee (delivery for one event is concurrent).
//!
//! A bounded ring retains recent events for replay by topic, user and
//! time window.

use crate::core_types::{TsMillis, UserId, now_ms};
use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

// ============================================================
// TOPICS & EVENTS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    OrderCreated,
    OrderMatched,
    OrderCancelled,
    OrderFailed,
    UserPointsUpdated,
    UserPortfolioUpdated,
    MarketOpened,
    MarketClosed,
    PriceUpdated,
    TransferInitiated,
    TransferCompleted,
    TransferFailed,
    ShardRebalanced,
    QueueOverflow,
    SystemMaintenance,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrderCreated => "ORDER_CREATED",
            Topic::OrderMatched => "ORDER_MATCHED",
            Topic::OrderCancelled => "ORDER_CANCELLED",
            Topic::OrderFailed => "ORDER_FAILED",
            Topic::UserPointsUpdated => "USER_POINTS_UPDATED",
            Topic::UserPortfolioUpdated => "USER_PORTFOLIO_UPDATED",
            Topic::MarketOpened => "MARKET_OPENED",
            Topic::MarketClosed => "MARKET_CLOSED",
            Topic::PriceUpdated => "PRICE_UPDATED",
            Topic::TransferInitiated => "TRANSFER_INITIATED",
            Topic::TransferCompleted => "TRANSFER_COMPLETED",
            Topic::TransferFailed => "TRANSFER_FAILED",
            Topic::ShardRebalanced => "SHARD_REBALANCED",
            Topic::QueueOverflow => "QUEUE_OVERFLOW",
            Topic::SystemMaintenance => "SYSTEM_MAINTENANCE",
        }
    }
}

/// One published event. Delivery is at-least-once per handler.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_id: Uuid,
    pub topic: Topic,
    pub ts: TsMillis,
    pub uid: Option<UserId>,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
}

/// A subscriber. Handlers are registered once and receive every event
/// whose topic is in `topics()`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn topics(&self) -> Vec<Topic>;
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

// ============================================================
// STATS
// ============================================================

#[derive(Debug, Default)]
pub struct HandlerStats {
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerStatsView {
    pub name: String,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub handlers: Vec<HandlerStatsView>,
}

struct HandlerEntry {
    handler: Arc<dyn EventHandler>,
    topics: Vec<Topic>,
    stats: Arc<HandlerStats>,
}

// ============================================================
// EVENT BUS
// ============================================================

pub struct EventBus {
    buffer: ArrayQueue<Event>,
    handlers: RwLock<Vec<HandlerEntry>>,
    history: Mutex<VecDeque<Event>>,
    history_cap: usize,
    max_retries: u32,
    published: AtomicU64,
    dropped: AtomicU64,
    wakeup: Notify,
}

impl EventBus {
    pub fn new(buffer_cap: usize, history_cap: usize, max_retries: u32) -> Self {
        Self {
            buffer: ArrayQueue::new(buffer_cap.max(1)),
            handlers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_cap,
            max_retries,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            wakeup: Notify::new(),
        }
    }

    /// Register a handler. Call before `run_dispatcher` starts delivering.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let topics = handler.topics();
        tracing::info!(handler = handler.name(), ?topics, "event handler subscribed");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(HandlerEntry {
                topics,
                stats: Arc::new(HandlerStats::default()),
                handler,
            });
    }

    /// Non-blocking best-effort publish.
    pub fn publish(&self, topic: Topic, uid: Option<UserId>, payload: serde_json::Value) {
        self.publish_with_correlation(topic, uid, payload, None)
    }

    pub fn publish_with_correlation(
        &self,
        topic: Topic,
        uid: Option<UserId>,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) {
        let event = Event {
            event_id: Uuid::new_v4(),
            topic,
            ts: now_ms(),
            uid,
            payload,
            correlation_id,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(event.clone());
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }

        match self.buffer.push(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                self.wakeup.notify_one();
            }
            Err(dropped) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic = dropped.topic.as_str(),
                    "event buffer full, event dropped"
                );
            }
        }
    }

    /// Drain the buffer and fan events out until shutdown, then drain one
    /// final time so nothing published before the signal is lost.
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            while let Some(event) = self.buffer.pop() {
                self.dispatch_one(&event).await;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        while let Some(event) = self.buffer.pop() {
                            self.dispatch_one(&event).await;
                        }
                        tracing::info!("event dispatcher stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch_one(&self, event: &Event) {
        // Snapshot the matching handlers; the lock is not held across await.
        let targets: Vec<(Arc<dyn EventHandler>, Arc<HandlerStats>)> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .iter()
                .filter(|e| e.topics.contains(&event.topic))
                .map(|e| (e.handler.clone(), e.stats.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let deliveries = targets
            .into_iter()
            .map(|(handler, stats)| self.deliver_with_retry(handler, stats, event));
        futures::future::join_all(deliveries).await;
    }

    async fn deliver_with_retry(
        &self,
        handler: Arc<dyn EventHandler>,
        stats: Arc<HandlerStats>,
        event: &Event,
    ) {
        let mut attempt: u32 = 0;
        loop {
            match handler.handle(event).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            handler = handler.name(),
                            topic = event.topic.as_str(),
                            event_id = %event.event_id,
                            error = %e,
                            "handler failed after retries"
                        );
                        return;
                    }
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                    let base = 50u64.saturating_mul(1 << (attempt - 1).min(6));
                    let jitter = rand::thread_rng().gen_range(0..=base / 2);
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }

    // ============================================================
    // REPLAY & STATS
    // ============================================================

    /// Events from the retention ring matching the filter, oldest first.
    pub fn replay(
        &self,
        topic: Option<Topic>,
        uid: Option<UserId>,
        since: Option<TsMillis>,
        until: Option<TsMillis>,
    ) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .filter(|e| topic.is_none_or(|t| e.topic == t))
            .filter(|e| uid.is_none_or(|u| e.uid == Some(u)))
            .filter(|e| since.is_none_or(|s| e.ts >= s))
            .filter(|e| until.is_none_or(|u| e.ts <= u))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handlers: handlers
                .iter()
                .map(|e| HandlerStatsView {
                    name: e.handler.name().to_string(),
                    delivered: e.stats.delivered.load(Ordering::Relaxed),
                    retried: e.stats.retried.load(Ordering::Relaxed),
                    failed: e.stats.failed.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
