//! Sharded order router
//!
//! Hashes every user to one of N shards; each shard is a tokio task
//! draining a bounded FIFO queue. Two operations from the same user are
//! therefore serialised, while traffic across users runs in parallel,
//! without per-user mutexes in the ledger.
//!
//! Each shard carries a load counter. At the cap, policy decides: reject
//! with `ErrShardBusy` (caller retries) or redirect to the least-loaded
//! shard (publishing `SHARD_REBALANCED`).
//!
//! On shutdown the queues are closed: in-flight work drains, new
//! submissions are rejected.

use crate::config::OverflowPolicy;
use crate::core_types::{OrderId, Points, Price, Qty, UserId};
use crate::errors::CoreError;
use crate::events::{EventBus, Topic};
use crate::lifecycle::{CancelAck, OrderAck, OrderLifecycle};
use crate::models::{CancelReason, OrderType, Side};
use crate::transfer::{TransferAck, TransferService};
use serde::Serialize;
use serde_json::json;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ============================================================
// COMMANDS
// ============================================================

/// One routed operation. Every command carries the uid it is keyed on
/// and a oneshot for the result.
pub enum RouterCommand {
    PlaceOrder {
        uid: UserId,
        side: Side,
        order_type: OrderType,
        qty: Qty,
        price: Option<Price>,
        reply: oneshot::Sender<Result<OrderAck, CoreError>>,
    },
    CancelOrder {
        uid: UserId,
        order_id: OrderId,
        reason: CancelReason,
        reply: oneshot::Sender<Result<CancelAck, CoreError>>,
    },
    Transfer {
        from_uid: UserId,
        to_username: String,
        amount: Points,
        note: String,
        reply: oneshot::Sender<Result<TransferAck, CoreError>>,
    },
    IpoBuy {
        uid: UserId,
        qty: Qty,
        reply: oneshot::Sender<Result<OrderAck, CoreError>>,
    },
}

impl RouterCommand {
    fn uid(&self) -> UserId {
        match self {
            RouterCommand::PlaceOrder { uid, .. } => *uid,
            RouterCommand::CancelOrder { uid, .. } => *uid,
            RouterCommand::Transfer { from_uid, .. } => *from_uid,
            RouterCommand::IpoBuy { uid, .. } => *uid,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub shard_id: usize,
    pub load: usize,
}

// ============================================================
// ROUTER
// ============================================================

pub struct ShardedRouter {
    senders: Mutex<Option<Vec<mpsc::Sender<RouterCommand>>>>,
    loads: Vec<Arc<AtomicUsize>>,
    shard_count: usize,
    max_load: usize,
    policy: OverflowPolicy,
    bus: Arc<EventBus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardedRouter {
    /// Build the router and spawn one worker task per shard.
    pub fn start(
        shard_count: usize,
        queue_depth: usize,
        max_load: usize,
        policy: OverflowPolicy,
        lifecycle: Arc<OrderLifecycle>,
        transfers: Arc<TransferService>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let shard_count = shard_count.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut loads = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);

        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            let load = Arc::new(AtomicUsize::new(0));
            senders.push(tx);
            loads.push(load.clone());
            handles.push(tokio::spawn(Self::worker(
                shard_id,
                rx,
                load,
                lifecycle.clone(),
                transfers.clone(),
            )));
        }
        tracing::info!(shard_count, queue_depth, max_load, "sharded router started");

        Arc::new(Self {
            senders: Mutex::new(Some(senders)),
            loads,
            shard_count,
            max_load,
            policy,
            bus,
            handles: Mutex::new(handles),
        })
    }

    async fn worker(
        shard_id: usize,
        mut rx: mpsc::Receiver<RouterCommand>,
        load: Arc<AtomicUsize>,
        lifecycle: Arc<OrderLifecycle>,
        transfers: Arc<TransferService>,
    ) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RouterCommand::PlaceOrder {
                    uid,
                    side,
                    order_type,
                    qty,
                    price,
                    reply,
                } => {
                    let result = lifecycle.place_order(uid, side, order_type, qty, price);
                    let _ = reply.send(result);
                }
                RouterCommand::CancelOrder {
                    uid,
                    order_id,
                    reason,
                    reply,
                } => {
                    let result = lifecycle.cancel_order(uid, order_id, reason);
                    let _ = reply.send(result);
                }
                RouterCommand::Transfer {
                    from_uid,
                    to_username,
                    amount,
                    note,
                    reply,
                } => {
                    let result = transfers
                        .transfer(from_uid, &to_username, amount, &note)
                        .await;
                    let _ = reply.send(result);
                }
                RouterCommand::IpoBuy { uid, qty, reply } => {
                    let result = lifecycle.ipo_buy(uid, qty);
                    let _ = reply.send(result);
                }
            }
            load.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(shard_id, "shard worker drained and stopped");
    }

    // ============================================================
    // DISPATCH
    // ============================================================

    fn shard_of(&self, uid: UserId) -> usize {
        let mut hasher = rustc_hash::FxHasher::default();
        uid.hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }

    fn least_loaded(&self) -> usize {
        self.loads
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| l.load(Ordering::SeqCst))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Enqueue a command on its user's shard. Non-blocking.
    pub fn dispatch(&self, cmd: RouterCommand) -> Result<(), CoreError> {
        let uid = cmd.uid();
        let mut shard = self.shard_of(uid);

        if self.loads[shard].load(Ordering::SeqCst) >= self.max_load {
            match self.policy {
                OverflowPolicy::Reject => return Err(CoreError::ShardBusy),
                OverflowPolicy::Redirect => {
                    let target = self.least_loaded();
                    if target != shard {
                        self.bus.publish(
                            Topic::ShardRebalanced,
                            Some(uid),
                            json!({ "from": shard, "to": target }),
                        );
                        shard = target;
                    }
                }
            }
        }

        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = senders.as_ref() else {
            return Err(CoreError::ShuttingDown);
        };
        self.loads[shard].fetch_add(1, Ordering::SeqCst);
        match senders[shard].try_send(cmd) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.loads[shard].fetch_sub(1, Ordering::SeqCst);
                self.bus.publish(
                    Topic::QueueOverflow,
                    Some(uid),
                    json!({ "shard": shard }),
                );
                Err(CoreError::ShardBusy)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.loads[shard].fetch_sub(1, Ordering::SeqCst);
                Err(CoreError::ShuttingDown)
            }
        }
    }

    // ============================================================
    // TYPED FRONT DOORS
    // ============================================================

    pub async fn place_order(
        &self,
        uid: UserId,
        side: Side,
        order_type: OrderType,
        qty: Qty,
        price: Option<Price>,
    ) -> Result<OrderAck, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(RouterCommand::PlaceOrder {
            uid,
            side,
            order_type,
            qty,
            price,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    pub async fn cancel_order(
        &self,
        uid: UserId,
        order_id: OrderId,
        reason: CancelReason,
    ) -> Result<CancelAck, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(RouterCommand::CancelOrder {
            uid,
            order_id,
            reason,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    pub async fn transfer(
        &self,
        from_uid: UserId,
        to_username: &str,
        amount: Points,
        note: &str,
    ) -> Result<TransferAck, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(RouterCommand::Transfer {
            from_uid,
            to_username: to_username.to_string(),
            amount,
            note: note.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    pub async fn ipo_buy(&self, uid: UserId, qty: Qty) -> Result<OrderAck, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(RouterCommand::IpoBuy { uid, qty, reply })?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    // ============================================================
    // STATUS & SHUTDOWN
    // ============================================================

    pub fn shard_status(&self) -> Vec<ShardStatus> {
        self.loads
            .iter()
            .enumerate()
            .map(|(shard_id, l)| ShardStatus {
                shard_id,
                load: l.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Close the queues (new submissions rejected) and wait for the
    /// workers to drain.
    pub async fn stop(&self) {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(senders);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("sharded router stopped");
    }
}

// ============================================================
// TESTS
// ============================================================
