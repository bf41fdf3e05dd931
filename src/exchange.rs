//! Exchange - the composition root
//!
//! Constructs every service explicitly (no global singletons), wires the
//! event handlers, and owns the background tasks: event dispatcher, clock
//! watcher, escrow/order janitor, integrity auditor, notification flush.
//! `start()` spawns them; `stop()` signals shutdown, drains the router
//! queues and waits for the tasks to finish.

use crate::auditor::IntegrityAuditor;
use crate::clock::MarketClock;
use crate::config::{AppConfig, MarketConfig};
use crate::core_types::{OrderId, Points, Price, Qty, UserId};
use crate::errors::CoreError;
use crate::escrow::EscrowManager;
use crate::events::EventBus;
use crate::holdings::HoldingsBook;
use crate::ipo::IpoService;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::lifecycle::{CancelAck, OrderAck, OrderLifecycle};
use crate::api::MarketQuery;
use crate::admin::AdminService;
use crate::models::{CancelReason, OrderType, Side};
use crate::notify::{NotificationHandler, Notifier};
use crate::router::ShardedRouter;
use crate::transfer::{TransferAck, TransferService};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Exchange {
    pub ledger: Arc<Ledger>,
    pub escrows: Arc<EscrowManager>,
    pub holdings: Arc<HoldingsBook>,
    pub ipo: Arc<IpoService>,
    pub clock: Arc<MarketClock>,
    pub bus: Arc<EventBus>,
    pub lifecycle: Arc<OrderLifecycle>,
    pub transfers: Arc<TransferService>,
    pub auditor: Arc<IntegrityAuditor>,
    pub notifier: Arc<Notifier>,
    pub admin: Arc<AdminService>,
    pub query: Arc<MarketQuery>,
    app_cfg: AppConfig,
    router: OnceLock<Arc<ShardedRouter>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Exchange {
    pub fn new(app_cfg: AppConfig, market_cfg: MarketConfig) -> anyhow::Result<Self> {
        let journal = match &app_cfg.journal_csv_path {
            Some(path) => Journal::with_csv(path)?,
            None => Journal::new(),
        };

        let ledger = Arc::new(Ledger::new(journal));
        let escrows = Arc::new(EscrowManager::new(ledger.clone()));
        let holdings = Arc::new(HoldingsBook::new());
        let ipo = Arc::new(IpoService::new(market_cfg.ipo_shares, market_cfg.ipo_price));
        let clock = Arc::new(MarketClock::new(market_cfg.windows.clone()));
        let bus = Arc::new(EventBus::new(
            app_cfg.bus_buffer,
            app_cfg.bus_history,
            app_cfg.bus_max_retries,
        ));
        let market_cfg = Arc::new(RwLock::new(market_cfg));

        let lifecycle = Arc::new(OrderLifecycle::new(
            ledger.clone(),
            escrows.clone(),
            holdings.clone(),
            ipo.clone(),
            clock.clone(),
            bus.clone(),
            market_cfg.clone(),
        ));
        let transfers = Arc::new(TransferService::new(
            ledger.clone(),
            bus.clone(),
            market_cfg.clone(),
        ));
        let auditor = Arc::new(IntegrityAuditor::new(
            ledger.clone(),
            escrows.clone(),
            bus.clone(),
        ));
        let notifier = Arc::new(Notifier::new(app_cfg.notify_endpoint.clone()));
        bus.subscribe(Arc::new(NotificationHandler::new(
            notifier.clone(),
            ledger.clone(),
        )));

        let admin = Arc::new(AdminService::new(
            ledger.clone(),
            lifecycle.clone(),
            holdings.clone(),
            ipo.clone(),
            clock.clone(),
            auditor.clone(),
            bus.clone(),
            market_cfg.clone(),
        ));
        let query = Arc::new(MarketQuery::new(
            ledger.clone(),
            holdings.clone(),
            lifecycle.clone(),
            clock.clone(),
            ipo.clone(),
            market_cfg.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            ledger,
            escrows,
            holdings,
            ipo,
            clock,
            bus,
            lifecycle,
            transfers,
            auditor,
            notifier,
            admin,
            query,
            app_cfg,
            router: OnceLock::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ============================================================
    // START / STOP
    // ============================================================

    /// Spawn the router workers and all background tasks.
    pub fn start(&self) {
        let router = ShardedRouter::start(
            self.app_cfg.shard_count,
            self.app_cfg.shard_queue_depth,
            self.app_cfg.shard_max_load,
            self.app_cfg.overflow_policy,
            self.lifecycle.clone(),
            self.transfers.clone(),
            self.bus.clone(),
        );
        let _ = self.router.set(router);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Event dispatcher
        tasks.push(tokio::spawn(
            self.bus.clone().run_dispatcher(self.shutdown.subscribe()),
        ));

        // Clock watcher: applies open/close transitions
        {
            let lifecycle = self.lifecycle.clone();
            tasks.push(self.spawn_interval(Duration::from_secs(1), move || {
                lifecycle.sync_market_state();
            }));
        }

        // Janitor: expired escrows and stale resting orders
        {
            let lifecycle = self.lifecycle.clone();
            let escrows = self.escrows.clone();
            let max_age_ms = (self.app_cfg.escrow_max_age_secs as i64) * 1000;
            tasks.push(self.spawn_interval(Duration::from_secs(60), move || {
                lifecycle.cancel_stale_orders(max_age_ms);
                escrows.cleanup_expired(max_age_ms);
            }));
        }

        // Integrity auditor
        {
            let auditor = self.auditor.clone();
            let period = Duration::from_secs(self.app_cfg.audit_interval_secs.max(1));
            tasks.push(self.spawn_interval(period, move || {
                auditor.run(false);
            }));
        }

        // Notification retry flush
        {
            let notifier = self.notifier.clone();
            let period = Duration::from_secs(self.app_cfg.notify_flush_secs.max(1));
            let mut rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { notifier.flush_pending().await; }
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() { break; }
                        }
                    }
                }
            }));
        }

        drop(tasks);
        // Apply the current schedule state immediately.
        self.lifecycle.sync_market_state();
        tracing::info!("exchange started");
    }

    fn spawn_interval(
        &self,
        period: Duration,
        work: impl Fn() + Send + 'static,
    ) -> JoinHandle<()> {
        let mut rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => work(),
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Signal shutdown, drain the router, wait for background tasks.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(router) = self.router.get() {
            router.stop().await;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.ledger.journal().flush();
        tracing::info!("exchange stopped");
    }

    // ============================================================
    // FRONT DOOR
    // ============================================================

    fn router(&self) -> Result<&Arc<ShardedRouter>, CoreError> {
        self.router.get().ok_or(CoreError::ShuttingDown)
    }

    pub fn register_user(
        &self,
        uid: UserId,
        username: &str,
        team: &str,
        telegram_id: Option<i64>,
        initial_points: Points,
    ) -> Result<(), CoreError> {
        self.ledger
            .register_user(uid, username, team, telegram_id, initial_points)
    }

    pub async fn place_order(
        &self,
        uid: UserId,
        side: Side,
        order_type: OrderType,
        qty: Qty,
        price: Option<Price>,
    ) -> Result<OrderAck, CoreError> {
        self.router()?
            .place_order(uid, side, order_type, qty, price)
            .await
    }

    pub async fn cancel_order(
        &self,
        uid: UserId,
        order_id: OrderId,
        reason: Option<CancelReason>,
    ) -> Result<CancelAck, CoreError> {
        self.router()?
            .cancel_order(uid, order_id, reason.unwrap_or(CancelReason::UserRequested))
            .await
    }

    pub async fn transfer_points(
        &self,
        from_uid: UserId,
        to_username: &str,
        amount: Points,
        note: Option<&str>,
    ) -> Result<TransferAck, CoreError> {
        self.router()?
            .transfer(from_uid, to_username, amount, note.unwrap_or(""))
            .await
    }

    pub async fn ipo_buy(&self, uid: UserId, qty: Qty) -> Result<OrderAck, CoreError> {
        self.router()?.ipo_buy(uid, qty).await
    }

    pub fn shard_status(&self) -> Vec<crate::router::ShardStatus> {
        self.router
            .get()
            .map(|r| r.shard_status())
            .unwrap_or_default()
    }
}
