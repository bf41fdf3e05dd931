//! campex - points-and-equity trading kernel
//!
//! A trading and accounting core for a programming-camp points market:
//! one virtual stock, integer points, a continuous price-time-priority
//! order book with a price band, escrowed settlement, and a sharded
//! router that serialises per-user operations.
//!
//! # Modules
//!
//! - [`core_types`] - fundamental type aliases (UserId, Points, ...)
//! - [`config`] - process and market configuration
//! - [`errors`] - the closed error taxonomy
//! - [`models`] - orders and trades
//! - [`balance`] - enforced per-user balance type
//! - [`journal`] - append-only audit log
//! - [`ledger`] - the balance core service (sole mutation path)
//! - [`holdings`] - share inventory with average cost
//! - [`escrow`] - reserve/complete/cancel lifecycle
//! - [`orderbook`] - BTreeMap price-time order book
//! - [`engine`] - continuous matching and call auction
//! - [`ipo`] - primary-issue allocator
//! - [`lifecycle`] - order entry: validate, reserve, match, settle
//! - [`transfer`] - P2P transfers with fees and retry
//! - [`router`] - sharded per-user serialisation
//! - [`events`] - topic pub/sub with retry and replay
//! - [`clock`] - market open/close state
//! - [`auditor`] - integrity scans
//! - [`notify`] - outbound best-effort notifications
//! - [`admin`] - operator actions
//! - [`api`] - read-only market queries
//! - [`exchange`] - composition root with start/stop

// Core types - must be first!
pub mod core_types;

// Configuration & infrastructure
pub mod config;
pub mod errors;
pub mod logging;

// Accounting kernel
pub mod balance;
pub mod escrow;
pub mod holdings;
pub mod journal;
pub mod ledger;

// Trading kernel
pub mod engine;
pub mod ipo;
pub mod lifecycle;
pub mod models;
pub mod orderbook;

// Services
pub mod admin;
pub mod api;
pub mod auditor;
pub mod clock;
pub mod events;
pub mod notify;
pub mod router;
pub mod transfer;

// Composition root
pub mod exchange;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use config::{AppConfig, FeePolicy, MarketConfig, OverflowPolicy, TradingWindow};
pub use core_types::{EscrowId, OrderId, Points, Price, Qty, TradeId, TsMillis, UserId};
pub use engine::{MatchingEngine, PriceBand};
pub use errors::CoreError;
pub use escrow::{Escrow, EscrowKind, EscrowManager, EscrowStatus};
pub use events::{Event, EventBus, EventHandler, Topic};
pub use exchange::Exchange;
pub use holdings::HoldingsBook;
pub use ipo::IpoService;
pub use journal::{EntryKind, Journal, JournalEntry};
pub use ledger::{Ledger, UserSnapshot};
pub use lifecycle::{CancelAck, OrderAck, OrderLifecycle};
pub use models::{CancelReason, Order, OrderStatus, OrderType, Side, Trade};
pub use orderbook::{DepthSnapshot, OrderBook};
pub use router::ShardedRouter;
pub use transfer::{TransferAck, TransferService};
