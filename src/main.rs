//! campex - points market daemon
//!
//! Loads configuration, wires the exchange, and runs until interrupted:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Exchange │───▶│  Router  │───▶│  Engine  │
//! │  (YAML)  │    │  (wire)  │    │ (shards) │    │ (match)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! The HTTP gateway, bot, and admin panels are separate processes that
//! consume this crate's service APIs.

use anyhow::Context;
use campex::config::{AppConfig, MarketConfig};
use campex::exchange::Exchange;
use campex::logging::init_logging;
use std::path::PathBuf;

struct CliArgs {
    app_config: Option<PathBuf>,
    market_config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut out = CliArgs {
        app_config: None,
        market_config: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                out.app_config = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ));
            }
            "--market" => {
                out.market_config = Some(PathBuf::from(
                    args.next().context("--market requires a path")?,
                ));
            }
            "--help" | "-h" => {
                println!("usage: campex [--config app.yaml] [--market market.yaml]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let app_cfg = match &args.app_config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading app config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    let market_cfg = match &args.market_config {
        Some(path) => MarketConfig::load(path)
            .with_context(|| format!("loading market config from {}", path.display()))?,
        None => MarketConfig::default(),
    };

    let _log_guard = init_logging(&app_cfg);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        shards = app_cfg.shard_count,
        "campex starting"
    );

    let exchange = Exchange::new(app_cfg, market_cfg)?;
    exchange.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    exchange.stop().await;
    Ok(())
}
