//! Subcommand implementations

pub mod ledger;
pub mod run;

use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use paper_trader::engine::{ExecutionEngine, SystemClock};
use paper_trader::exchange::BinanceFeed;
use paper_trader::feed::{CsvPriceFeed, PriceFeed};
use paper_trader::state_manager::SqliteStateManager;
use paper_trader::Config;

/// Everything a command needs: validated config, storage and the engine
pub struct Session {
    pub config: Config,
    pub store: Arc<SqliteStateManager>,
    pub engine: ExecutionEngine,
}

pub fn open_session(config_path: &str) -> Result<Session> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);

    let feed: Arc<dyn PriceFeed> = match &config.market.csv_path {
        Some(path) => {
            info!("Price source: CSV {}", path);
            Arc::new(CsvPriceFeed::new(path))
        }
        None => {
            info!("Price source: {}", config.market.binance_url);
            Arc::new(BinanceFeed::new(config.market.binance_url.clone()))
        }
    };

    let store = Arc::new(
        SqliteStateManager::new(
            config.storage.db_path.as_str(),
            config.storage.json_backup_path.as_deref(),
            config.storage.auto_backup,
        )
        .with_context(|| format!("Failed to open ledger at {}", config.storage.db_path))?,
    );

    let engine = ExecutionEngine::open(
        config.engine_settings(),
        feed,
        store.clone(),
        Arc::new(SystemClock),
    )
    .context("Failed to open portfolio")?;

    Ok(Session {
        config,
        store,
        engine,
    })
}

pub fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(future)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
