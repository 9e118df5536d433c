//! One-shot commands against the stored ledger
//!
//! Each command opens the engine, does one thing, prints JSON to stdout and
//! exits. Logs go to stderr and the log file.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

use paper_trader::engine::TradeRequest;
use paper_trader::{Money, Side};

use super::{block_on, open_session, print_json};

/// Single signal cycle: exits first, then indicators and the gated trade
pub fn cycle(config_path: String) -> Result<()> {
    block_on(async move {
        let session = open_session(&config_path)?;
        let report = session.engine.run_cycle().await?;

        print_json(&json!({
            "started_at": report.started_at,
            "price": report.price,
            "signal": report.signal,
            "exit": report.exit,
            "trade": report.outcome.as_ref().map(|o| o.to_response()),
            "traded": report.traded(),
        }))
    })
}

pub fn status(config_path: String, refresh: bool) -> Result<()> {
    block_on(async move {
        let session = open_session(&config_path)?;
        if refresh {
            let price = session.engine.refresh_price().await?;
            info!("Mark price: {}", price);
        }
        print_json(&session.engine.get_portfolio())
    })
}

pub fn risk(config_path: String, refresh: bool) -> Result<()> {
    block_on(async move {
        let session = open_session(&config_path)?;
        if refresh {
            session.engine.refresh_price().await?;
        }
        let report = session.engine.get_risk_report();
        for alert in &report.alerts {
            warn!("{}", alert);
        }
        if !report.daily.trading_enabled {
            info!("Daily profit target reached; discretionary trading paused");
        }
        print_json(&report)
    })
}

pub fn trade(config_path: String, side: String, quantity: Option<String>) -> Result<()> {
    let side: Side = side.parse().map_err(anyhow::Error::msg)?;
    let quantity = quantity
        .map(|q| q.parse::<Money>().with_context(|| format!("Invalid quantity: {}", q)))
        .transpose()?;

    block_on(async move {
        let session = open_session(&config_path)?;
        let outcome = session
            .engine
            .execute_trade(TradeRequest::manual(side, quantity))
            .await?;

        match outcome.rejection() {
            Some(rejection) => info!("Trade rejected: {}", rejection),
            None => info!("Trade accepted"),
        }
        print_json(&outcome.to_response())
    })
}

pub fn history(config_path: String, limit: Option<usize>) -> Result<()> {
    let session = open_session(&config_path)?;
    let trades = session.engine.get_trade_history(limit)?;
    info!("{} trade(s)", trades.len());
    print_json(&trades)
}

pub fn performance(config_path: String) -> Result<()> {
    block_on(async move {
        let session = open_session(&config_path)?;
        print_json(&session.engine.get_performance_summary().await?)
    })
}

pub fn check_exits(config_path: String) -> Result<()> {
    block_on(async move {
        let session = open_session(&config_path)?;
        print_json(&session.engine.check_stop_loss_take_profit().await?)
    })
}

/// Replay the trade log and compare with the stored balances
pub fn audit(config_path: String) -> Result<()> {
    let session = open_session(&config_path)?;
    let report = session.engine.audit()?;
    print_json(&report)?;

    if !report.consistent {
        bail!(
            "Ledger audit failed: {}",
            report.error.as_deref().unwrap_or("balances differ from replay")
        );
    }
    Ok(())
}

pub fn export(config_path: String, output: Option<PathBuf>) -> Result<()> {
    let session = open_session(&config_path)?;

    let written = match output {
        Some(path) => {
            session.store.export_json_to(&path)?;
            Some(path)
        }
        None => session.store.export_json()?,
    };

    match written {
        Some(path) => {
            info!("Exported ledger to {}", path.display());
            Ok(())
        }
        None => bail!("No output path given and storage.json_backup_path is not set"),
    }
}
