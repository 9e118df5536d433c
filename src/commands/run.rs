//! Continuous paper-trading loop
//!
//! Two timers drive the engine: a slow one runs full signal cycles, a fast
//! one watches the open position for stop-loss / take-profit. Ctrl+C stops
//! the loop after the in-flight step finishes.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use paper_trader::engine::{CycleReport, ExecutionEngine, TradeOutcome};
use paper_trader::error::EngineError;

use super::{block_on, open_session};

pub fn run(config_path: String) -> Result<()> {
    block_on(run_async(config_path))
}

async fn run_async(config_path: String) -> Result<()> {
    let session = open_session(&config_path)?;
    let engine = session.engine;
    let exec = &session.config.execution;

    let snapshot = engine.get_portfolio();
    info!("=== Paper Trader ===");
    info!("Symbol: {} ({})", snapshot.symbol, engine.settings().interval);
    info!(
        "Cash: {} {}  Position: {}",
        snapshot.cash_balance, snapshot.quote_currency, snapshot.position_quantity
    );
    info!(
        "Signal cycle every {}s, exit check every {}s",
        exec.trade_interval_secs, exec.price_check_interval_secs
    );

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut cycle_interval = interval(Duration::from_secs(exec.trade_interval_secs));
    let mut exit_interval = interval(Duration::from_secs(exec.price_check_interval_secs));
    cycle_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    exit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Starting trading loop...");

    loop {
        tokio::select! {
            _ = cycle_interval.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                match engine.run_cycle().await {
                    Ok(report) => log_cycle(&report),
                    Err(e) => log_failure("Cycle", &e),
                }
            }
            _ = exit_interval.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                if !engine.get_portfolio().position_quantity.is_positive() {
                    continue;
                }
                match engine.check_stop_loss_take_profit().await {
                    Ok(check) if check.triggered => {
                        if let Some(trigger) = check.trigger {
                            info!("{} fired at {}", trigger.as_str(), check.price);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log_failure("Exit check", &e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    shutdown(&engine, &session.store)
}

fn log_cycle(report: &CycleReport) {
    if let Some(exit) = report.exit.as_ref().filter(|e| e.triggered) {
        let label = exit.trigger.map(|t| t.as_str()).unwrap_or("EXIT");
        info!("Cycle @ {}: {} closed the position", report.price, label);
        return;
    }

    match &report.outcome {
        Some(TradeOutcome::Accepted(trade)) => info!(
            "Cycle @ {}: {} {} (confidence {:.2}) -> cash {}",
            report.price, trade.side, trade.quantity, report.signal.confidence, trade.resulting_balance
        ),
        Some(TradeOutcome::Rejected(rejection)) => info!(
            "Cycle @ {}: {} rejected [{}] {}",
            report.price,
            report.signal.action,
            rejection.code(),
            rejection
        ),
        None => info!("Cycle @ {}: HOLD ({})", report.price, report.signal.reason),
    }
}

fn log_failure(step: &str, err: &EngineError) {
    match err {
        EngineError::Feed(_) | EngineError::InsufficientData(_) => {
            warn!("{} skipped: {}", step, err)
        }
        _ => error!("{} failed: {}", step, err),
    }
}

fn shutdown(
    engine: &ExecutionEngine,
    store: &paper_trader::state_manager::SqliteStateManager,
) -> Result<()> {
    info!("Initiating graceful shutdown...");

    let snapshot = engine.get_portfolio();
    info!(
        "Final state: cash={} {} position={} total={}",
        snapshot.cash_balance, snapshot.quote_currency, snapshot.position_quantity, snapshot.total_value
    );

    match store.export_json() {
        Ok(Some(path)) => info!("JSON backup written to {}", path.display()),
        Ok(None) => {}
        Err(e) => warn!("JSON backup failed: {}", e),
    }

    info!("Paper trading session ended.");
    Ok(())
}
