//! Paper-trading execution engine
//!
//! Owns the portfolio and is the only thing that mutates it. Every mutating
//! operation follows the same shape:
//!
//! 1. fetch and validate prices with no lock held
//! 2. take the writer lock, roll the trading day if needed and latch the
//!    daily profit-target pause
//! 3. run the gates against the locked state
//! 4. build the successor portfolio, commit it to storage, then swap it in
//! 5. release the lock and refresh the JSON backup
//!
//! If step 4's commit fails the in-memory state is left exactly as it was.
//! Readers go through a separate snapshot that is replaced only after a
//! successful commit, so they never observe a half-applied trade.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, EngineResult, IndicatorError, StorageError};
use crate::feed::{validate_series, PriceFeed};
use crate::indicators::{IndicatorParams, IndicatorSnapshot};
use crate::performance::{self, PerformanceSummary};
use crate::portfolio::{Portfolio, TradeRecord, QUANTITY_DP};
use crate::risk::{
    self, check_gates, exit_trigger, ExitTrigger, ProposedTrade, Rejection, RiskParameters,
    RiskReport,
};
use crate::state_manager::LedgerStore;
use crate::strategy::{RsiStrategy, Signal, SignalConfig, Strategy};
use crate::types::{closes, Candle, Money, Side, Symbol};

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for timestamps and the trading-day boundary
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// UTC calendar date
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for replaying a recorded session or stepping a
/// test across the UTC day boundary. Production runs use [`SystemClock`].
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Static inputs for one run
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub symbol: Symbol,
    pub interval: String,
    pub lookback: usize,
    pub quote_currency: String,
    pub starting_balance: Money,
    pub indicators: IndicatorParams,
    pub signal: SignalConfig,
    pub risk: RiskParameters,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let risk = RiskParameters::default();
        Self {
            symbol: Symbol::new("BTCUSDC"),
            interval: "1m".to_string(),
            lookback: 100,
            quote_currency: "USDC".to_string(),
            starting_balance: Money::from_i64(10_000),
            indicators: IndicatorParams::default(),
            signal: SignalConfig {
                min_confidence: risk.min_confidence,
                ..SignalConfig::default()
            },
            risk,
        }
    }
}

// =============================================================================
// Requests and Results
// =============================================================================

/// Input to [`ExecutionEngine::execute_trade`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub side: Side,
    /// `None`: BUY sizes to the position limit, SELL closes the position
    pub quantity: Option<Money>,
    pub confidence: f64,
    pub signal_type: String,
    pub indicator_value: Option<f64>,
}

impl TradeRequest {
    /// Operator-initiated trade; full confidence, no indicator reading
    pub fn manual(side: Side, quantity: Option<Money>) -> Self {
        Self {
            side,
            quantity,
            confidence: 1.0,
            signal_type: "MANUAL".to_string(),
            indicator_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Accepted(TradeRecord),
    Rejected(Rejection),
}

impl TradeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TradeOutcome::Accepted(_))
    }

    pub fn trade(&self) -> Option<&TradeRecord> {
        match self {
            TradeOutcome::Accepted(trade) => Some(trade),
            TradeOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            TradeOutcome::Accepted(_) => None,
            TradeOutcome::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn to_response(&self) -> TradeResponse {
        match self {
            TradeOutcome::Accepted(trade) => TradeResponse {
                accepted: true,
                reason: None,
                detail: None,
                trade_record: Some(trade.clone()),
            },
            TradeOutcome::Rejected(rejection) => TradeResponse {
                accepted: false,
                reason: Some(rejection.code().to_string()),
                detail: Some(rejection.to_string()),
                trade_record: None,
            },
        }
    }
}

/// Wire shape of a trade attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResponse {
    pub accepted: bool,
    /// Stable rejection code
    pub reason: Option<String>,
    /// Human-readable rejection message
    pub detail: Option<String>,
    pub trade_record: Option<TradeRecord>,
}

/// Result of a stop-loss / take-profit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCheck {
    pub triggered: bool,
    pub trigger: Option<ExitTrigger>,
    pub price: Money,
    pub trade_record: Option<TradeRecord>,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub price: Money,
    pub signal: Signal,
    /// Set when an exit pre-empted the signal
    pub exit: Option<ExitCheck>,
    /// `None` when the signal was HOLD and no exit fired
    pub outcome: Option<TradeOutcome>,
}

impl CycleReport {
    pub fn traded(&self) -> bool {
        self.exit.as_ref().is_some_and(|e| e.triggered)
            || self.outcome.as_ref().is_some_and(TradeOutcome::is_accepted)
    }
}

/// Read-only view of the committed portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub symbol: String,
    pub quote_currency: String,
    pub initial_balance: Money,
    pub cash_balance: Money,
    pub position_quantity: Money,
    pub position_entry_price: Option<Money>,
    pub stop_loss_price: Option<Money>,
    pub take_profit_price: Option<Money>,
    /// Last observed price; entry price when nothing has been fetched yet
    pub mark_price: Option<Money>,
    pub position_value: Money,
    pub total_value: Money,
    pub daily_trade_count: u32,
    pub max_daily_trades: u32,
    pub daily_reset_date: NaiveDate,
    pub day_start_value: Money,
    pub trading_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub consistent: bool,
    pub trades_replayed: usize,
    pub recorded_cash: Money,
    pub replayed_cash: Option<Money>,
    pub recorded_position: Money,
    pub replayed_position: Option<Money>,
    pub error: Option<String>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct ExecutionEngine {
    settings: EngineSettings,
    strategy: Box<dyn Strategy>,
    feed: Arc<dyn PriceFeed>,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    /// Single writer
    ledger: Mutex<Portfolio>,
    /// Last committed state, for readers
    committed: RwLock<Portfolio>,
    mark_price: RwLock<Option<Money>>,
}

impl ExecutionEngine {
    /// Load the stored portfolio, creating it on first run
    pub fn open(
        settings: EngineSettings,
        feed: Arc<dyn PriceFeed>,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let portfolio = match store.load_portfolio()? {
            Some(existing) => {
                if existing.quote_currency != settings.quote_currency {
                    return Err(ConfigError::CurrencyMismatch {
                        stored: existing.quote_currency,
                        configured: settings.quote_currency.clone(),
                    }
                    .into());
                }
                info!(
                    "Recovered portfolio: cash={} {} position={} trades_today={}",
                    existing.cash_balance,
                    existing.quote_currency,
                    existing.position_quantity,
                    existing.daily_trade_count
                );
                existing
            }
            None => {
                let fresh = Portfolio::new(
                    settings.starting_balance,
                    settings.quote_currency.clone(),
                    clock.today(),
                );
                store.save_portfolio(&fresh)?;
                info!(
                    "Created portfolio with {} {}",
                    fresh.cash_balance, fresh.quote_currency
                );
                fresh
            }
        };

        let strategy = Box::new(RsiStrategy::new(settings.signal.clone()));

        Ok(Self {
            settings,
            strategy,
            feed,
            store,
            clock,
            ledger: Mutex::new(portfolio.clone()),
            committed: RwLock::new(portfolio),
            mark_price: RwLock::new(None),
        })
    }

    /// Swap in a different signal policy
    pub fn with_strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn committed(&self) -> Portfolio {
        self.committed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, portfolio: &Portfolio) {
        *self.committed.write().unwrap_or_else(|e| e.into_inner()) = portfolio.clone();
    }

    fn last_mark(&self) -> Option<Money> {
        *self.mark_price.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_mark(&self, price: Money) {
        *self.mark_price.write().unwrap_or_else(|e| e.into_inner()) = Some(price);
    }

    // -------------------------------------------------------------------------
    // Price staging (no lock held)
    // -------------------------------------------------------------------------

    async fn fetch_series(&self, lookback: usize) -> EngineResult<Vec<Candle>> {
        let candles = self
            .feed
            .get_price_series(&self.settings.symbol, &self.settings.interval, lookback)
            .await?;
        validate_series(&candles)?;
        if let Some(last) = candles.last() {
            self.set_mark(last.close);
        }
        Ok(candles)
    }

    async fn fetch_price(&self) -> EngineResult<Money> {
        let candles = self.fetch_series(1).await?;
        // validate_series has already refused an empty series
        Ok(candles.last().map(|c| c.close).unwrap_or_default())
    }

    /// Fetch the latest price and remember it as the mark
    pub async fn refresh_price(&self) -> EngineResult<Money> {
        self.fetch_price().await
    }

    // -------------------------------------------------------------------------
    // Locked helpers
    // -------------------------------------------------------------------------

    /// Roll the trading day and latch the profit-target pause. Either change
    /// is persisted before the gates run.
    fn refresh_day(&self, ledger: &mut Portfolio, price: Money) -> Result<(), StorageError> {
        let mut next = ledger.clone();
        let rolled = next.roll_day(self.clock.today(), price);
        let gain = next.daily_return(price);
        let latched = !next.trading_paused && self.settings.risk.daily_target_reached(gain);
        if latched {
            next.trading_paused = true;
        }
        if !(rolled || latched) {
            return Ok(());
        }

        self.store.save_portfolio(&next)?;
        if rolled {
            info!(
                "New trading day {}: daily trade count reset (was {}), day starts at {} {}",
                next.daily_reset_date,
                ledger.daily_trade_count,
                next.day_start_value,
                next.quote_currency
            );
        }
        if latched {
            info!(
                "Daily profit target reached ({:.2}% since {} {}): discretionary trading paused until next UTC day",
                gain.map(|g| Money::new(g).to_f64() * 100.0).unwrap_or_default(),
                next.day_start_value,
                next.quote_currency
            );
        }
        *ledger = next;
        self.publish(ledger);
        Ok(())
    }

    /// Refresh the store's backup copy. Runs after the writer lock is released.
    async fn backup(&self) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.backup()).await {
            Ok(Ok(Some(path))) => debug!("Backup written to {}", path.display()),
            Ok(Ok(None)) => {}
            // The trade is already durable
            Ok(Err(e)) => warn!("JSON backup failed: {}", e),
            Err(e) => warn!("JSON backup task failed: {}", e),
        }
    }

    fn resolve_quantity(&self, ledger: &Portfolio, request: &TradeRequest, price: Money) -> Money {
        match (request.side, request.quantity) {
            (_, Some(quantity)) => quantity.truncate_dp(QUANTITY_DP),
            (Side::Buy, None) => self
                .settings
                .risk
                .max_notional(ledger.total_value(price))
                .checked_div(price)
                .unwrap_or(Money::ZERO)
                .truncate_dp(QUANTITY_DP),
            (Side::Sell, None) => ledger.position_quantity,
        }
    }

    fn execute_locked(
        &self,
        ledger: &mut Portfolio,
        request: &TradeRequest,
        price: Money,
        forced: bool,
    ) -> EngineResult<TradeOutcome> {
        let proposed = ProposedTrade {
            side: request.side,
            quantity: self.resolve_quantity(ledger, request, price),
            price,
            confidence: request.confidence,
            forced,
        };

        let notional = match check_gates(&self.settings.risk, ledger, &proposed) {
            Ok(notional) => notional,
            Err(rejection) => {
                warn!(
                    "Trade rejected [{}]: {} {} @ {}: {}",
                    rejection.code(),
                    proposed.side,
                    proposed.quantity,
                    price,
                    rejection
                );
                return Ok(TradeOutcome::Rejected(rejection));
            }
        };

        let next = match ledger.apply_fill(proposed.side, proposed.quantity, price) {
            Ok(next) => next,
            Err(rejection) => return Ok(TradeOutcome::Rejected(rejection)),
        };

        let trade = TradeRecord {
            trade_id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            side: proposed.side,
            quantity: proposed.quantity,
            price,
            total_value: notional,
            signal_type: request.signal_type.clone(),
            indicator_value_at_trade: request.indicator_value,
            resulting_balance: next.cash_balance,
        };

        if let Err(e) = self.store.commit_trade(&next, &trade) {
            error!("Storage commit failed, trade {} discarded: {}", trade.trade_id, e);
            return Err(e.into());
        }

        *ledger = next;
        self.publish(ledger);

        info!(
            "Executed {} {} {} @ {} ({}) | cash {} {} | trades today {}",
            trade.side,
            trade.quantity,
            self.settings.symbol,
            price,
            trade.signal_type,
            ledger.cash_balance,
            ledger.quote_currency,
            ledger.daily_trade_count
        );

        Ok(TradeOutcome::Accepted(trade))
    }

    fn check_exit_locked(&self, ledger: &mut Portfolio, price: Money) -> EngineResult<ExitCheck> {
        let not_triggered = ExitCheck {
            triggered: false,
            trigger: None,
            price,
            trade_record: None,
        };

        let Some(entry) = ledger.position_entry_price.filter(|_| ledger.has_position()) else {
            return Ok(not_triggered);
        };
        let Some(trigger) = exit_trigger(&self.settings.risk, entry, price) else {
            debug!("No exit at {} (entry {})", price, entry);
            return Ok(not_triggered);
        };

        info!("{} triggered at {} (entry {})", trigger, price, entry);

        let request = TradeRequest {
            side: Side::Sell,
            quantity: None,
            confidence: 1.0,
            signal_type: trigger.as_str().to_string(),
            indicator_value: None,
        };

        match self.execute_locked(ledger, &request, price, true)? {
            TradeOutcome::Accepted(trade) => Ok(ExitCheck {
                triggered: true,
                trigger: Some(trigger),
                price,
                trade_record: Some(trade),
            }),
            TradeOutcome::Rejected(rejection) => {
                warn!("{} exit could not execute: {}", trigger, rejection);
                Ok(ExitCheck {
                    trigger: Some(trigger),
                    ..not_triggered
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exposed operations
    // -------------------------------------------------------------------------

    pub fn get_portfolio(&self) -> PortfolioSnapshot {
        let portfolio = self.committed();
        let risk = &self.settings.risk;
        let entry = portfolio
            .position_entry_price
            .filter(|_| portfolio.has_position());
        let mark = self.last_mark().or(entry);
        let position_value = mark
            .map(|price| portfolio.position_value(price))
            .unwrap_or(Money::ZERO);

        PortfolioSnapshot {
            symbol: self.settings.symbol.to_string(),
            quote_currency: portfolio.quote_currency.clone(),
            initial_balance: portfolio.initial_balance,
            cash_balance: portfolio.cash_balance,
            position_quantity: portfolio.position_quantity,
            position_entry_price: entry,
            stop_loss_price: entry.map(|e| risk.stop_loss_price(e)),
            take_profit_price: entry.map(|e| risk.take_profit_price(e)),
            mark_price: mark,
            position_value,
            total_value: portfolio.cash_balance + position_value,
            daily_trade_count: portfolio.daily_trade_count,
            max_daily_trades: risk.max_daily_trades,
            daily_reset_date: portfolio.daily_reset_date,
            day_start_value: portfolio.day_start_value,
            trading_paused: portfolio.trading_paused,
        }
    }

    /// Exposure, concentration and daily profit status at the last mark
    pub fn get_risk_report(&self) -> RiskReport {
        let portfolio = self.committed();
        // Flat and never priced: only cash counts, so any price will do
        let mark = self
            .last_mark()
            .or(portfolio.position_entry_price.filter(|_| portfolio.has_position()))
            .unwrap_or(Money::ZERO);
        risk::assess(&self.settings.risk, &portfolio, mark)
    }

    /// The single mutating entry point for discretionary trades
    pub async fn execute_trade(&self, request: TradeRequest) -> EngineResult<TradeOutcome> {
        let price = self.fetch_price().await?;

        let outcome = {
            let mut ledger = self.ledger.lock().await;
            self.refresh_day(&mut ledger, price)?;
            self.execute_locked(&mut ledger, &request, price, false)?
        };
        if outcome.is_accepted() {
            self.backup().await;
        }
        Ok(outcome)
    }

    /// Force-close the position if the latest price crossed an exit level
    pub async fn check_stop_loss_take_profit(&self) -> EngineResult<ExitCheck> {
        let price = self.fetch_price().await?;

        let check = {
            let mut ledger = self.ledger.lock().await;
            self.refresh_day(&mut ledger, price)?;
            self.check_exit_locked(&mut ledger, price)?
        };
        if check.triggered {
            self.backup().await;
        }
        Ok(check)
    }

    /// One full evaluate / gate / execute pass
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let started_at = self.clock.now();
        let candles = self.fetch_series(self.settings.lookback).await?;

        let required = self.settings.indicators.min_samples();
        if candles.len() < required {
            return Err(IndicatorError::InsufficientData {
                indicator: "PRICE_SERIES",
                required,
                available: candles.len(),
            }
            .into());
        }

        let prices = closes(&candles);
        let indicators = IndicatorSnapshot::compute(&prices, &self.settings.indicators)?;
        let signal = self.strategy.generate_signal(&indicators);
        let price = candles.last().map(|c| c.close).unwrap_or_default();

        info!(
            "Cycle: price={} RSI={:.2} MACD hist={:.4} BB={:?} -> {} ({:.2})",
            price,
            indicators.rsi,
            indicators.macd.histogram,
            indicators.bollinger.position,
            signal.action,
            signal.confidence
        );

        let (exit, outcome) = {
            let mut ledger = self.ledger.lock().await;
            self.refresh_day(&mut ledger, price)?;

            let exit = self.check_exit_locked(&mut ledger, price)?;
            if exit.triggered {
                (Some(exit), None)
            } else {
                let outcome = match signal.action.side() {
                    Some(side) => {
                        let request = TradeRequest {
                            side,
                            quantity: None,
                            confidence: signal.confidence,
                            signal_type: self.strategy.name().to_string(),
                            indicator_value: Some(indicators.rsi),
                        };
                        Some(self.execute_locked(&mut ledger, &request, price, false)?)
                    }
                    None => {
                        debug!("HOLD: {}", signal.reason);
                        None
                    }
                };
                (None, outcome)
            }
        };

        let report = CycleReport {
            started_at,
            price,
            signal,
            exit,
            outcome,
        };
        if report.traded() {
            self.backup().await;
        }
        Ok(report)
    }

    /// Newest first
    pub fn get_trade_history(&self, limit: Option<usize>) -> EngineResult<Vec<TradeRecord>> {
        Ok(self.store.load_trades(limit)?)
    }

    /// Replay the trade log against the recent price history
    pub async fn get_performance_summary(&self) -> EngineResult<PerformanceSummary> {
        let candles = self.fetch_series(self.settings.lookback).await?;
        let trades = self.store.trade_log()?;
        let portfolio = self.committed();
        let mark = candles.last().map(|c| c.close);

        Ok(performance::summarize(
            portfolio.initial_balance,
            &trades,
            &candles,
            mark,
        ))
    }

    /// Rebuild the portfolio from the trade log and compare with the stored one
    pub fn audit(&self) -> EngineResult<AuditReport> {
        let portfolio = self.committed();
        let trades = self.store.trade_log()?;

        let report = match Portfolio::replay(
            portfolio.initial_balance,
            &portfolio.quote_currency,
            portfolio.daily_reset_date,
            &trades,
        ) {
            Ok(replayed) => AuditReport {
                consistent: replayed.cash_balance == portfolio.cash_balance
                    && replayed.position_quantity == portfolio.position_quantity,
                trades_replayed: trades.len(),
                recorded_cash: portfolio.cash_balance,
                replayed_cash: Some(replayed.cash_balance),
                recorded_position: portfolio.position_quantity,
                replayed_position: Some(replayed.position_quantity),
                error: None,
            },
            Err(e) => AuditReport {
                consistent: false,
                trades_replayed: trades.len(),
                recorded_cash: portfolio.cash_balance,
                replayed_cash: None,
                recorded_position: portfolio.position_quantity,
                replayed_position: None,
                error: Some(e.to_string()),
            },
        };

        if report.consistent {
            info!("Audit passed: {} trades replay to the stored portfolio", report.trades_replayed);
        } else {
            error!("Audit FAILED: {:?}", report);
        }
        Ok(report)
    }
}
