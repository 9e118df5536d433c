//! Risk gates and forced exits
//!
//! Every proposed trade passes through the gates below, in order:
//!
//! ```text
//! a. daily trade count      (skipped for forced exits)
//!    daily profit target    (skipped for forced exits)
//! b. signal confidence      (skipped for forced exits)
//!    quantity must be positive and quantity x price representable
//!    (a SELL with nothing held reports c instead)
//! c. cash / held position
//! d. notional vs. max_position_size_pct x total value  (BUY only, skipped for forced exits)
//! ```
//!
//! The first failing gate wins. A failure is a [`Rejection`] value, never an
//! error: the caller gets a normal result and the portfolio is untouched.
//!
//! [`assess`] produces the read-only [`RiskReport`]: exposure, concentration
//! and the daily profit status.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::portfolio::Portfolio;
use crate::types::{Money, Side};

/// Read-only limits for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParameters {
    /// Fraction of total account value a single BUY may commit
    pub max_position_size_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_daily_trades: u32,
    pub min_confidence: f64,
    /// BUYs are refused while cash sits below this floor
    pub min_cash_balance: Money,
    /// Daily gain (fraction of the day-start value) that pauses discretionary
    /// trading until the next UTC day. `None` disables the pause.
    pub daily_profit_target_pct: Option<Decimal>,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_position_size_pct: dec!(0.08),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.04),
            max_daily_trades: 50,
            min_confidence: 0.6,
            min_cash_balance: Money::from_i64(100),
            daily_profit_target_pct: Some(dec!(0.01)),
        }
    }
}

impl RiskParameters {
    /// Set position size as a fraction (e.g., 0.08 = 8%)
    pub fn with_max_position_size_pct(mut self, pct: Decimal) -> Self {
        self.max_position_size_pct = pct;
        self
    }

    /// Set stop-loss and take-profit distances from entry
    pub fn with_exit_levels(mut self, stop_loss_pct: Decimal, take_profit_pct: Decimal) -> Self {
        self.stop_loss_pct = stop_loss_pct;
        self.take_profit_pct = take_profit_pct;
        self
    }

    pub fn with_max_daily_trades(mut self, max: u32) -> Self {
        self.max_daily_trades = max;
        self
    }

    pub fn with_min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = min;
        self
    }

    pub fn with_min_cash_balance(mut self, floor: Money) -> Self {
        self.min_cash_balance = floor;
        self
    }

    pub fn with_daily_profit_target(mut self, pct: Option<Decimal>) -> Self {
        self.daily_profit_target_pct = pct;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn fraction(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} must be in (0, 1]", value),
                });
            }
            Ok(())
        }

        fraction("risk.max_position_size_pct", self.max_position_size_pct)?;
        fraction("risk.stop_loss_pct", self.stop_loss_pct)?;
        fraction("risk.take_profit_pct", self.take_profit_pct)?;
        if let Some(target) = self.daily_profit_target_pct {
            fraction("risk.daily_profit_target_pct", target)?;
        }

        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid {
                field: "risk.min_confidence",
                reason: format!("{} must be in [0, 1]", self.min_confidence),
            });
        }
        if self.min_cash_balance.is_negative() {
            return Err(ConfigError::Invalid {
                field: "risk.min_cash_balance",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn stop_loss_price(&self, entry: Money) -> Money {
        entry.scale(Decimal::ONE - self.stop_loss_pct)
    }

    pub fn take_profit_price(&self, entry: Money) -> Money {
        entry.scale(Decimal::ONE + self.take_profit_pct)
    }

    /// Largest BUY notional allowed against `total_value`
    pub fn max_notional(&self, total_value: Money) -> Money {
        total_value.scale(self.max_position_size_pct)
    }

    /// Whether `daily_return` meets the configured profit target
    pub fn daily_target_reached(&self, daily_return: Option<Decimal>) -> bool {
        match (self.daily_profit_target_pct, daily_return) {
            (Some(target), Some(gain)) => gain >= target,
            _ => false,
        }
    }
}

/// Why a trade was not accepted
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    DailyLimitExceeded {
        count: u32,
        max: u32,
    },
    DailyTargetReached {
        /// Gain since day start as a fraction, if it could be measured
        gain: Option<Decimal>,
        target: Option<Decimal>,
    },
    LowConfidence {
        confidence: f64,
        min: f64,
    },
    InsufficientBalance {
        required: Money,
        available: Money,
        floor: Money,
        currency: String,
    },
    NoPositionToSell {
        requested: Money,
        held: Money,
    },
    PositionSizeExceeded {
        notional: Money,
        limit: Money,
    },
    InvalidQuantity {
        quantity: Money,
    },
}

impl Rejection {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::DailyLimitExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
            Rejection::DailyTargetReached { .. } => "DAILY_TARGET_REACHED",
            Rejection::LowConfidence { .. } => "LOW_CONFIDENCE",
            Rejection::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Rejection::NoPositionToSell { .. } => "NO_POSITION_TO_SELL",
            Rejection::PositionSizeExceeded { .. } => "POSITION_SIZE_EXCEEDED",
            Rejection::InvalidQuantity { .. } => "INVALID_QUANTITY",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::DailyLimitExceeded { count, max } => {
                write!(f, "daily trade limit reached ({}/{})", count, max)
            }
            Rejection::DailyTargetReached { gain, target } => {
                write!(f, "daily profit target reached")?;
                if let (Some(gain), Some(target)) = (gain, target) {
                    write!(
                        f,
                        " ({}% >= {}%)",
                        (gain * dec!(100)).round_dp(2).normalize(),
                        (target * dec!(100)).normalize()
                    )?;
                }
                write!(f, ", trading paused until the next UTC day")
            }
            Rejection::LowConfidence { confidence, min } => {
                write!(f, "confidence {:.2} below minimum {:.2}", confidence, min)
            }
            Rejection::InsufficientBalance {
                required,
                available,
                floor,
                currency,
            } => write!(
                f,
                "insufficient {c} balance: have {}, need {} (floor {} {c})",
                available,
                required,
                floor,
                c = currency
            ),
            Rejection::NoPositionToSell { requested, held } => {
                write!(f, "cannot sell {}: holding {}", requested, held)
            }
            Rejection::PositionSizeExceeded { notional, limit } => {
                write!(f, "notional {} exceeds position limit {}", notional, limit)
            }
            Rejection::InvalidQuantity { quantity } => {
                write!(f, "quantity {} must be positive and within range", quantity)
            }
        }
    }
}

/// Which exit level a price crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl ExitTrigger {
    /// `signal_type` written on the forced SELL
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::StopLoss => "STOP_LOSS",
            ExitTrigger::TakeProfit => "TAKE_PROFIT",
        }
    }
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop-loss wins when both levels are crossed at once
pub fn exit_trigger(params: &RiskParameters, entry: Money, price: Money) -> Option<ExitTrigger> {
    if price <= params.stop_loss_price(entry) {
        Some(ExitTrigger::StopLoss)
    } else if price >= params.take_profit_price(entry) {
        Some(ExitTrigger::TakeProfit)
    } else {
        None
    }
}

/// A sized trade waiting on the gates
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTrade {
    pub side: Side,
    pub quantity: Money,
    pub price: Money,
    pub confidence: f64,
    /// Stop-loss / take-profit exits skip gates a, b and d
    pub forced: bool,
}

impl ProposedTrade {
    /// `None` when quantity x price overflows
    pub fn notional(&self) -> Option<Money> {
        self.quantity.checked_mul(self.price)
    }
}

/// Run the gates against the current portfolio. On success returns the
/// trade's notional.
pub fn check_gates(
    params: &RiskParameters,
    portfolio: &Portfolio,
    trade: &ProposedTrade,
) -> Result<Money, Rejection> {
    if !trade.forced {
        if portfolio.daily_trade_count >= params.max_daily_trades {
            return Err(Rejection::DailyLimitExceeded {
                count: portfolio.daily_trade_count,
                max: params.max_daily_trades,
            });
        }
        let gain = portfolio.daily_return(trade.price);
        if portfolio.trading_paused || params.daily_target_reached(gain) {
            return Err(Rejection::DailyTargetReached {
                gain,
                target: params.daily_profit_target_pct,
            });
        }
        if trade.confidence < params.min_confidence {
            return Err(Rejection::LowConfidence {
                confidence: trade.confidence,
                min: params.min_confidence,
            });
        }
    }

    if trade.side == Side::Sell && !portfolio.has_position() {
        return Err(Rejection::NoPositionToSell {
            requested: trade.quantity,
            held: portfolio.position_quantity,
        });
    }
    if !trade.quantity.is_positive() {
        return Err(Rejection::InvalidQuantity {
            quantity: trade.quantity,
        });
    }

    let notional = trade.notional().ok_or(Rejection::InvalidQuantity {
        quantity: trade.quantity,
    })?;
    match trade.side {
        Side::Buy => {
            if portfolio.cash_balance < notional
                || portfolio.cash_balance < params.min_cash_balance
            {
                return Err(Rejection::InsufficientBalance {
                    required: notional,
                    available: portfolio.cash_balance,
                    floor: params.min_cash_balance,
                    currency: portfolio.quote_currency.clone(),
                });
            }
        }
        Side::Sell => {
            if portfolio.position_quantity < trade.quantity {
                return Err(Rejection::NoPositionToSell {
                    requested: trade.quantity,
                    held: portfolio.position_quantity,
                });
            }
        }
    }

    if !trade.forced && trade.side == Side::Buy {
        let limit = params.max_notional(portfolio.total_value(trade.price));
        if notional > limit {
            return Err(Rejection::PositionSizeExceeded { notional, limit });
        }
    }

    Ok(notional)
}

/// Risk asset weight above which concentration is flagged
pub const MAX_CONCENTRATION: f64 = 0.5;
/// Cost-basis exposure above which the portfolio is flagged
pub const MAX_EXPOSURE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskStatus {
    Acceptable,
    High,
}

/// Where the day stands against the profit target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyProfitStatus {
    pub date: NaiveDate,
    pub day_start_value: Money,
    pub current_value: Money,
    pub daily_profit: Money,
    /// Percent, e.g. 1.25 for +1.25%
    pub daily_profit_pct: f64,
    pub target_pct: Option<f64>,
    pub target_reached: bool,
    pub trading_enabled: bool,
}

/// Read-only portfolio risk snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub risk_status: RiskStatus,
    pub mark_price: Money,
    pub total_value: Money,
    /// Share of total value held in the asset, at the mark
    pub asset_weight: f64,
    pub cash_weight: f64,
    pub concentration_risk: f64,
    /// Position cost basis over total value
    pub exposure_ratio: f64,
    pub alerts: Vec<String>,
    pub max_concentration: f64,
    pub max_exposure: f64,
    pub daily: DailyProfitStatus,
}

fn ratio(numerator: Money, denominator: Money) -> f64 {
    numerator.checked_div(denominator).map(Money::to_f64).unwrap_or(0.0)
}

/// Measure `portfolio` at `price`
pub fn assess(params: &RiskParameters, portfolio: &Portfolio, price: Money) -> RiskReport {
    let total_value = portfolio.total_value(price);
    let asset_weight = ratio(portfolio.position_value(price), total_value);
    let cash_weight = ratio(portfolio.cash_balance, total_value);
    let cost_basis = portfolio
        .position_entry_price
        .and_then(|entry| entry.checked_mul(portfolio.position_quantity))
        .unwrap_or(Money::ZERO);
    let exposure_ratio = ratio(cost_basis, total_value);

    let mut risk_status = RiskStatus::Acceptable;
    let mut alerts = Vec::new();
    if asset_weight > MAX_CONCENTRATION {
        risk_status = RiskStatus::High;
        alerts.push(format!(
            "High concentration risk: {:.1}% in a single asset",
            asset_weight * 100.0
        ));
    }
    if exposure_ratio > MAX_EXPOSURE {
        risk_status = RiskStatus::High;
        alerts.push(format!("High exposure: {:.1}% of portfolio", exposure_ratio * 100.0));
    }

    let gain = portfolio.daily_return(price);
    let target_reached = params.daily_target_reached(gain);
    let daily = DailyProfitStatus {
        date: portfolio.daily_reset_date,
        day_start_value: portfolio.day_start_value,
        current_value: total_value,
        daily_profit: total_value - portfolio.day_start_value,
        daily_profit_pct: gain.map(|g| Money::new(g).to_f64() * 100.0).unwrap_or(0.0),
        target_pct: params
            .daily_profit_target_pct
            .map(|t| Money::new(t).to_f64() * 100.0),
        target_reached,
        trading_enabled: !(portfolio.trading_paused || target_reached),
    };

    RiskReport {
        risk_status,
        mark_price: price,
        total_value,
        asset_weight,
        cash_weight,
        concentration_risk: asset_weight,
        exposure_ratio,
        alerts,
        max_concentration: MAX_CONCENTRATION,
        max_exposure: MAX_EXPOSURE,
        daily,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn portfolio(cash: Decimal) -> Portfolio {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        Portfolio::new(Money::new(cash), "USDC", day)
    }

    fn buy(quantity: Decimal, price: Decimal, confidence: f64) -> ProposedTrade {
        ProposedTrade {
            side: Side::Buy,
            quantity: Money::new(quantity),
            price: Money::new(price),
            confidence,
            forced: false,
        }
    }

    #[test]
    fn test_default_builder() {
        let params = RiskParameters::default()
            .with_max_position_size_pct(dec!(0.1))
            .with_max_daily_trades(8)
            .with_min_confidence(0.7);
        assert_eq!(params.max_position_size_pct, dec!(0.1));
        assert_eq!(params.max_daily_trades, 8);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let params = RiskParameters::default().with_max_position_size_pct(dec!(1.5));
        assert!(matches!(
            params.validate(),
            Err(ConfigError::Invalid {
                field: "risk.max_position_size_pct",
                ..
            })
        ));
    }

    #[test]
    fn test_exit_levels() {
        let params = RiskParameters::default();
        let entry = Money::new(dec!(50000));
        assert_eq!(params.stop_loss_price(entry), Money::new(dec!(49000)));
        assert_eq!(params.take_profit_price(entry), Money::new(dec!(52000)));

        assert_eq!(
            exit_trigger(&params, entry, Money::new(dec!(49000))),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(
            exit_trigger(&params, entry, Money::new(dec!(52000.01))),
            Some(ExitTrigger::TakeProfit)
        );
        assert_eq!(exit_trigger(&params, entry, Money::new(dec!(50500))), None);
    }

    #[test]
    fn test_gate_order_balance_before_size() {
        let params = RiskParameters::default().with_min_cash_balance(Money::ZERO);
        let p = portfolio(dec!(50));
        let rejection = check_gates(&params, &p, &buy(dec!(0.016), dec!(50000), 0.9)).unwrap_err();
        assert_eq!(rejection.code(), "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn test_daily_limit_first() {
        let params = RiskParameters::default().with_max_daily_trades(8);
        let mut p = portfolio(dec!(10000));
        p.daily_trade_count = 8;
        // Also low confidence: the daily gate still reports first
        let rejection = check_gates(&params, &p, &buy(dec!(0.001), dec!(50000), 0.1)).unwrap_err();
        assert_eq!(rejection.code(), "DAILY_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_low_confidence() {
        let params = RiskParameters::default().with_min_confidence(0.7);
        let p = portfolio(dec!(10000));
        let rejection = check_gates(&params, &p, &buy(dec!(0.001), dec!(50000), 0.65)).unwrap_err();
        assert_eq!(rejection.code(), "LOW_CONFIDENCE");
    }

    #[test]
    fn test_min_cash_floor() {
        let params = RiskParameters::default()
            .with_max_position_size_pct(Decimal::ONE)
            .with_min_cash_balance(Money::from_i64(100));
        let p = portfolio(dec!(90));
        let rejection = check_gates(&params, &p, &buy(dec!(0.0001), dec!(50000), 0.9)).unwrap_err();
        assert!(matches!(rejection, Rejection::InsufficientBalance { .. }));
        assert!(rejection.to_string().contains("USDC"));
    }

    #[test]
    fn test_position_size_exceeded() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        // 801 > 8% of 10000
        let rejection =
            check_gates(&params, &p, &buy(dec!(0.01602), dec!(50000), 0.9)).unwrap_err();
        assert_eq!(rejection.code(), "POSITION_SIZE_EXCEEDED");
        assert!(check_gates(&params, &p, &buy(dec!(0.016), dec!(50000), 0.9)).is_ok());
    }

    #[test]
    fn test_sell_without_position() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        let trade = ProposedTrade {
            side: Side::Sell,
            quantity: Money::new(dec!(0.5)),
            price: Money::new(dec!(50000)),
            confidence: 0.9,
            forced: false,
        };
        assert_eq!(
            check_gates(&params, &p, &trade).unwrap_err().code(),
            "NO_POSITION_TO_SELL"
        );
    }

    #[test]
    fn test_forced_exit_bypasses_daily_and_confidence() {
        let params = RiskParameters::default().with_max_daily_trades(1);
        let mut p = portfolio(dec!(1000));
        p.position_quantity = Money::new(dec!(0.1));
        p.position_entry_price = Some(Money::new(dec!(50000)));
        p.daily_trade_count = 5;

        let exit = ProposedTrade {
            side: Side::Sell,
            quantity: Money::new(dec!(0.1)),
            price: Money::new(dec!(48000)),
            confidence: 0.0,
            forced: true,
        };
        assert!(check_gates(&params, &p, &exit).is_ok());
    }

    #[test]
    fn test_daily_target_pauses_discretionary_trades() {
        let params = RiskParameters::default().with_daily_profit_target(Some(dec!(0.01)));
        let mut p = portfolio(dec!(9000));
        p.day_start_value = Money::new(dec!(10000));
        p.position_quantity = Money::new(dec!(0.02));
        p.position_entry_price = Some(Money::new(dec!(50000)));

        // 9000 + 0.02 x 55500 = 10110, +1.1%
        let rejection = check_gates(&params, &p, &buy(dec!(0.001), dec!(55500), 0.9)).unwrap_err();
        assert_eq!(rejection.code(), "DAILY_TARGET_REACHED");
        assert!(rejection.to_string().contains("1.1%"));

        // +0.5%
        assert!(check_gates(&params, &p, &buy(dec!(0.001), dec!(52500), 0.9)).is_ok());

        // Latched pause holds even after the gain fades
        p.trading_paused = true;
        assert_eq!(
            check_gates(&params, &p, &buy(dec!(0.001), dec!(52500), 0.9))
                .unwrap_err()
                .code(),
            "DAILY_TARGET_REACHED"
        );

        let exit = ProposedTrade {
            side: Side::Sell,
            quantity: Money::new(dec!(0.02)),
            price: Money::new(dec!(55500)),
            confidence: 0.0,
            forced: true,
        };
        assert!(check_gates(&params, &p, &exit).is_ok());

        let disabled = params.with_daily_profit_target(None);
        p.trading_paused = false;
        assert!(check_gates(&disabled, &p, &buy(dec!(0.001), dec!(55500), 0.9)).is_ok());
    }

    #[test]
    fn test_overflowing_notional_invalid() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        let huge: Money = "100000000000000000000000000".parse().unwrap();
        let trade = ProposedTrade {
            side: Side::Buy,
            quantity: huge,
            price: Money::new(dec!(50000)),
            confidence: 0.9,
            forced: false,
        };
        assert_eq!(trade.notional(), None);
        assert_eq!(check_gates(&params, &p, &trade).unwrap_err().code(), "INVALID_QUANTITY");
    }

    #[test]
    fn test_gates_return_notional() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        assert_eq!(
            check_gates(&params, &p, &buy(dec!(0.01), dec!(50000), 0.9)),
            Ok(Money::new(dec!(500)))
        );
    }

    #[test]
    fn test_assess_flat_portfolio() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        let report = assess(&params, &p, Money::new(dec!(50000)));
        assert_eq!(report.risk_status, RiskStatus::Acceptable);
        assert!(report.alerts.is_empty());
        assert_eq!(report.asset_weight, 0.0);
        assert_eq!(report.cash_weight, 1.0);
        assert_eq!(report.exposure_ratio, 0.0);
        assert!(report.daily.trading_enabled);
        assert_relative_eq!(report.daily.target_pct.unwrap(), 1.0);
    }

    #[test]
    fn test_assess_concentrated_portfolio() {
        let params = RiskParameters::default();
        let mut p = portfolio(dec!(1000));
        p.day_start_value = Money::new(dec!(10000));
        p.position_quantity = Money::new(dec!(0.18));
        p.position_entry_price = Some(Money::new(dec!(50000)));

        let report = assess(&params, &p, Money::new(dec!(50000)));
        assert_eq!(report.risk_status, RiskStatus::High);
        assert_eq!(report.alerts.len(), 2);
        assert_relative_eq!(report.asset_weight, 0.9);
        assert_relative_eq!(report.exposure_ratio, 0.9);
        assert_relative_eq!(report.cash_weight, 0.1);
        assert!(!report.daily.target_reached);

        // +2% on the day
        let up = assess(&params, &p, Money::new(dec!(51111.12)));
        assert!(up.daily.target_reached);
        assert!(!up.daily.trading_enabled);
        assert!(up.daily.daily_profit.is_positive());
    }

    #[test]
    fn test_zero_quantity_invalid() {
        let params = RiskParameters::default();
        let p = portfolio(dec!(10000));
        assert_eq!(
            check_gates(&params, &p, &buy(dec!(0), dec!(50000), 0.9))
                .unwrap_err()
                .code(),
            "INVALID_QUANTITY"
        );
    }
}
