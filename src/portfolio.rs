//! Portfolio state and the append-only trade record
//!
//! [`Portfolio`] is a plain value. Fills produce a *new* portfolio instead of
//! mutating in place so the engine can persist the successor before it
//! replaces the current state.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::risk::Rejection;
use crate::types::{Money, Side};

/// Decimal places kept on asset quantities
pub const QUANTITY_DP: u32 = 8;

/// The single simulated account: quote-currency cash plus one asset position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Starting balance, kept for return and replay calculations
    pub initial_balance: Money,
    pub cash_balance: Money,
    pub position_quantity: Money,
    /// `None` while flat
    pub position_entry_price: Option<Money>,
    pub daily_trade_count: u32,
    pub daily_reset_date: NaiveDate,
    pub quote_currency: String,
    /// Total value marked at the first priced operation of the UTC day
    pub day_start_value: Money,
    /// Latched once the daily profit target is hit; cleared by [`Portfolio::roll_day`]
    #[serde(default)]
    pub trading_paused: bool,
}

impl Portfolio {
    pub fn new(starting_balance: Money, quote_currency: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            initial_balance: starting_balance,
            cash_balance: starting_balance,
            position_quantity: Money::ZERO,
            position_entry_price: None,
            daily_trade_count: 0,
            daily_reset_date: today,
            quote_currency: quote_currency.into(),
            day_start_value: starting_balance,
            trading_paused: false,
        }
    }

    pub fn has_position(&self) -> bool {
        self.position_quantity.is_positive()
    }

    pub fn position_value(&self, price: Money) -> Money {
        self.position_quantity * price
    }

    /// cash + quantity x price
    pub fn total_value(&self, price: Money) -> Money {
        self.cash_balance + self.position_value(price)
    }

    /// Start a new trading day when the calendar day has changed: the trade
    /// counter resets, the pause lifts and the day-start value is re-marked at
    /// `price`. Returns `true` if anything changed.
    pub fn roll_day(&mut self, today: NaiveDate, price: Money) -> bool {
        if self.daily_reset_date == today {
            return false;
        }
        self.daily_trade_count = 0;
        self.daily_reset_date = today;
        self.day_start_value = self.total_value(price);
        self.trading_paused = false;
        true
    }

    /// Fractional change in total value since the day started
    pub fn daily_return(&self, price: Money) -> Option<Decimal> {
        if !self.day_start_value.is_positive() {
            return None;
        }
        (self.total_value(price) - self.day_start_value)
            .inner()
            .checked_div(self.day_start_value.inner())
    }

    /// Successor state after a fill. The daily counter is incremented here so
    /// the count and the balances always move together.
    pub fn apply_fill(&self, side: Side, quantity: Money, price: Money) -> Result<Portfolio, Rejection> {
        let mut next = self.settle(side, quantity, price)?;
        next.daily_trade_count += 1;
        Ok(next)
    }

    fn settle(&self, side: Side, quantity: Money, price: Money) -> Result<Portfolio, Rejection> {
        if !quantity.is_positive() {
            return Err(Rejection::InvalidQuantity { quantity });
        }

        let notional = quantity
            .checked_mul(price)
            .ok_or(Rejection::InvalidQuantity { quantity })?;
        let mut next = self.clone();

        match side {
            Side::Buy => {
                if notional > self.cash_balance {
                    return Err(Rejection::InsufficientBalance {
                        required: notional,
                        available: self.cash_balance,
                        floor: Money::ZERO,
                        currency: self.quote_currency.clone(),
                    });
                }
                let held_cost = match self.position_entry_price {
                    Some(entry) => entry
                        .checked_mul(self.position_quantity)
                        .ok_or(Rejection::InvalidQuantity { quantity })?,
                    None => Money::ZERO,
                };
                let new_quantity = self.position_quantity + quantity;

                next.cash_balance = self.cash_balance - notional;
                next.position_quantity = new_quantity;
                next.position_entry_price = (held_cost + notional).checked_div(new_quantity);
            }
            Side::Sell => {
                if quantity > self.position_quantity {
                    return Err(Rejection::NoPositionToSell {
                        requested: quantity,
                        held: self.position_quantity,
                    });
                }
                next.cash_balance = self.cash_balance + notional;
                next.position_quantity = self.position_quantity - quantity;
                if next.position_quantity.is_zero() {
                    next.position_entry_price = None;
                }
            }
        }

        Ok(next)
    }

    /// Rebuild cash and position by replaying `trades` (oldest first) from a
    /// fresh account. Daily counters are not reconstructed.
    pub fn replay<'a, I>(
        initial_balance: Money,
        quote_currency: &str,
        today: NaiveDate,
        trades: I,
    ) -> Result<Portfolio, ReplayError>
    where
        I: IntoIterator<Item = &'a TradeRecord>,
    {
        let mut portfolio = Portfolio::new(initial_balance, quote_currency, today);
        for trade in trades {
            portfolio = portfolio
                .settle(trade.side, trade.quantity, trade.price)
                .map_err(|rejection| ReplayError::Rejected {
                    trade_id: trade.trade_id.clone(),
                    rejection,
                })?;
            if portfolio.cash_balance != trade.resulting_balance {
                return Err(ReplayError::BalanceMismatch {
                    trade_id: trade.trade_id.clone(),
                    recorded: trade.resulting_balance,
                    replayed: portfolio.cash_balance,
                });
            }
        }
        Ok(portfolio)
    }
}

/// A logged trade that cannot be replayed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("trade {trade_id} does not replay: {rejection}")]
    Rejected { trade_id: String, rejection: Rejection },

    #[error("trade {trade_id} recorded balance {recorded}, replay gives {replayed}")]
    BalanceMismatch {
        trade_id: String,
        recorded: Money,
        replayed: Money,
    },
}

impl ReplayError {
    pub fn trade_id(&self) -> &str {
        match self {
            ReplayError::Rejected { trade_id, .. } | ReplayError::BalanceMismatch { trade_id, .. } => {
                trade_id
            }
        }
    }
}

/// Immutable record of one accepted trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub quantity: Money,
    pub price: Money,
    /// quantity x price
    pub total_value: Money,
    pub signal_type: String,
    /// RSI (or other driving indicator) reading when the trade was made
    pub indicator_value_at_trade: Option<f64>,
    /// Cash balance right after this trade
    pub resulting_balance: Money,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn record(id: &str, side: Side, qty: Money, price: Money, after: &Portfolio) -> TradeRecord {
        TradeRecord {
            trade_id: id.to_string(),
            timestamp: Utc::now(),
            side,
            quantity: qty,
            price,
            total_value: qty * price,
            signal_type: "RSI".to_string(),
            indicator_value_at_trade: Some(20.0),
            resulting_balance: after.cash_balance,
        }
    }

    #[test]
    fn test_buy_then_sell() {
        let p = Portfolio::new(Money::new(dec!(10000)), "USDC", day());
        let qty = Money::new(dec!(0.016));
        let bought = p.apply_fill(Side::Buy, qty, Money::new(dec!(50000))).unwrap();

        assert_eq!(bought.cash_balance, Money::new(dec!(9200)));
        assert_eq!(bought.position_quantity, qty);
        assert_eq!(bought.position_entry_price, Some(Money::new(dec!(50000))));
        assert_eq!(bought.daily_trade_count, 1);
        // Receiver is untouched
        assert_eq!(p.cash_balance, Money::new(dec!(10000)));

        let sold = bought.apply_fill(Side::Sell, qty, Money::new(dec!(51000))).unwrap();
        assert_eq!(sold.cash_balance, Money::new(dec!(10016)));
        assert!(sold.position_quantity.is_zero());
        assert_eq!(sold.position_entry_price, None);
        assert_eq!(sold.daily_trade_count, 2);
    }

    #[test]
    fn test_weighted_entry_price() {
        let p = Portfolio::new(Money::new(dec!(10000)), "USDC", day());
        let p = p.apply_fill(Side::Buy, Money::ONE, Money::new(dec!(100))).unwrap();
        let p = p.apply_fill(Side::Buy, Money::new(dec!(3)), Money::new(dec!(200))).unwrap();
        // (100 + 600) / 4
        assert_eq!(p.position_entry_price, Some(Money::new(dec!(175))));
    }

    #[test]
    fn test_cannot_go_negative() {
        let p = Portfolio::new(Money::new(dec!(50)), "USDC", day());
        assert!(matches!(
            p.apply_fill(Side::Buy, Money::ONE, Money::new(dec!(800))),
            Err(Rejection::InsufficientBalance { .. })
        ));
        assert!(matches!(
            p.apply_fill(Side::Sell, Money::ONE, Money::new(dec!(800))),
            Err(Rejection::NoPositionToSell { .. })
        ));
    }

    #[test]
    fn test_roll_day() {
        let mut p = Portfolio::new(Money::new(dec!(100)), "USDC", day());
        p.daily_trade_count = 7;
        p.trading_paused = true;
        assert!(!p.roll_day(day(), Money::new(dec!(10))));
        assert_eq!(p.daily_trade_count, 7);
        assert!(p.trading_paused);

        p.cash_balance = Money::new(dec!(80));
        p.position_quantity = Money::new(dec!(3));
        let tomorrow = day().succ_opt().unwrap();
        assert!(p.roll_day(tomorrow, Money::new(dec!(10))));
        assert_eq!(p.daily_trade_count, 0);
        assert_eq!(p.daily_reset_date, tomorrow);
        assert_eq!(p.day_start_value, Money::new(dec!(110)));
        assert!(!p.trading_paused);
    }

    #[test]
    fn test_daily_return() {
        let mut p = Portfolio::new(Money::new(dec!(1000)), "USDC", day());
        assert_eq!(p.daily_return(Money::new(dec!(5))), Some(Decimal::ZERO));

        p.cash_balance = Money::new(dec!(900));
        p.position_quantity = Money::ONE;
        assert_eq!(p.daily_return(Money::new(dec!(115))), Some(dec!(0.015)));
        assert_eq!(p.daily_return(Money::new(dec!(90))), Some(dec!(-0.01)));
    }

    #[test]
    fn test_overflowing_fill_rejected() {
        let p = Portfolio::new(Money::new(dec!(10000)), "USDC", day());
        let huge: Money = "100000000000000000000000000".parse().unwrap();
        assert!(matches!(
            p.apply_fill(Side::Buy, huge, Money::new(dec!(50000))),
            Err(Rejection::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_total_value() {
        let mut p = Portfolio::new(Money::new(dec!(9200)), "USDC", day());
        p.position_quantity = Money::new(dec!(0.016));
        assert_eq!(p.total_value(Money::new(dec!(50000))), Money::new(dec!(10000)));
    }

    #[test]
    fn test_replay_reproduces_state() {
        let start = Portfolio::new(Money::new(dec!(10000)), "USDC", day());
        let mut current = start.clone();
        let mut log = Vec::new();

        let fills = [
            (Side::Buy, dec!(0.01), dec!(50000)),
            (Side::Buy, dec!(0.005), dec!(48000)),
            (Side::Sell, dec!(0.012), dec!(51000.5)),
            (Side::Buy, dec!(0.00333333), dec!(49999.99)),
        ];
        for (i, (side, qty, price)) in fills.iter().enumerate() {
            current = current
                .apply_fill(*side, Money::new(*qty), Money::new(*price))
                .unwrap();
            log.push(record(&i.to_string(), *side, Money::new(*qty), Money::new(*price), &current));
        }

        let replayed = Portfolio::replay(start.initial_balance, "USDC", day(), &log).unwrap();
        assert_eq!(replayed.cash_balance, current.cash_balance);
        assert_eq!(replayed.position_quantity, current.position_quantity);
        assert_eq!(replayed.position_entry_price, current.position_entry_price);
    }

    #[test]
    fn test_replay_detects_tampering() {
        let start = Portfolio::new(Money::new(dec!(1000)), "USDC", day());
        let after = start
            .apply_fill(Side::Buy, Money::ONE, Money::new(dec!(100)))
            .unwrap();
        let mut trade = record("t1", Side::Buy, Money::ONE, Money::new(dec!(100)), &after);
        trade.resulting_balance = Money::new(dec!(901));

        let err = Portfolio::replay(start.initial_balance, "USDC", day(), [&trade]).unwrap_err();
        assert_eq!(err.trade_id(), "t1");
        assert!(matches!(err, ReplayError::BalanceMismatch { .. }));
    }
}
