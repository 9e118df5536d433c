//! Core data types used across the paper-trading engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for a single price sample
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: Money, low: Money },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(Money),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: Money, low: Money, high: Money },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: Money, low: Money, high: Money },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: Money,
        high: Money,
        low: Money,
        close: Money,
    },
}

/// One OHLCV observation from the market-data collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: Money,
    pub high: Money,
    pub low: Money,
    pub close: Money,
    pub volume: Money,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: Money,
        high: Money,
        low: Money,
        close: Money,
        volume: Money,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Candle where every price equals `price` (ticker snapshots, tests)
    pub fn flat(datetime: DateTime<Utc>, price: Money) -> Self {
        Self {
            datetime,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Money::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if !self.open.is_positive()
            || !self.high.is_positive()
            || !self.low.is_positive()
            || !self.close.is_positive()
        {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume.is_negative() {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Closing prices as f64 for indicator math
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close.to_f64()).collect()
}

/// Trading pair symbol using Arc<str> for cheap cloning
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side '{}', expected BUY or SELL", other)),
        }
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// Exact decimal amount for balances, prices and quantities.
///
/// Wraps `rust_decimal::Decimal` so that balances replayed across thousands of
/// trades reproduce the stored ledger to the last digit. Indicator math stays
/// in f64; anything that touches the ledger goes through `Money`.
///
/// # Example
/// ```
/// use paper_trader::Money;
/// use rust_decimal_macros::dec;
/// let price = Money::new(dec!(100.50));
/// let qty = Money::new(dec!(2));
/// assert_eq!(price * qty, Money::new(dec!(201.00)));
/// ```
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub const ONE: Money = Money(Decimal::ONE);

    pub const fn new(value: Decimal) -> Self {
        Money(value)
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    /// Convert to f64 (indicator inputs, percentages, logging)
    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    /// Round half-even to `dp` decimal places
    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    /// Truncate toward zero to `dp` decimal places
    pub fn truncate_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp_with_strategy(dp, RoundingStrategy::ToZero))
    }

    /// Division that refuses a zero divisor instead of inventing a value
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        self.0.checked_div(rhs.0).map(Money)
    }

    /// `None` when the product does not fit in 96 bits
    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        self.0.checked_mul(rhs.0).map(Money)
    }

    /// Multiply by a plain decimal factor (percentages, ratios)
    pub fn scale(self, factor: Decimal) -> Self {
        Money(self.0 * factor)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.normalize(), f)
    }
}

impl std::str::FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str_exact(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .map(Money)
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money::from_i64(value)
    }
}

// Equality is numeric, so 1.0 == 1.00
impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.normalize().hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod money_tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_precision() {
        // 0.1 + 0.2 != 0.3 in f64
        let a: Money = "0.1".parse().unwrap();
        let b: Money = "0.2".parse().unwrap();
        let c: Money = "0.3".parse().unwrap();
        assert_eq!(a + b, c);
    }

    #[test]
    fn test_no_drift_over_many_trades() {
        let mut cash = Money::new(dec!(10000));
        let fill = Money::new(dec!(0.1));
        for _ in 0..10_000 {
            cash -= fill;
        }
        for _ in 0..10_000 {
            cash += fill;
        }
        assert_eq!(cash, Money::new(dec!(10000)));
    }

    #[test]
    fn test_truncate_never_rounds_up() {
        let qty = Money::new(dec!(0.123456789));
        assert_eq!(qty.truncate_dp(8), Money::new(dec!(0.12345678)));
    }

    #[test]
    fn test_checked_div_by_zero() {
        assert!(Money::ONE.checked_div(Money::ZERO).is_none());
        assert_eq!(
            Money::new(dec!(800)).checked_div(Money::new(dec!(50000))),
            Some(Money::new(dec!(0.016)))
        );
    }

    #[test]
    fn test_money_serde_as_string() {
        let money = Money::new(dec!(123.456));
        let json = serde_json::to_string(&money).unwrap();
        assert_eq!(json, "\"123.456\"");
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, parsed);
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn test_candle_validation() {
        let now = Utc::now();
        let ok = Candle::new(
            now,
            Money::new(dec!(100)),
            Money::new(dec!(110)),
            Money::new(dec!(95)),
            Money::new(dec!(105)),
            Money::new(dec!(1)),
        );
        assert!(ok.is_ok());

        let bad = Candle::new(
            now,
            Money::new(dec!(100)),
            Money::new(dec!(90)),
            Money::new(dec!(95)),
            Money::new(dec!(92)),
            Money::new(dec!(1)),
        );
        assert!(matches!(
            bad,
            Err(CandleValidationError::HighLessThanLow { .. })
        ));

        let zero = Candle::flat(now, Money::ZERO);
        assert!(!zero.is_valid());
    }
}
