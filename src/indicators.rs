//! Technical indicators
//!
//! Pure functions over an ordered close-price series. The `compute_*`
//! functions return the current (latest) value and refuse to run on too
//! little history; the series helpers return one `Option` per input sample.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::IndicatorError;

fn check_period(indicator: &'static str, period: usize) -> Result<(), IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidPeriod {
            indicator,
            reason: "period must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn require(indicator: &'static str, required: usize, available: usize) -> Result<(), IndicatorError> {
    if available < required {
        return Err(IndicatorError::InsufficientData {
            indicator,
            required,
            available,
        });
    }
    Ok(())
}

/// Calculate Exponential Moving Average, seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// RSI series with Wilder smoothing. The first value appears at index `period`.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; values.len()];
    if period == 0 || values.len() < period + 1 {
        return rsi_values;
    }

    let p = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for w in values[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    rsi_values[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        rsi_values[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    rsi_values
}

/// Current RSI in [0, 100]. Needs at least `period + 1` prices.
pub fn compute_rsi(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    check_period("RSI", period)?;
    require("RSI", period + 1, prices.len())?;

    rsi(prices, period)
        .last()
        .copied()
        .flatten()
        .ok_or(IndicatorError::InsufficientData {
            indicator: "RSI",
            required: period + 1,
            available: prices.len(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

/// Current MACD. Needs at least `slow_period + signal_period` prices.
pub fn compute_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Result<MacdValue, IndicatorError> {
    check_period("MACD", fast_period)?;
    check_period("MACD", slow_period)?;
    check_period("MACD", signal_period)?;
    if fast_period >= slow_period {
        return Err(IndicatorError::InvalidPeriod {
            indicator: "MACD",
            reason: format!(
                "fast period ({}) must be shorter than slow period ({})",
                fast_period, slow_period
            ),
        });
    }
    let required = slow_period + signal_period;
    require("MACD", required, prices.len())?;

    let fast = ema(prices, fast_period);
    let slow = ema(prices, slow_period);

    let macd_line: Vec<f64> = fast
        .iter()
        .zip(slow.iter())
        .filter_map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let signal = ema(&macd_line, signal_period);

    match (macd_line.last(), signal.last().copied().flatten()) {
        (Some(&line), Some(signal_line)) => Ok(MacdValue {
            macd_line: line,
            signal_line,
            histogram: line - signal_line,
        }),
        _ => Err(IndicatorError::InsufficientData {
            indicator: "MACD",
            required,
            available: prices.len(),
        }),
    }
}

/// Where the latest price sits relative to the bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BandPosition {
    AboveUpper,
    UpperHalf,
    LowerHalf,
    BelowLower,
}

impl BandPosition {
    pub fn classify(price: f64, upper: f64, middle: f64, lower: f64) -> Self {
        if price > upper {
            BandPosition::AboveUpper
        } else if price >= middle {
            BandPosition::UpperHalf
        } else if price >= lower {
            BandPosition::LowerHalf
        } else {
            BandPosition::BelowLower
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub position: BandPosition,
}

/// Current Bollinger Bands over the last `period` prices (population std-dev).
pub fn compute_bollinger_bands(
    prices: &[f64],
    period: usize,
    num_std_dev: f64,
) -> Result<BollingerBands, IndicatorError> {
    check_period("BOLLINGER", period)?;
    require("BOLLINGER", period, prices.len())?;

    let window = &prices[prices.len() - period..];
    let middle = window.iter().mean();
    let std_dev = if period > 1 {
        window.iter().population_std_dev()
    } else {
        0.0
    };

    let upper = middle + num_std_dev * std_dev;
    let lower = middle - num_std_dev * std_dev;
    let latest = prices[prices.len() - 1];

    Ok(BollingerBands {
        upper,
        middle,
        lower,
        position: BandPosition::classify(latest, upper, middle, lower),
    })
}

/// Periods for the three indicators the strategy reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std_dev: 2.0,
        }
    }
}

impl IndicatorParams {
    /// Smallest series that satisfies every indicator
    pub fn min_samples(&self) -> usize {
        (self.rsi_period + 1)
            .max(self.macd_slow + self.macd_signal)
            .max(self.bollinger_period)
    }
}

/// Indicator readings for the latest sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub rsi: f64,
    pub macd: MacdValue,
    pub bollinger: BollingerBands,
}

impl IndicatorSnapshot {
    pub fn compute(prices: &[f64], params: &IndicatorParams) -> Result<Self, IndicatorError> {
        let rsi = compute_rsi(prices, params.rsi_period)?;
        let macd = compute_macd(prices, params.macd_fast, params.macd_slow, params.macd_signal)?;
        let bollinger =
            compute_bollinger_bands(prices, params.bollinger_period, params.bollinger_std_dev)?;
        let price = prices.last().copied().unwrap_or_default();

        Ok(Self {
            price,
            rsi,
            macd,
            bollinger,
        })
    }
}
