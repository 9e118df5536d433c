//! Signal generation
//!
//! Turns an [`IndicatorSnapshot`] into a BUY/SELL/HOLD decision with a
//! confidence score. Strategies are pure: no I/O, no portfolio access.

use serde::{Deserialize, Serialize};

use crate::indicators::{BandPosition, IndicatorSnapshot};
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn side(self) -> Option<Side> {
        match self {
            SignalAction::Buy => Some(Side::Buy),
            SignalAction::Sell => Some(Side::Sell),
            SignalAction::Hold => None,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Buy => f.write_str("BUY"),
            SignalAction::Sell => f.write_str("SELL"),
            SignalAction::Hold => f.write_str("HOLD"),
        }
    }
}

/// Ephemeral trading decision; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// In [0, 1]
    pub confidence: f64,
    pub indicators: IndicatorSnapshot,
    pub reason: String,
}

impl Signal {
    pub fn hold(indicators: IndicatorSnapshot, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            indicators,
            reason: reason.into(),
        }
    }
}

/// Trading strategy trait
pub trait Strategy: Send + Sync {
    /// Label stored on trade records (`signal_type`)
    fn name(&self) -> &str;

    fn generate_signal(&self, indicators: &IndicatorSnapshot) -> Signal;
}

/// Thresholds and confidence shaping for [`RsiStrategy`]
#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub oversold_threshold: f64,
    pub overbought_threshold: f64,
    /// Confidence exactly at the threshold
    pub base_confidence: f64,
    /// Confidence added per RSI point past the threshold
    pub confidence_per_point: f64,
    /// Added when the MACD histogram agrees with the direction
    pub macd_boost: f64,
    /// Added when the Bollinger position agrees with the direction
    pub bollinger_boost: f64,
    /// Candidates below this are downgraded to HOLD
    pub min_confidence: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            oversold_threshold: 30.0,
            overbought_threshold: 70.0,
            base_confidence: 0.70,
            confidence_per_point: 0.02,
            macd_boost: 0.10,
            bollinger_boost: 0.10,
            min_confidence: 0.6,
        }
    }
}

/// RSI mean-reversion with MACD / Bollinger confirmation
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    config: SignalConfig,
}

impl RsiStrategy {
    pub fn new(config: SignalConfig) -> Self {
        RsiStrategy { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn confirmation(&self, action: SignalAction, indicators: &IndicatorSnapshot) -> f64 {
        let histogram = indicators.macd.histogram;
        let band = indicators.bollinger.position;
        let mut boost = 0.0;

        match action {
            SignalAction::Buy => {
                if histogram > 0.0 {
                    boost += self.config.macd_boost;
                }
                if matches!(band, BandPosition::BelowLower | BandPosition::LowerHalf) {
                    boost += self.config.bollinger_boost;
                }
            }
            SignalAction::Sell => {
                if histogram < 0.0 {
                    boost += self.config.macd_boost;
                }
                if matches!(band, BandPosition::AboveUpper | BandPosition::UpperHalf) {
                    boost += self.config.bollinger_boost;
                }
            }
            SignalAction::Hold => {}
        }

        boost
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "RSI"
    }

    fn generate_signal(&self, indicators: &IndicatorSnapshot) -> Signal {
        let rsi = indicators.rsi;

        let (action, distance) = if rsi < self.config.oversold_threshold {
            (SignalAction::Buy, self.config.oversold_threshold - rsi)
        } else if rsi > self.config.overbought_threshold {
            (SignalAction::Sell, rsi - self.config.overbought_threshold)
        } else {
            return Signal::hold(*indicators, format!("RSI neutral at {:.2}", rsi));
        };

        let confidence = (self.config.base_confidence
            + distance * self.config.confidence_per_point
            + self.confirmation(action, indicators))
        .clamp(0.0, 1.0);

        if confidence < self.config.min_confidence {
            return Signal::hold(
                *indicators,
                format!(
                    "{} candidate at RSI {:.2} below min confidence ({:.2} < {:.2})",
                    action, rsi, confidence, self.config.min_confidence
                ),
            );
        }

        let reason = match action {
            SignalAction::Buy => format!("RSI oversold at {:.2}", rsi),
            _ => format!("RSI overbought at {:.2}", rsi),
        };

        Signal {
            action,
            confidence,
            indicators: *indicators,
            reason,
        }
    }
}
