//! Configuration management
//!
//! Loads a JSON configuration file, applies environment overrides and
//! validates the whole thing once. Every section rejects unknown keys so a
//! typo fails at startup instead of silently falling back to a default.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::engine::EngineSettings;
use crate::error::ConfigError;
use crate::exchange::API_BASE_URL;
use crate::indicators::IndicatorParams;
use crate::risk::RiskParameters;
use crate::strategy::SignalConfig;
use crate::types::{Money, Symbol};

pub const ENV_DB_PATH: &str = "PAPER_TRADER_DB_PATH";
pub const ENV_BINANCE_URL: &str = "PAPER_TRADER_BINANCE_URL";

/// Binance refuses larger kline requests
const MAX_LOOKBACK: usize = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub market: MarketConfig,
    pub portfolio: PortfolioConfig,
    pub rsi: RsiConfig,
    pub macd: MacdConfig,
    pub bollinger: BollingerConfig,
    pub confidence: ConfidenceConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config.validate().context("Invalid configuration")?;

        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var(ENV_DB_PATH) {
            self.storage.db_path = db_path;
        }
        if let Ok(url) = std::env::var(ENV_BINANCE_URL) {
            self.market.binance_url = url;
        }
    }

    pub fn indicator_params(&self) -> IndicatorParams {
        IndicatorParams {
            rsi_period: self.rsi.period,
            macd_fast: self.macd.fast_period,
            macd_slow: self.macd.slow_period,
            macd_signal: self.macd.signal_period,
            bollinger_period: self.bollinger.period,
            bollinger_std_dev: self.bollinger.num_std_dev,
        }
    }

    pub fn signal_config(&self) -> SignalConfig {
        SignalConfig {
            oversold_threshold: self.rsi.oversold_threshold,
            overbought_threshold: self.rsi.overbought_threshold,
            base_confidence: self.confidence.base,
            confidence_per_point: self.confidence.per_point,
            macd_boost: self.confidence.macd_boost,
            bollinger_boost: self.confidence.bollinger_boost,
            min_confidence: self.risk.min_confidence,
        }
    }

    pub fn risk_parameters(&self) -> RiskParameters {
        RiskParameters {
            max_position_size_pct: self.risk.max_position_size_pct,
            stop_loss_pct: self.risk.stop_loss_pct,
            take_profit_pct: self.risk.take_profit_pct,
            max_daily_trades: self.risk.max_daily_trades,
            min_confidence: self.risk.min_confidence,
            min_cash_balance: Money::new(self.risk.min_cash_balance),
            daily_profit_target_pct: self.risk.daily_profit_target_pct,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            symbol: Symbol::new(&self.market.symbol),
            interval: self.market.interval.clone(),
            lookback: self.market.lookback,
            quote_currency: self.market.quote_currency.clone(),
            starting_balance: Money::new(self.portfolio.starting_balance),
            indicators: self.indicator_params(),
            signal: self.signal_config(),
            risk: self.risk_parameters(),
        }
    }

    /// Reject values that would only fail later, deep inside a cycle
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        let market = &self.market;
        if market.symbol.trim().is_empty() {
            return Err(invalid("market.symbol", "must not be empty"));
        }
        if market.quote_currency.trim().is_empty() {
            return Err(invalid("market.quote_currency", "must not be empty"));
        }
        if market.interval.trim().is_empty() {
            return Err(invalid("market.interval", "must not be empty"));
        }

        if self.portfolio.starting_balance <= Decimal::ZERO {
            return Err(invalid("portfolio.starting_balance", "must be positive"));
        }

        let rsi = &self.rsi;
        if rsi.period == 0 {
            return Err(invalid("rsi.period", "must be at least 1"));
        }
        if !(0.0 < rsi.oversold_threshold
            && rsi.oversold_threshold < rsi.overbought_threshold
            && rsi.overbought_threshold < 100.0)
        {
            return Err(invalid(
                "rsi.oversold_threshold",
                format!(
                    "need 0 < oversold ({}) < overbought ({}) < 100",
                    rsi.oversold_threshold, rsi.overbought_threshold
                ),
            ));
        }

        let macd = &self.macd;
        if macd.fast_period == 0 || macd.signal_period == 0 {
            return Err(invalid("macd", "periods must be at least 1"));
        }
        if macd.fast_period >= macd.slow_period {
            return Err(invalid(
                "macd.fast_period",
                format!(
                    "fast ({}) must be shorter than slow ({})",
                    macd.fast_period, macd.slow_period
                ),
            ));
        }

        if self.bollinger.period < 2 {
            return Err(invalid("bollinger.period", "must be at least 2"));
        }
        if self.bollinger.num_std_dev <= 0.0 {
            return Err(invalid("bollinger.num_std_dev", "must be positive"));
        }

        let required = self.indicator_params().min_samples();
        if market.lookback < required || market.lookback > MAX_LOOKBACK {
            return Err(invalid(
                "market.lookback",
                format!(
                    "{} outside [{}, {}] required by the indicator periods",
                    market.lookback, required, MAX_LOOKBACK
                ),
            ));
        }

        let confidence = &self.confidence;
        for (field, value) in [
            ("confidence.base", confidence.base),
            ("confidence.per_point", confidence.per_point),
            ("confidence.macd_boost", confidence.macd_boost),
            ("confidence.bollinger_boost", confidence.bollinger_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{} must be in [0, 1]", value)));
            }
        }

        self.risk_parameters().validate()?;

        if self.execution.trade_interval_secs == 0 {
            return Err(invalid("execution.trade_interval_secs", "must be positive"));
        }
        if self.execution.price_check_interval_secs == 0 {
            return Err(invalid("execution.price_check_interval_secs", "must be positive"));
        }

        if self.storage.db_path.trim().is_empty() {
            return Err(invalid("storage.db_path", "must not be empty"));
        }

        Ok(())
    }
}

/// Market-data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketConfig {
    pub symbol: String,
    pub interval: String,
    /// Samples requested per cycle
    pub lookback: usize,
    /// Label used for every balance; must match the stored ledger
    pub quote_currency: String,
    pub binance_url: String,
    /// Replay candles from this CSV instead of calling Binance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_path: Option<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        MarketConfig {
            symbol: "BTCUSDC".to_string(),
            interval: "1m".to_string(),
            lookback: 100,
            quote_currency: "USDC".to_string(),
            binance_url: API_BASE_URL.to_string(),
            csv_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortfolioConfig {
    pub starting_balance: Decimal,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        PortfolioConfig {
            starting_balance: dec!(10000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RsiConfig {
    pub period: usize,
    pub oversold_threshold: f64,
    pub overbought_threshold: f64,
}

impl Default for RsiConfig {
    fn default() -> Self {
        RsiConfig {
            period: 14,
            oversold_threshold: 30.0,
            overbought_threshold: 70.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacdConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_period: usize,
}

impl Default for MacdConfig {
    fn default() -> Self {
        MacdConfig {
            fast_period: 12,
            slow_period: 26,
            signal_period: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BollingerConfig {
    pub period: usize,
    pub num_std_dev: f64,
}

impl Default for BollingerConfig {
    fn default() -> Self {
        BollingerConfig {
            period: 20,
            num_std_dev: 2.0,
        }
    }
}

/// Signal confidence shaping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceConfig {
    pub base: f64,
    pub per_point: f64,
    pub macd_boost: f64,
    pub bollinger_boost: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        let signal = SignalConfig::default();
        ConfidenceConfig {
            base: signal.base_confidence,
            per_point: signal.confidence_per_point,
            macd_boost: signal.macd_boost,
            bollinger_boost: signal.bollinger_boost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    pub max_position_size_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_daily_trades: u32,
    pub min_confidence: f64,
    pub min_cash_balance: Decimal,
    /// Daily gain that pauses discretionary trading; absent disables the pause
    #[serde(default)]
    pub daily_profit_target_pct: Option<Decimal>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let risk = RiskParameters::default();
        RiskConfig {
            max_position_size_pct: risk.max_position_size_pct,
            stop_loss_pct: risk.stop_loss_pct,
            take_profit_pct: risk.take_profit_pct,
            max_daily_trades: risk.max_daily_trades,
            min_confidence: risk.min_confidence,
            min_cash_balance: risk.min_cash_balance.inner(),
            daily_profit_target_pct: risk.daily_profit_target_pct,
        }
    }
}

/// Scheduler cadence for `run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    pub trade_interval_secs: u64,
    pub price_check_interval_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            trade_interval_secs: 30,
            price_check_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub db_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_backup_path: Option<String>,
    /// Rewrite the JSON backup after every trade
    #[serde(default)]
    pub auto_backup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: "state/paper_trader.db".to_string(),
            json_backup_path: Some("state/paper_trader.json".to_string()),
            auto_backup: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let settings = config.engine_settings();
        assert_eq!(settings.quote_currency, "USDC");
        assert_eq!(settings.risk.max_daily_trades, 50);
        assert_eq!(settings.signal.min_confidence, 0.6);
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value["risk"]["max_leverage"] = serde_json::json!(3);
        assert!(serde_json::from_value::<Config>(value).is_err());
    }

    #[test]
    fn test_missing_section_rejected() {
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value.as_object_mut().unwrap().remove("risk");
        assert!(serde_json::from_value::<Config>(value).is_err());
    }

    #[test]
    fn test_inverted_thresholds() {
        let mut config = Config::default();
        config.rsi.oversold_threshold = 80.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "rsi.oversold_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_lookback_below_indicator_minimum() {
        let mut config = Config::default();
        config.market.lookback = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "market.lookback",
                ..
            })
        ));
    }

    #[test]
    fn test_risk_fraction_out_of_range() {
        let mut config = Config::default();
        config.risk.stop_loss_pct = dec!(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_daily_profit_target() {
        let config = Config::default();
        assert_eq!(config.risk_parameters().daily_profit_target_pct, Some(dec!(0.01)));

        // Absent key disables the pause
        let mut value = serde_json::to_value(&config).unwrap();
        value["risk"].as_object_mut().unwrap().remove("daily_profit_target_pct");
        let parsed: Config = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.risk.daily_profit_target_pct, None);
        assert!(parsed.validate().is_ok());

        let mut bad = Config::default();
        bad.risk.daily_profit_target_pct = Some(dec!(-0.01));
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::Invalid {
                field: "risk.daily_profit_target_pct",
                ..
            })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.risk.max_daily_trades = 8;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.risk.max_daily_trades, 8);
    }
}
