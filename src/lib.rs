//! Paper Trader
//!
//! A simulated spot-trading engine for a single symbol: RSI/MACD/Bollinger
//! indicators feed a signal generator, and an execution engine applies
//! risk gates before settling fills against a SQLite-backed virtual ledger.

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod indicators;
pub mod performance;
pub mod portfolio;
pub mod risk;
pub mod state_manager;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use engine::{ExecutionEngine, TradeOutcome, TradeRequest};
pub use error::{EngineError, EngineResult};
pub use portfolio::{Portfolio, TradeRecord};
pub use risk::{Rejection, RiskParameters, RiskReport, RiskStatus};
pub use types::*;
