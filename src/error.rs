//! Error taxonomy
//!
//! Gate rejections are *not* errors; they are [`crate::risk::Rejection`]
//! values carried inside a successful [`crate::engine::TradeOutcome`].
//! Everything in this module aborts the current cycle without touching the
//! portfolio.

use thiserror::Error;

use crate::types::CandleValidationError;

/// Indicator requested before enough history exists, or with nonsense parameters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data for {indicator}: need {required} samples, have {available}")]
    InsufficientData {
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    #[error("invalid period for {indicator}: {reason}")]
    InvalidPeriod {
        indicator: &'static str,
        reason: String,
    },
}

/// Upstream price series that cannot be trusted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedPriceData {
    #[error("price feed returned an empty series")]
    Empty,

    #[error("price series is not strictly increasing in time at index {index}")]
    NonMonotonic { index: usize },

    #[error("invalid candle at index {index}: {source}")]
    InvalidCandle {
        index: usize,
        #[source]
        source: CandleValidationError,
    },

    #[error("unparseable field '{field}' in price data: {value}")]
    Unparseable { field: &'static str, value: String },
}

/// Failure talking to the market-data collaborator
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("price feed request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("price feed returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read price data: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read CSV price data: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Malformed(#[from] MalformedPriceData),
}

/// Durable write or read failed
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("corrupt value in column '{column}': {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("failed to write backup: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize backup: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration that fails validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("ledger is denominated in {stored} but configuration says {configured}")]
    CurrencyMismatch { stored: String, configured: String },
}

/// Anything that aborts an engine operation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InsufficientData(#[from] IndicatorError),

    #[error("malformed price data: {0}")]
    MalformedPriceData(#[from] MalformedPriceData),

    #[error(transparent)]
    Feed(FeedError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<FeedError> for EngineError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Malformed(m) => EngineError::MalformedPriceData(m),
            other => EngineError::Feed(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
