//! Price-series sources
//!
//! The engine only sees the [`PriceFeed`] trait. Whatever a feed returns is
//! run through [`validate_series`] before any indicator touches it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{FeedError, MalformedPriceData};
use crate::types::{Candle, Money, Symbol};

/// Market-data collaborator
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Up to `lookback` samples for `symbol`, oldest first
    async fn get_price_series(
        &self,
        symbol: &Symbol,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, FeedError>;
}

/// Reject empty, out-of-order or internally inconsistent series
pub fn validate_series(candles: &[Candle]) -> Result<(), MalformedPriceData> {
    if candles.is_empty() {
        return Err(MalformedPriceData::Empty);
    }

    for (index, candle) in candles.iter().enumerate() {
        candle
            .validate()
            .map_err(|source| MalformedPriceData::InvalidCandle { index, source })?;

        if index > 0 && candle.datetime <= candles[index - 1].datetime {
            return Err(MalformedPriceData::NonMonotonic { index });
        }
    }

    Ok(())
}

fn tail(candles: &[Candle], lookback: usize) -> Vec<Candle> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].to_vec()
}

// =============================================================================
// In-Memory Feed
// =============================================================================

/// Feed backed by a series held in memory; replace or extend it between calls
#[derive(Debug, Default)]
pub struct StaticPriceFeed {
    candles: RwLock<Vec<Candle>>,
}

impl StaticPriceFeed {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles: RwLock::new(candles),
        }
    }

    /// One flat candle per close, spaced a minute apart
    pub fn from_closes(start: DateTime<Utc>, closes: &[Money]) -> Self {
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle::flat(start + Duration::minutes(i as i64), close))
            .collect();
        Self::new(candles)
    }

    pub fn set_series(&self, candles: Vec<Candle>) {
        let mut guard = self.candles.write().unwrap_or_else(|e| e.into_inner());
        *guard = candles;
    }

    /// Append a flat candle one minute after the last one
    pub fn push_price(&self, price: Money) {
        let mut guard = self.candles.write().unwrap_or_else(|e| e.into_inner());
        let next = guard
            .last()
            .map(|c| c.datetime + Duration::minutes(1))
            .unwrap_or_else(Utc::now);
        guard.push(Candle::flat(next, price));
    }

    pub fn len(&self) -> usize {
        self.candles.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn get_price_series(
        &self,
        _symbol: &Symbol,
        _interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let guard = self.candles.read().unwrap_or_else(|e| e.into_inner());
        Ok(tail(&guard, lookback))
    }
}

// =============================================================================
// CSV Feed
// =============================================================================

fn parse_field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    field: &'static str,
) -> Result<T, MalformedPriceData> {
    let raw = record.get(index).unwrap_or("");
    raw.trim()
        .parse::<T>()
        .map_err(|_| MalformedPriceData::Unparseable {
            field,
            value: raw.to_string(),
        })
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, MalformedPriceData> {
    let raw = raw.trim();
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Try parsing without timezone and assume UTC
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .or_else(|_| {
            raw.parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or(())
        })
        .map_err(|_| MalformedPriceData::Unparseable {
            field: "datetime",
            value: raw.to_string(),
        })
}

/// Read OHLCV rows (`datetime,open,high,low,close,volume` with header)
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>, FeedError> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut candles = Vec::new();

    for result in reader.records() {
        let record = result?;
        let datetime = parse_datetime(record.get(0).unwrap_or(""))?;

        candles.push(Candle {
            datetime,
            open: parse_field::<Money>(&record, 1, "open")?,
            high: parse_field::<Money>(&record, 2, "high")?,
            low: parse_field::<Money>(&record, 3, "low")?,
            close: parse_field::<Money>(&record, 4, "close")?,
            volume: parse_field::<Money>(&record, 5, "volume")?,
        });
    }

    debug!("Parsed {} candles from {}", candles.len(), path.as_ref().display());
    Ok(candles)
}

/// Replays a CSV file; each call returns the last `lookback` rows
pub struct CsvPriceFeed {
    path: PathBuf,
}

impl CsvPriceFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PriceFeed for CsvPriceFeed {
    async fn get_price_series(
        &self,
        symbol: &Symbol,
        _interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let path = self.path.clone();
        let candles = tokio::task::spawn_blocking(move || load_csv(path))
            .await
            .map_err(|e| FeedError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        info!("Loaded {} candles for {} from CSV", candles.len(), symbol);
        Ok(tail(&candles, lookback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_validate_series() {
        let feed = StaticPriceFeed::from_closes(start(), &[Money::from_i64(1), Money::from_i64(2)]);
        let candles = feed.candles.read().unwrap().clone();
        assert!(validate_series(&candles).is_ok());

        assert_eq!(validate_series(&[]), Err(MalformedPriceData::Empty));

        let mut reversed = candles.clone();
        reversed.reverse();
        assert_eq!(
            validate_series(&reversed),
            Err(MalformedPriceData::NonMonotonic { index: 1 })
        );

        let mut duplicate = candles.clone();
        duplicate[1].datetime = duplicate[0].datetime;
        assert!(validate_series(&duplicate).is_err());

        let mut bad = candles;
        bad[1].close = Money::ZERO;
        assert!(matches!(
            validate_series(&bad),
            Err(MalformedPriceData::InvalidCandle { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_static_feed_lookback() {
        let closes: Vec<Money> = (1..=10).map(Money::from_i64).collect();
        let feed = StaticPriceFeed::from_closes(start(), &closes);
        let symbol = Symbol::new("BTCUSDC");

        let series = feed.get_price_series(&symbol, "1m", 3).await.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[2].close, Money::from_i64(10));

        feed.push_price(Money::new(dec!(10.5)));
        let series = feed.get_price_series(&symbol, "1m", 100).await.unwrap();
        assert_eq!(series.len(), 11);
        assert!(validate_series(&series).is_ok());
    }

    #[tokio::test]
    async fn test_csv_feed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datetime,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-03-01 00:00:00,100,101,99,100.5,12").unwrap();
        writeln!(file, "2024-03-01T00:01:00Z,100.5,102,100,101.25,8").unwrap();
        writeln!(file, "1709251320000,101.25,101.5,100.75,101,3").unwrap();
        file.flush().unwrap();

        let feed = CsvPriceFeed::new(file.path());
        let series = feed
            .get_price_series(&Symbol::new("BTCUSDC"), "1m", 100)
            .await
            .unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[1].close, Money::new(dec!(101.25)));
        assert!(validate_series(&series).is_ok());
    }

    #[test]
    fn test_csv_unparseable_price() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "datetime,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-03-01 00:00:00,abc,101,99,100,1").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_csv(file.path()),
            Err(FeedError::Malformed(MalformedPriceData::Unparseable { field: "open", .. }))
        ));
    }
}
