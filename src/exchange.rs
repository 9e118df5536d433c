//! Binance public market-data client
//!
//! Read-only: fetches klines for the indicator engine. No keys, no orders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{FeedError, MalformedPriceData};
use crate::feed::PriceFeed;
use crate::types::{Candle, Money, Symbol};

pub const API_BASE_URL: &str = "https://api.binance.com";

/// Binance caps a single klines request at 1000 rows
const MAX_KLINES: usize = 1000;

#[derive(Debug, Clone)]
pub struct BinanceFeed {
    base_url: String,
    client: reqwest::Client,
}

impl Default for BinanceFeed {
    fn default() -> Self {
        Self::new(API_BASE_URL)
    }
}

impl BinanceFeed {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        BinanceFeed {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn money_at(row: &[Value], index: usize, field: &'static str) -> Result<Money, MalformedPriceData> {
    let unparseable = || MalformedPriceData::Unparseable {
        field,
        value: row.get(index).map(|v| v.to_string()).unwrap_or_default(),
    };
    match row.get(index) {
        Some(Value::String(s)) => s.parse::<Money>().map_err(|_| unparseable()),
        Some(Value::Number(n)) => n.to_string().parse::<Money>().map_err(|_| unparseable()),
        _ => Err(unparseable()),
    }
}

/// Kline row: `[open_time_ms, "open", "high", "low", "close", "volume", ...]`
pub fn parse_kline(row: &[Value]) -> Result<Candle, MalformedPriceData> {
    let open_time = row
        .first()
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| MalformedPriceData::Unparseable {
            field: "open_time",
            value: row.first().map(|v| v.to_string()).unwrap_or_default(),
        })?;

    Ok(Candle {
        datetime: open_time,
        open: money_at(row, 1, "open")?,
        high: money_at(row, 2, "high")?,
        low: money_at(row, 3, "low")?,
        close: money_at(row, 4, "close")?,
        volume: money_at(row, 5, "volume")?,
    })
}

/// Decode a full klines response body
pub fn parse_klines(body: &str) -> Result<Vec<Candle>, MalformedPriceData> {
    let rows: Vec<Vec<Value>> =
        serde_json::from_str(body).map_err(|e| MalformedPriceData::Unparseable {
            field: "klines",
            value: e.to_string(),
        })?;
    rows.iter().map(|row| parse_kline(row)).collect()
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    async fn get_price_series(
        &self,
        symbol: &Symbol,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = lookback.clamp(1, MAX_KLINES).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.as_str()),
                ("interval", interval),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let candles = parse_klines(&body)?;

        debug!("Fetched {} klines for {} ({})", candles.len(), symbol, interval);
        Ok(candles)
    }
}
