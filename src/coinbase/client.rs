// =============================================================================
// Coinbase REST Client — public candle history
// =============================================================================
//
// Candles come from the public market-data endpoint, which needs no request
// signing:
//
//   GET /api/v3/brokerage/market/products/{product_id}/candles
//       ?start=<unix secs>&end=<unix secs>&granularity=ONE_HOUR
//
// The endpoint returns at most 350 bars per request, newest first.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::coinbase::de::{lenient_f64, lenient_i64, lenient_opt_f64};
use crate::market_data::Candle;
use crate::types::Granularity;

/// Upper bound on bars per candles request.
pub const MAX_CANDLES_PER_REQUEST: usize = 350;

/// Source of historical candles. Any error is treated as retryable by the
/// poller.
#[async_trait]
pub trait CandleFetcher: Send + Sync + 'static {
    async fn fetch_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// Thin REST client over the Coinbase Advanced Trade public endpoints.
#[derive(Clone)]
pub struct CoinbaseClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<RestCandle>,
}

#[derive(Deserialize)]
struct RestCandle {
    #[serde(deserialize_with = "lenient_i64")]
    start: i64,
    #[serde(deserialize_with = "lenient_f64")]
    low: f64,
    #[serde(deserialize_with = "lenient_f64")]
    high: f64,
    #[serde(deserialize_with = "lenient_f64")]
    open: f64,
    #[serde(deserialize_with = "lenient_f64")]
    close: f64,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    volume: Option<f64>,
}

impl CoinbaseClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "CoinbaseClient initialised");
        Ok(Self { base_url, client })
    }

    fn candles_url(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        format!(
            "{}/api/v3/brokerage/market/products/{}/candles?start={}&end={}&granularity={}",
            self.base_url,
            product_id,
            start.timestamp(),
            end.timestamp(),
            granularity.as_str()
        )
    }
}

#[async_trait]
impl CandleFetcher for CoinbaseClient {
    #[instrument(skip(self), name = "coinbase::fetch_candles")]
    async fn fetch_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let url = self.candles_url(product_id, granularity, start, end);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET candles request failed")?;

        let status = resp.status();
        let body = resp.text().await.context("failed to read candles response")?;

        if !status.is_success() {
            anyhow::bail!("Coinbase GET candles returned {status}: {body}");
        }

        let candles = parse_candles(product_id, &body)?;
        debug!(product_id, %granularity, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

/// Decode a candles response body into ascending-by-start candles.
fn parse_candles(product_id: &str, body: &str) -> Result<Vec<Candle>> {
    let parsed: CandlesResponse =
        serde_json::from_str(body).context("failed to parse candles response")?;

    let mut candles: Vec<Candle> = parsed
        .candles
        .into_iter()
        .map(|c| Candle {
            product_id: product_id.to_string(),
            start: c.start,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume.unwrap_or_default(),
        })
        .collect();
    candles.sort_by_key(|c| c.start);
    Ok(candles)
}

impl std::fmt::Debug for CoinbaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
