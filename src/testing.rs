// =============================================================================
// Test doubles — in-memory socket, scripted REST fetcher, frame builders
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::coinbase::{CandleFetcher, TokenSigner};
use crate::market_data::{Candle, Ticker};
use crate::stream::{FrameSink, FrameStream, StreamTransport};
use crate::types::Granularity;

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SocketState {
    sent: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String>>>,
    connect_attempts: Vec<Instant>,
    refuse_connects: usize,
}

/// Transport whose "server" is the test: frames written by the connection
/// are recorded, and the test pushes inbound frames or drops the socket.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<SocketState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame written since the last `take_sent`.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Deliver an inbound frame on the live socket. Returns `false` when no
    /// socket is open.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        match &self.state.lock().inbound {
            Some(tx) => tx.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Simulate the server dropping the socket.
    pub fn drop_connection(&self) {
        self.state.lock().inbound = None;
    }

    /// Refuse the next `n` dial attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().refuse_connects = n;
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream)> {
        let rx = {
            let mut state = self.state.lock();
            state.connect_attempts.push(Instant::now());
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                anyhow::bail!("connection refused");
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.inbound = Some(tx);
            rx
        };

        let shared = Arc::clone(&self.state);
        let sink = futures_util::sink::unfold(shared, |shared, frame: String| async move {
            shared.lock().sent.push(frame);
            Ok::<_, anyhow::Error>(shared)
        });
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Signer that numbers its tokens so tests can tell them apart.
#[derive(Default)]
pub(crate) struct CountingSigner {
    issued: AtomicUsize,
}

impl TokenSigner for CountingSigner {
    fn stream_token(&self) -> Result<Option<String>> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("token-{n}")))
    }
}

/// Signer whose first calls fail, then numbers tokens by call.
#[derive(Default)]
pub(crate) struct FailingSigner {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FailingSigner {
    pub fn failing_first(n: usize) -> Self {
        let signer = Self::default();
        signer.fail_next(n);
        signer
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

impl TokenSigner for FailingSigner {
    fn stream_token(&self) -> Result<Option<String>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("signing key unavailable");
        }
        Ok(Some(format!("token-{n}")))
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct FetchCall {
    pub product_id: String,
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub at: Instant,
}

enum Fallback {
    Candles(Vec<Candle>),
    Fail(String),
}

struct FetcherState {
    calls: Vec<FetchCall>,
    scripted: VecDeque<Result<Vec<Candle>, String>>,
    fallback: Fallback,
}

/// Candle source that replays scripted results, then a fixed fallback.
/// Returned candles are re-labelled with the requested product id.
pub(crate) struct MockFetcher {
    state: Mutex<FetcherState>,
    latency: Duration,
}

impl MockFetcher {
    pub fn returning(candles: Vec<Candle>) -> Self {
        Self::with_fallback(Fallback::Candles(candles))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_fallback(Fallback::Fail(message.to_string()))
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            state: Mutex::new(FetcherState {
                calls: Vec::new(),
                scripted: VecDeque::new(),
                fallback,
            }),
            latency: Duration::ZERO,
        }
    }

    /// Every fetch takes `latency` (virtual time under a paused clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_ok(&self, candles: Vec<Candle>) {
        self.state.lock().scripted.push_back(Ok(candles));
    }

    pub fn push_err(&self, message: &str) {
        self.state.lock().scripted.push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl CandleFetcher for MockFetcher {
    async fn fetch_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let result = {
            let mut state = self.state.lock();
            state.calls.push(FetchCall {
                product_id: product_id.to_string(),
                granularity,
                start,
                end,
                at: Instant::now(),
            });
            let result = match state.scripted.pop_front() {
                Some(result) => result,
                None => match &state.fallback {
                    Fallback::Candles(candles) => Ok(candles.clone()),
                    Fallback::Fail(message) => Err(message.clone()),
                },
            };
            drop(state);
            result
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match result {
            Ok(candles) => Ok(candles
                .into_iter()
                .map(|c| Candle {
                    product_id: product_id.to_string(),
                    ..c
                })
                .collect()),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Flat bar: open = high = low = close.
pub(crate) fn candle(product_id: &str, start: i64, close: f64) -> Candle {
    Candle {
        product_id: product_id.to_string(),
        start,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

/// `closes.len()` consecutive bars one granularity apart.
pub(crate) fn series(product_id: &str, granularity: Granularity, closes: &[f64]) -> Vec<Candle> {
    let step = granularity.seconds() as i64;
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| candle(product_id, 1_700_000_000 + i as i64 * step, close))
        .collect()
}

pub(crate) fn ticker(product_id: &str, price: f64) -> Ticker {
    Ticker {
        product_id: product_id.to_string(),
        price,
        volume_24h: Some(1_000.0),
        percent_change_24h: Some(1.5),
        high_24h: Some(price * 1.05),
        low_24h: Some(price * 0.95),
        high_52w: Some(price * 2.0),
        low_52w: Some(price * 0.5),
        best_bid: Some(price - 0.5),
        best_ask: Some(price + 0.5),
        best_bid_quantity: Some(2.0),
        best_ask_quantity: Some(3.0),
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_else(Utc::now),
    }
}

/// A `ticker` channel frame as the exchange sends it.
pub(crate) fn ticker_frame(product_id: &str, price: f64) -> String {
    serde_json::json!({
        "channel": "ticker",
        "timestamp": "2024-01-01T00:00:00Z",
        "sequence_num": 1,
        "events": [{
            "type": "update",
            "tickers": [{
                "type": "ticker",
                "product_id": product_id,
                "price": price.to_string(),
                "volume_24_h": "1000",
                "price_percent_chg_24_h": "1.5",
                "best_bid": (price - 0.5).to_string(),
                "best_ask": (price + 0.5).to_string()
            }]
        }]
    })
    .to_string()
}

/// A `candles` channel frame with one bar.
pub(crate) fn candles_frame(product_id: &str, start: i64, close: f64) -> String {
    serde_json::json!({
        "channel": "candles",
        "timestamp": "2024-01-01T00:00:00Z",
        "events": [{
            "type": "update",
            "candles": [{
                "product_id": product_id,
                "start": start.to_string(),
                "open": close.to_string(),
                "high": close.to_string(),
                "low": close.to_string(),
                "close": close.to_string(),
                "volume": "1"
            }]
        }]
    })
    .to_string()
}
