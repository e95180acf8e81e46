use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Granularity;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Default number of candles retained per series.
pub const DEFAULT_MAX_CANDLES: usize = 100;

/// A single OHLCV bar. `start` is the bar's opening time in unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub product_id: String,
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Composite key that identifies a unique candle series.
///
/// Every consumer asking for the same key observes the same buffer.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub product_id: String,
    pub granularity: Granularity,
}

impl CandleKey {
    pub fn new(product_id: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            product_id: product_id.into(),
            granularity,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.product_id, self.granularity)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- bounded, deduplicated series per (product, granularity)
// ---------------------------------------------------------------------------

struct Series {
    candles: Vec<Candle>,
    max_len: usize,
}

/// Thread-safe store of the most recent candles per `(product, granularity)`.
///
/// Each series is kept sorted by `start` ascending with no duplicate `start`
/// values. A candle whose `start` is already present replaces the stored one
/// (exchanges keep revising the in-progress bar). After every insert the
/// series is trimmed from the oldest end down to its maximum length.
pub struct CandleBuffer {
    series: RwLock<HashMap<CandleKey, Series>>,
    default_max: usize,
}

impl CandleBuffer {
    /// Create a buffer whose series hold at most `default_max` candles unless
    /// a larger capacity is reserved for a key.
    pub fn new(default_max: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            default_max: default_max.max(1),
        }
    }

    /// Insert `candle` into the `(candle.product_id, granularity)` series, or
    /// replace the entry with the same `start`.
    pub fn add_or_update(&self, candle: Candle, granularity: Granularity) {
        let key = CandleKey::new(candle.product_id.clone(), granularity);
        let mut map = self.series.write();
        let default_max = self.default_max;
        let series = map.entry(key).or_insert_with(|| Series {
            candles: Vec::with_capacity(default_max),
            max_len: default_max,
        });

        match series
            .candles
            .binary_search_by_key(&candle.start, |c| c.start)
        {
            Ok(idx) => series.candles[idx] = candle,
            Err(idx) => series.candles.insert(idx, candle),
        }

        let overflow = series.candles.len().saturating_sub(series.max_len);
        if overflow > 0 {
            series.candles.drain(..overflow);
        }
    }

    /// Insert a batch of candles for one granularity, in order.
    pub fn extend(&self, candles: impl IntoIterator<Item = Candle>, granularity: Granularity) {
        for candle in candles {
            self.add_or_update(candle, granularity);
        }
    }

    /// Merge fetched history behind live data: only candles strictly older
    /// than the newest stored one are inserted, so a late REST copy of the
    /// in-progress bar never replaces a fresher streamed update. An empty
    /// series takes everything. Returns how many candles were merged.
    pub fn merge_history(&self, candles: impl IntoIterator<Item = Candle>, granularity: Granularity) -> usize {
        // Newest live start per product, taken before anything is merged.
        let mut newest: HashMap<String, Option<i64>> = HashMap::new();
        let mut merged = 0;
        for candle in candles {
            let live = *newest
                .entry(candle.product_id.clone())
                .or_insert_with(|| self.latest(&candle.product_id, granularity).map(|c| c.start));
            if live.is_some_and(|live| candle.start >= live) {
                continue;
            }
            self.add_or_update(candle, granularity);
            merged += 1;
        }
        merged
    }

    /// Return the most recent `count` candles (or all of them), oldest first.
    /// Unknown keys yield an empty vector.
    pub fn get(&self, product_id: &str, granularity: Granularity, count: Option<usize>) -> Vec<Candle> {
        let key = CandleKey::new(product_id, granularity);
        let map = self.series.read();
        match map.get(&key) {
            Some(series) => {
                let start = count
                    .map(|n| series.candles.len().saturating_sub(n))
                    .unwrap_or(0);
                series.candles[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Newest candle of a series, if any.
    pub fn latest(&self, product_id: &str, granularity: Granularity) -> Option<Candle> {
        let key = CandleKey::new(product_id, granularity);
        self.series
            .read()
            .get(&key)
            .and_then(|s| s.candles.last().cloned())
    }

    /// Raise the retention limit for a key. Limits only ever grow.
    pub fn reserve(&self, key: &CandleKey, max_len: usize) {
        let mut map = self.series.write();
        let default_max = self.default_max;
        let series = map.entry(key.clone()).or_insert_with(|| Series {
            candles: Vec::new(),
            max_len: default_max,
        });
        series.max_len = series.max_len.max(max_len);
    }

    /// Drop a series entirely.
    pub fn remove(&self, key: &CandleKey) {
        self.series.write().remove(key);
    }

    /// Number of candles stored for a key.
    pub fn len(&self, key: &CandleKey) -> usize {
        self.series.read().get(key).map_or(0, |s| s.candles.len())
    }

    /// Retention limit currently applied to a key.
    pub fn capacity(&self, key: &CandleKey) -> usize {
        self.series
            .read()
            .get(key)
            .map_or(self.default_max, |s| s.max_len)
    }
}

impl Default for CandleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANDLES)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
