// =============================================================================
// Ticker snapshots — latest top-of-book / 24h statistics per product
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Latest ticker for one product. Every update fully replaces the previous
/// snapshot; fields are never merged. Only `price` is mandatory; statistics
/// the exchange left blank are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub product_id: String,
    pub price: f64,
    pub volume_24h: Option<f64>,
    pub percent_change_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub high_52w: Option<f64>,
    pub low_52w: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub best_bid_quantity: Option<f64>,
    pub best_ask_quantity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Most recent ticker per product, shared by every consumer of the pool.
#[derive(Default)]
pub struct TickerCache {
    latest: RwLock<HashMap<String, Ticker>>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, ticker: Ticker) {
        self.latest.write().insert(ticker.product_id.clone(), ticker);
    }

    pub fn get(&self, product_id: &str) -> Option<Ticker> {
        self.latest.read().get(product_id).cloned()
    }

    pub fn remove(&self, product_id: &str) {
        self.latest.write().remove(product_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(product_id: &str, price: f64) -> Ticker {
        Ticker {
            product_id: product_id.into(),
            price,
            volume_24h: None,
            percent_change_24h: None,
            high_24h: None,
            low_24h: None,
            high_52w: None,
            low_52w: None,
            best_bid: None,
            best_ask: None,
            best_bid_quantity: None,
            best_ask_quantity: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn store_replaces_whole_snapshot() {
        let cache = TickerCache::new();
        cache.store(ticker("BTC-USD", 1.0));
        cache.store(ticker("BTC-USD", 2.0));
        assert_eq!(cache.get("BTC-USD").map(|t| t.price), Some(2.0));

        cache.remove("BTC-USD");
        assert!(cache.get("BTC-USD").is_none());
    }
}
