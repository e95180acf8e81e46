// =============================================================================
// Market Data Pool — ref-counted fan-out over the stream and the poller
// =============================================================================
//
// Every consumer subscribes here and nowhere else. The pool keeps a registry
// keyed by resource (ticker per product, candles per product + granularity):
//
//   0 -> 1 subscribers   open the resource
//                        ticker        -> stream `ticker` channel
//                        FIVE_MINUTE   -> stream `candles` channel + REST backfill
//                        other widths  -> poller
//   1 -> 0 subscribers   tear it down and drop its buffered data
//
// Inbound updates are written to the shared buffer / ticker cache first and
// then fanned out to every subscriber of the key, outside the registry lock.
// Connection failures are broadcast to every subscriber of the affected keys.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coinbase::{CandleFetcher, TokenSigner, MAX_CANDLES_PER_REQUEST};
use crate::market_data::candle_buffer::{Candle, CandleBuffer, CandleKey};
use crate::market_data::poller::{PollSettings, PollingConnection};
use crate::market_data::ticker::{Ticker, TickerCache};
use crate::stream::{
    ConnectionState, StreamConnection, StreamMessage, StreamSettings, StreamTransport,
    CANDLES_CHANNEL, TICKER_CHANNEL,
};
use crate::types::Granularity;

pub type TickerCallback = Arc<dyn Fn(&Ticker) + Send + Sync>;
/// Receives the buffered window (oldest first, at most the requested count).
pub type CandleCallback = Arc<dyn Fn(&[Candle]) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Opaque handle returned by the subscribe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shared upstream resource subscribers are counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Ticker(String),
    Candles(CandleKey),
}

impl ResourceKey {
    /// Whether the resource is served by the streaming connection.
    fn is_streamed(&self) -> bool {
        match self {
            Self::Ticker(_) => true,
            Self::Candles(key) => key.granularity.is_streamed(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticker(product_id) => write!(f, "ticker:{product_id}"),
            Self::Candles(key) => write!(f, "candles:{key}"),
        }
    }
}

/// External collaborators the pool drives.
#[derive(Clone)]
pub struct PoolDeps {
    pub transport: Arc<dyn StreamTransport>,
    pub fetcher: Arc<dyn CandleFetcher>,
    pub signer: Arc<dyn TokenSigner>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub stream: StreamSettings,
    pub poll: PollSettings,
    /// Default retention per candle series.
    pub candle_buffer_size: usize,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

enum Listener {
    Ticker(TickerCallback),
    Candles {
        count: usize,
        on_update: CandleCallback,
    },
}

struct Subscriber {
    listener: Listener,
    on_disconnect: DisconnectCallback,
}

#[derive(Default)]
struct Entry {
    subscribers: HashMap<SubscriptionId, Subscriber>,
    /// Largest candle count any subscriber of this key has asked for.
    max_count: usize,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<ResourceKey, Entry>,
    index: HashMap<SubscriptionId, ResourceKey>,
}

impl Registry {
    fn disconnect_callbacks<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a ResourceKey>,
    ) -> Vec<DisconnectCallback> {
        keys.into_iter()
            .filter_map(|key| self.entries.get(key))
            .flat_map(|entry| entry.subscribers.values())
            .map(|s| Arc::clone(&s.on_disconnect))
            .collect()
    }
}

/// How fetched candles enter the buffer.
#[derive(Debug, Clone, Copy)]
enum Merge {
    /// Stream and poll updates: replace by start time.
    Live,
    /// Backfill: only bars older than the newest live one.
    History,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Shared entry point for market data. Cloning yields another handle to the
/// same pool.
#[derive(Clone)]
pub struct MarketDataPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    self_ref: Weak<PoolInner>,
    deps: PoolDeps,
    stream_settings: StreamSettings,
    /// Created on first use, then lives until `close()`.
    stream: Mutex<Option<StreamConnection>>,
    poller: PollingConnection,
    buffer: CandleBuffer,
    tickers: TickerCache,
    registry: Mutex<Registry>,
}

impl MarketDataPool {
    pub fn new(deps: PoolDeps, settings: PoolSettings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let on_candles = weak.clone();
            let on_failure = weak.clone();
            let poller = PollingConnection::new(
                Arc::clone(&deps.fetcher),
                settings.poll.clone(),
                Arc::new(move |key: &CandleKey, candles: Vec<Candle>| {
                    if let Some(inner) = on_candles.upgrade() {
                        inner.deliver_candles(key, candles);
                    }
                }),
                Arc::new(move |key: &CandleKey, reason: &str| {
                    if let Some(inner) = on_failure.upgrade() {
                        inner.broadcast_disconnect(&[ResourceKey::Candles(key.clone())], reason);
                    }
                }),
            );

            PoolInner {
                self_ref: weak.clone(),
                deps,
                stream_settings: settings.stream,
                stream: Mutex::new(None),
                poller,
                buffer: CandleBuffer::new(settings.candle_buffer_size),
                tickers: TickerCache::new(),
                registry: Mutex::new(Registry::default()),
            }
        });
        Self { inner }
    }

    /// Follow ticker updates for a product. The latest cached ticker, if
    /// any, is delivered before this returns.
    pub fn subscribe_to_ticker(
        &self,
        product_id: &str,
        on_update: TickerCallback,
        on_disconnect: DisconnectCallback,
    ) -> SubscriptionId {
        let key = ResourceKey::Ticker(product_id.to_string());
        let id = self.inner.register(
            key,
            Subscriber {
                listener: Listener::Ticker(Arc::clone(&on_update)),
                on_disconnect,
            },
            0,
        );

        if let Some(ticker) = self.inner.tickers.get(product_id) {
            on_update(&ticker);
        }
        id
    }

    /// Follow the newest `count` candles of a series. Already-buffered
    /// history is delivered before this returns.
    pub fn subscribe_to_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        count: usize,
        on_update: CandleCallback,
        on_disconnect: DisconnectCallback,
    ) -> SubscriptionId {
        let count = count.max(1);
        let key = ResourceKey::Candles(CandleKey::new(product_id, granularity));
        let id = self.inner.register(
            key,
            Subscriber {
                listener: Listener::Candles {
                    count,
                    on_update: Arc::clone(&on_update),
                },
                on_disconnect,
            },
            count,
        );

        let window = self.inner.buffer.get(product_id, granularity, Some(count));
        if !window.is_empty() {
            on_update(&window);
        }
        id
    }

    /// Drop one subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unregister(id);
    }

    /// Tear down every resource and forget every subscriber.
    pub fn close(&self) {
        let stream = self.inner.stream.lock().take();
        if let Some(stream) = stream {
            stream.close();
        }
        self.inner.poller.close();

        let mut registry = self.inner.registry.lock();
        for key in registry.entries.keys() {
            match key {
                ResourceKey::Ticker(product_id) => self.inner.tickers.remove(product_id),
                ResourceKey::Candles(candle_key) => self.inner.buffer.remove(candle_key),
            }
        }
        let dropped = registry.index.len();
        registry.entries.clear();
        registry.index.clear();
        info!(dropped_subscriptions = dropped, "market data pool closed");
    }

    /// Number of live subscription ids.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.lock().index.len()
    }

    /// Subscribers currently counted against a resource.
    pub fn ref_count(&self, key: &ResourceKey) -> usize {
        self.inner
            .registry
            .lock()
            .entries
            .get(key)
            .map_or(0, |e| e.subscribers.len())
    }

    /// Buffered candles for a series, oldest first.
    pub fn candles(&self, product_id: &str, granularity: Granularity, count: Option<usize>) -> Vec<Candle> {
        self.inner.buffer.get(product_id, granularity, count)
    }

    pub fn latest_ticker(&self, product_id: &str) -> Option<Ticker> {
        self.inner.tickers.get(product_id)
    }

    /// State of the streaming connection, if it has been created.
    pub fn stream_state(&self) -> Option<ConnectionState> {
        self.inner.stream.lock().as_ref().map(StreamConnection::state)
    }
}

impl PoolInner {
    /// Add a subscriber; opens the resource on the first one. Resource
    /// transitions happen under the registry lock so open and teardown of a
    /// key can never interleave.
    fn register(&self, key: ResourceKey, subscriber: Subscriber, count: usize) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut registry = self.registry.lock();
        let entry = registry.entries.entry(key.clone()).or_default();
        let first = entry.subscribers.is_empty();
        let grew = count > entry.max_count;
        entry.max_count = entry.max_count.max(count);
        let max_count = entry.max_count;
        entry.subscribers.insert(id, subscriber);
        let ref_count = entry.subscribers.len();
        registry.index.insert(id, key.clone());

        if first {
            self.open_resource(&key, max_count);
        } else if grew {
            self.grow_resource(&key, max_count);
        }
        debug!(resource = %key, subscription_id = %id, ref_count, "subscribed");
        id
    }

    fn unregister(&self, id: SubscriptionId) {
        let mut registry = self.registry.lock();
        let Some(key) = registry.index.remove(&id) else {
            return;
        };
        let remaining = match registry.entries.get_mut(&key) {
            Some(entry) => {
                entry.subscribers.remove(&id);
                entry.subscribers.len()
            }
            None => 0,
        };
        debug!(resource = %key, subscription_id = %id, ref_count = remaining, "unsubscribed");

        if remaining == 0 {
            registry.entries.remove(&key);
            self.close_resource(&key);
        }
    }

    fn open_resource(&self, key: &ResourceKey, count: usize) {
        info!(resource = %key, "opening market data resource");
        match key {
            ResourceKey::Ticker(product_id) => {
                self.with_stream(|s| s.subscribe(TICKER_CHANNEL, Some(&[product_id.clone()])));
            }
            ResourceKey::Candles(candle_key) => {
                self.buffer.reserve(candle_key, count);
                if candle_key.granularity.is_streamed() {
                    self.with_stream(|s| {
                        s.subscribe(CANDLES_CHANNEL, Some(&[candle_key.product_id.clone()]))
                    });
                    self.spawn_backfill(candle_key.clone(), count);
                } else {
                    self.poller
                        .subscribe(&candle_key.product_id, candle_key.granularity, count);
                }
            }
        }
    }

    /// A later subscriber wants more history than the key holds.
    fn grow_resource(&self, key: &ResourceKey, count: usize) {
        let ResourceKey::Candles(candle_key) = key else {
            return;
        };
        self.buffer.reserve(candle_key, count);
        if candle_key.granularity.is_streamed() {
            self.spawn_backfill(candle_key.clone(), count);
        } else {
            self.poller
                .subscribe(&candle_key.product_id, candle_key.granularity, count);
        }
    }

    fn close_resource(&self, key: &ResourceKey) {
        info!(resource = %key, "closing market data resource");
        match key {
            ResourceKey::Ticker(product_id) => {
                self.with_existing_stream(|s| {
                    s.unsubscribe(TICKER_CHANNEL, Some(&[product_id.clone()]))
                });
                self.tickers.remove(product_id);
            }
            ResourceKey::Candles(candle_key) => {
                if candle_key.granularity.is_streamed() {
                    self.with_existing_stream(|s| {
                        s.unsubscribe(CANDLES_CHANNEL, Some(&[candle_key.product_id.clone()]))
                    });
                } else {
                    self.poller
                        .unsubscribe(&candle_key.product_id, candle_key.granularity);
                }
                self.buffer.remove(candle_key);
            }
        }
    }

    /// Run `f` against the streaming connection, creating it on first use.
    fn with_stream(&self, f: impl FnOnce(&StreamConnection)) {
        let mut slot = self.stream.lock();
        let stream = slot.get_or_insert_with(|| {
            info!(url = %self.stream_settings.url, "creating streaming connection");
            let on_message = self.self_ref.clone();
            let on_disconnect = self.self_ref.clone();
            StreamConnection::spawn(
                self.stream_settings.clone(),
                Arc::clone(&self.deps.transport),
                Arc::clone(&self.deps.signer),
                Arc::new(move |message| {
                    if let Some(inner) = on_message.upgrade() {
                        inner.handle_stream_message(message);
                    }
                }),
                Arc::new(move |reason: &str| {
                    if let Some(inner) = on_disconnect.upgrade() {
                        inner.handle_stream_disconnect(reason);
                    }
                }),
            )
        });
        f(stream);
    }

    fn with_existing_stream(&self, f: impl FnOnce(&StreamConnection)) {
        if let Some(stream) = self.stream.lock().as_ref() {
            f(stream);
        }
    }

    /// One REST fetch so indicators have history before live bars arrive.
    fn spawn_backfill(&self, key: CandleKey, count: usize) {
        let count = count.clamp(1, MAX_CANDLES_PER_REQUEST);
        let fetcher = Arc::clone(&self.deps.fetcher);
        let pool = self.self_ref.clone();
        tokio::spawn(async move {
            let end = Utc::now();
            let span = chrono::Duration::seconds((count as u64 * key.granularity.seconds()) as i64);
            match fetcher
                .fetch_candles(&key.product_id, key.granularity, end - span, end)
                .await
            {
                Ok(candles) => {
                    debug!(key = %key, count = candles.len(), "backfill fetched");
                    if let Some(inner) = pool.upgrade() {
                        inner.store_and_fan_out(&key, candles, Merge::History);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "candle backfill failed; relying on live stream"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn handle_stream_message(&self, message: StreamMessage) {
        match message {
            StreamMessage::Tickers(tickers) => {
                for ticker in tickers {
                    self.deliver_ticker(ticker);
                }
            }
            StreamMessage::Candles(candles) => {
                let mut by_product: HashMap<String, Vec<Candle>> = HashMap::new();
                for candle in candles {
                    by_product
                        .entry(candle.product_id.clone())
                        .or_default()
                        .push(candle);
                }
                for (product_id, candles) in by_product {
                    let key = CandleKey::new(product_id, Granularity::FiveMinute);
                    self.deliver_candles(&key, candles);
                }
            }
            other => debug!(message = ?other, "unhandled stream message"),
        }
    }

    fn deliver_ticker(&self, ticker: Ticker) {
        let key = ResourceKey::Ticker(ticker.product_id.clone());
        let listeners: Vec<TickerCallback> = {
            let registry = self.registry.lock();
            let Some(entry) = registry.entries.get(&key) else {
                return;
            };
            self.tickers.store(ticker.clone());
            entry
                .subscribers
                .values()
                .filter_map(|s| match &s.listener {
                    Listener::Ticker(cb) => Some(Arc::clone(cb)),
                    Listener::Candles { .. } => None,
                })
                .collect()
        };
        for listener in listeners {
            listener(&ticker);
        }
    }

    fn deliver_candles(&self, key: &CandleKey, candles: Vec<Candle>) {
        self.store_and_fan_out(key, candles, Merge::Live);
    }

    /// Buffer `candles` for `key`, then hand each subscriber its window.
    /// Updates for keys nobody follows any more are dropped.
    fn store_and_fan_out(&self, key: &CandleKey, candles: Vec<Candle>, merge: Merge) {
        if candles.is_empty() {
            return;
        }
        let resource = ResourceKey::Candles(key.clone());
        let listeners: Vec<(usize, CandleCallback)> = {
            let registry = self.registry.lock();
            let Some(entry) = registry.entries.get(&resource) else {
                return;
            };
            match merge {
                Merge::Live => self.buffer.extend(candles, key.granularity),
                Merge::History => {
                    if self.buffer.merge_history(candles, key.granularity) == 0 {
                        return;
                    }
                }
            }
            entry
                .subscribers
                .values()
                .filter_map(|s| match &s.listener {
                    Listener::Candles { count, on_update } => Some((*count, Arc::clone(on_update))),
                    Listener::Ticker(_) => None,
                })
                .collect()
        };
        for (count, listener) in listeners {
            let window = self.buffer.get(&key.product_id, key.granularity, Some(count));
            listener(&window);
        }
    }

    fn handle_stream_disconnect(&self, reason: &str) {
        let keys: Vec<ResourceKey> = self
            .registry
            .lock()
            .entries
            .keys()
            .filter(|k| k.is_streamed())
            .cloned()
            .collect();
        self.broadcast_disconnect(&keys, reason);
    }

    fn broadcast_disconnect(&self, keys: &[ResourceKey], reason: &str) {
        let callbacks = self.registry.lock().disconnect_callbacks(keys);
        warn!(
            resources = keys.len(),
            subscribers = callbacks.len(),
            reason = %reason,
            "broadcasting market data disconnect"
        );
        for callback in callbacks {
            callback(reason);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
