// =============================================================================
// Polling Fallback Connection — REST refresh for granularities not streamed
// =============================================================================
//
// One tokio task per (product, granularity). The first tick fires at once, so
// a new key is fetched immediately, then once per bar width. Each fetch is
// retried with exponential backoff plus jitter; when retries run out the
// failure handler is told and the task ends. A later `subscribe` for the same
// key starts a fresh task.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::coinbase::{CandleFetcher, MAX_CANDLES_PER_REQUEST};
use crate::market_data::{Candle, CandleKey};
use crate::types::Granularity;

/// Receives every successful fetch for a key, oldest candle first.
pub type PolledCandlesHandler = Arc<dyn Fn(&CandleKey, Vec<Candle>) + Send + Sync>;

/// Invoked once per key when a fetch exhausts its retries.
pub type PollFailureHandler = Arc<dyn Fn(&CandleKey, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Attempts per fetch before the key is reported as failed.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

struct PollTask {
    /// High-water mark of candles wanted, read on every tick.
    desired: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

pub struct PollingConnection {
    fetcher: Arc<dyn CandleFetcher>,
    settings: PollSettings,
    on_candles: PolledCandlesHandler,
    on_failure: PollFailureHandler,
    tasks: Mutex<HashMap<CandleKey, PollTask>>,
}

impl PollingConnection {
    pub fn new(
        fetcher: Arc<dyn CandleFetcher>,
        settings: PollSettings,
        on_candles: PolledCandlesHandler,
        on_failure: PollFailureHandler,
    ) -> Self {
        Self {
            fetcher,
            settings,
            on_candles,
            on_failure,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `(product_id, granularity)`, or raise the desired count
    /// of an existing poll. The count never shrinks while the key is polled.
    pub fn subscribe(&self, product_id: &str, granularity: Granularity, desired_count: usize) {
        let key = CandleKey::new(product_id, granularity);
        let desired_count = desired_count.clamp(1, MAX_CANDLES_PER_REQUEST);
        let mut tasks = self.tasks.lock();

        if let Some(task) = tasks.get(&key) {
            let previous = task.desired.fetch_max(desired_count, Ordering::SeqCst);
            if !task.handle.is_finished() {
                if desired_count > previous {
                    debug!(key = %key, desired_count, "raised polled candle count");
                }
                return;
            }
            info!(key = %key, "restarting stopped poll");
        }

        let desired = Arc::new(AtomicUsize::new(
            tasks
                .get(&key)
                .map(|t| t.desired.load(Ordering::SeqCst))
                .unwrap_or(0)
                .max(desired_count),
        ));
        let handle = tokio::spawn(poll_loop(
            key.clone(),
            Arc::clone(&desired),
            Arc::clone(&self.fetcher),
            self.settings.clone(),
            Arc::clone(&self.on_candles),
            Arc::clone(&self.on_failure),
        ));
        info!(key = %key, desired_count, interval_secs = granularity.seconds(), "polling started");
        tasks.insert(key, PollTask { desired, handle });
    }

    /// Stop polling a key. Unknown keys are ignored.
    pub fn unsubscribe(&self, product_id: &str, granularity: Granularity) {
        let key = CandleKey::new(product_id, granularity);
        if let Some(task) = self.tasks.lock().remove(&key) {
            task.handle.abort();
            info!(key = %key, "polling stopped");
        }
    }

    /// Stop every poll.
    pub fn close(&self) {
        let drained: Vec<(CandleKey, PollTask)> = self.tasks.lock().drain().collect();
        for (key, task) in drained {
            task.handle.abort();
            debug!(key = %key, "polling stopped on close");
        }
    }

    /// Whether a live poll task exists for the key.
    pub fn is_polling(&self, key: &CandleKey) -> bool {
        self.tasks
            .lock()
            .get(key)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Current high-water candle count for a key.
    pub fn desired_count(&self, key: &CandleKey) -> Option<usize> {
        self.tasks
            .lock()
            .get(key)
            .map(|t| t.desired.load(Ordering::SeqCst))
    }
}

impl Drop for PollingConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().values() {
            task.handle.abort();
        }
    }
}

async fn poll_loop(
    key: CandleKey,
    desired: Arc<AtomicUsize>,
    fetcher: Arc<dyn CandleFetcher>,
    settings: PollSettings,
    on_candles: PolledCandlesHandler,
    on_failure: PollFailureHandler,
) {
    let mut interval = tokio::time::interval(key.granularity.refresh_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let count = desired.load(Ordering::SeqCst);
        match fetch_with_retry(&key, count, fetcher.as_ref(), &settings).await {
            Ok(candles) => {
                debug!(key = %key, count = candles.len(), "poll delivered candles");
                on_candles(&key, candles);
            }
            Err(e) => {
                let reason = format!(
                    "polling {key} failed after {} attempts: {e:#}",
                    settings.max_retries.max(1)
                );
                error!(key = %key, reason = %reason, "polling abandoned");
                on_failure(&key, &reason);
                return;
            }
        }
    }
}

/// Fetch the newest `count` candles, retrying transient failures.
async fn fetch_with_retry(
    key: &CandleKey,
    count: usize,
    fetcher: &dyn CandleFetcher,
    settings: &PollSettings,
) -> Result<Vec<Candle>> {
    let attempts = settings.max_retries.max(1);
    let mut attempt = 1;
    loop {
        let end = Utc::now();
        let span = chrono::Duration::seconds((count as u64 * key.granularity.seconds()) as i64);
        let start = end - span;

        match fetcher
            .fetch_candles(&key.product_id, key.granularity, start, end)
            .await
        {
            Ok(candles) => return Ok(candles),
            Err(e) if attempt < attempts => {
                let delay = retry_delay(settings.retry_base_delay, attempt);
                warn!(
                    key = %key,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "candle fetch failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `base * 2^(attempt-1)` plus up to half of `base` of random jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base
        .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .unwrap_or(Duration::MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    exp.saturating_add(Duration::from_millis(jitter_ms))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
