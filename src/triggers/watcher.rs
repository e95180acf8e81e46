// =============================================================================
// Subscription Watcher — per-subscription trigger state machine
// =============================================================================
//
//   Idle --start--> Started --condition logic satisfied--> Triggered
//                   Started --disconnect--> Failed
//
// Triggered and Failed are terminal: later data and later disconnects are
// ignored, so the recorded result never changes once set. The outcome is
// reported at most once through the oneshot handed out by `start()`.
// `cleanup()` releases every pool subscription and may be called any number
// of times from any phase.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::market_data::{Candle, MarketDataPool, SubscriptionId, Ticker};
use crate::triggers::condition::{evaluate_conditions, Condition, ConditionResult};
use crate::types::{ConditionLogic, Granularity};

/// One entry of a wait request: a product and the conditions to watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    pub product_id: String,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: ConditionLogic,
}

impl SubscriptionSpec {
    fn uses_ticker(&self) -> bool {
        self.conditions.iter().any(Condition::uses_ticker)
    }

    /// Granularity -> largest candle count any indicator condition needs.
    fn candle_demand(&self) -> BTreeMap<Granularity, usize> {
        let mut demand = BTreeMap::new();
        for condition in &self.conditions {
            if let Some(granularity) = condition.granularity.filter(|_| !condition.uses_ticker()) {
                let needed = demand.entry(granularity).or_insert(0);
                *needed = (*needed).max(condition.lookback());
            }
        }
        demand
    }
}

/// Snapshot of one subscription's evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResult {
    pub product_id: String,
    pub triggered: bool,
    pub conditions: Vec<ConditionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Triggered,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Triggered | Self::Failed)
    }
}

/// How a started watcher settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Triggered,
    Disconnected(String),
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Start,
    Evaluated { satisfied: bool },
    Disconnected,
}

fn transition(phase: Phase, event: Event) -> Phase {
    match (phase, event) {
        (Phase::Idle, Event::Start) => Phase::Started,
        (Phase::Started, Event::Evaluated { satisfied: true }) => Phase::Triggered,
        (Phase::Started, Event::Disconnected) => Phase::Failed,
        (phase, _) => phase,
    }
}

struct WatchState {
    phase: Phase,
    current_ticker: Option<Ticker>,
    previous_ticker: Option<Ticker>,
    current_candles: HashMap<Granularity, Vec<Candle>>,
    previous_candles: HashMap<Granularity, Vec<Candle>>,
    result: Option<SubscriptionResult>,
    settle: Option<oneshot::Sender<WatchOutcome>>,
    subscription_ids: Vec<SubscriptionId>,
    cleaned_up: bool,
}

struct WatcherInner {
    spec: SubscriptionSpec,
    state: Mutex<WatchState>,
}

pub struct SubscriptionWatcher {
    inner: Arc<WatcherInner>,
    pool: MarketDataPool,
}

impl SubscriptionWatcher {
    pub fn new(spec: SubscriptionSpec, pool: MarketDataPool) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                spec,
                state: Mutex::new(WatchState {
                    phase: Phase::Idle,
                    current_ticker: None,
                    previous_ticker: None,
                    current_candles: HashMap::new(),
                    previous_candles: HashMap::new(),
                    result: None,
                    settle: None,
                    subscription_ids: Vec::new(),
                    cleaned_up: false,
                }),
            }),
            pool,
        }
    }

    pub fn product_id(&self) -> &str {
        &self.inner.spec.product_id
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Subscribe to the data the conditions need. The receiver resolves once
    /// with the outcome; it is never resolved if the watcher is cleaned up
    /// first. Calling `start` twice yields a receiver that never resolves.
    pub fn start(&self) -> oneshot::Receiver<WatchOutcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Idle {
                warn!(product_id = %self.product_id(), phase = ?state.phase, "watcher already started");
                return rx;
            }
            state.phase = transition(state.phase, Event::Start);
            state.settle = Some(tx);
        }

        // Pool calls may deliver snapshots synchronously, so no lock is held.
        let spec = &self.inner.spec;
        let mut ids = Vec::new();

        if spec.uses_ticker() {
            let on_update = Arc::clone(&self.inner);
            let on_disconnect = Arc::clone(&self.inner);
            ids.push(self.pool.subscribe_to_ticker(
                &spec.product_id,
                Arc::new(move |ticker: &Ticker| on_update.on_ticker(ticker)),
                Arc::new(move |reason: &str| on_disconnect.on_disconnect(reason)),
            ));
        }

        for (granularity, count) in spec.candle_demand() {
            let on_update = Arc::clone(&self.inner);
            let on_disconnect = Arc::clone(&self.inner);
            ids.push(self.pool.subscribe_to_candles(
                &spec.product_id,
                granularity,
                count,
                Arc::new(move |candles: &[Candle]| on_update.on_candles(granularity, candles)),
                Arc::new(move |reason: &str| on_disconnect.on_disconnect(reason)),
            ));
        }

        debug!(product_id = %spec.product_id, subscriptions = ids.len(), "watcher started");

        let stale = {
            let mut state = self.inner.state.lock();
            if state.cleaned_up {
                ids
            } else {
                state.subscription_ids.extend(ids);
                Vec::new()
            }
        };
        for id in stale {
            self.pool.unsubscribe(id);
        }
        rx
    }

    /// Latest evaluation, or an all-pending result if nothing was evaluated.
    pub fn result(&self) -> SubscriptionResult {
        let state = self.inner.state.lock();
        state.result.clone().unwrap_or_else(|| SubscriptionResult {
            product_id: self.inner.spec.product_id.clone(),
            triggered: false,
            conditions: self
                .inner
                .spec
                .conditions
                .iter()
                .map(ConditionResult::pending)
                .collect(),
        })
    }

    /// Release every pool subscription this watcher created. Idempotent.
    pub fn cleanup(&self) {
        let ids = {
            let mut state = self.inner.state.lock();
            state.cleaned_up = true;
            std::mem::take(&mut state.subscription_ids)
        };
        if !ids.is_empty() {
            debug!(product_id = %self.product_id(), released = ids.len(), "watcher cleanup");
        }
        for id in ids {
            self.pool.unsubscribe(id);
        }
    }
}

impl WatcherInner {
    fn on_ticker(&self, ticker: &Ticker) {
        let mut state = self.state.lock();
        if state.phase != Phase::Started {
            return;
        }
        state.previous_ticker = state.current_ticker.replace(ticker.clone());
        self.evaluate(&mut state);
    }

    fn on_candles(&self, granularity: Granularity, candles: &[Candle]) {
        let mut state = self.state.lock();
        if state.phase != Phase::Started {
            return;
        }
        if let Some(previous) = state.current_candles.insert(granularity, candles.to_vec()) {
            state.previous_candles.insert(granularity, previous);
        }
        self.evaluate(&mut state);
    }

    fn on_disconnect(&self, reason: &str) {
        let mut state = self.state.lock();
        let next = transition(state.phase, Event::Disconnected);
        if next == state.phase {
            debug!(product_id = %self.spec.product_id, phase = ?state.phase, "ignoring disconnect");
            return;
        }
        state.phase = next;
        warn!(product_id = %self.spec.product_id, reason = %reason, "watch failed");
        if let Some(tx) = state.settle.take() {
            let _ = tx.send(WatchOutcome::Disconnected(reason.to_string()));
        }
    }

    fn evaluate(&self, state: &mut WatchState) {
        let conditions = evaluate_conditions(
            &self.spec.conditions,
            state.current_ticker.as_ref(),
            state.previous_ticker.as_ref(),
            &state.current_candles,
            &state.previous_candles,
        );
        let satisfied = self
            .spec
            .logic
            .combine(conditions.iter().map(|c| c.triggered));
        state.result = Some(SubscriptionResult {
            product_id: self.spec.product_id.clone(),
            triggered: satisfied,
            conditions,
        });

        state.phase = transition(state.phase, Event::Evaluated { satisfied });
        if state.phase == Phase::Triggered {
            info!(product_id = %self.spec.product_id, logic = %self.spec.logic, "conditions met");
            if let Some(tx) = state.settle.take() {
                let _ = tx.send(WatchOutcome::Triggered);
            }
        }
    }
}
