// =============================================================================
// Event Wait — race market triggers against a timeout and cancellation
// =============================================================================
//
// One watcher per requested subscription is started, then a biased select
// decides the outcome, cancellation first:
//
//   cancelled                 -> error   "Request cancelled"
//   any watcher triggered     -> triggered, with every watcher's snapshot
//   any watcher disconnected  -> error   <disconnect reason>
//   timer elapsed             -> timeout, duration = requested seconds
//
// Whichever arm wins, a drop guard cleans up every watcher, including when
// the wait future itself is dropped mid-flight.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::select_all;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::coinbase::MAX_CANDLES_PER_REQUEST;
use crate::market_data::MarketDataPool;
use crate::triggers::watcher::{SubscriptionResult, SubscriptionSpec, SubscriptionWatcher, WatchOutcome};

pub const CANCELLED_REASON: &str = "Request cancelled";

/// A "wait until something happens" request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    pub subscriptions: Vec<SubscriptionSpec>,
    /// Seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Triggered,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOutcome {
    pub status: WaitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<Vec<SubscriptionResult>>,
    /// Seconds waited, on timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WaitOutcome {
    fn triggered(subscriptions: Vec<SubscriptionResult>) -> Self {
        Self {
            status: WaitStatus::Triggered,
            subscriptions: Some(subscriptions),
            duration: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    fn timeout(seconds: u64) -> Self {
        Self {
            status: WaitStatus::Timeout,
            subscriptions: None,
            duration: Some(seconds),
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: WaitStatus::Error,
            subscriptions: None,
            duration: None,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Runs wait requests against a shared pool.
#[derive(Clone)]
pub struct EventWaiter {
    pool: MarketDataPool,
    max_timeout_secs: u64,
}

impl EventWaiter {
    pub fn new(pool: MarketDataPool, max_timeout_secs: u64) -> Self {
        Self {
            pool,
            max_timeout_secs,
        }
    }

    /// Wait for the first of: a trigger, a permanent disconnect, the
    /// timeout, or `cancel`. Never fails; every failure is an `error`
    /// outcome.
    #[instrument(skip_all, fields(subscriptions = request.subscriptions.len(), timeout = request.timeout))]
    pub async fn wait_for_market_event(&self, request: WaitRequest, cancel: CancellationToken) -> WaitOutcome {
        if let Err(reason) = validate(&request, self.max_timeout_secs) {
            warn!(reason = %reason, "rejected wait request");
            return WaitOutcome::error(reason);
        }
        if cancel.is_cancelled() {
            return WaitOutcome::error(CANCELLED_REASON);
        }

        let started = Instant::now();
        let timeout_secs = request.timeout;
        let watchers: Vec<SubscriptionWatcher> = request
            .subscriptions
            .into_iter()
            .map(|spec| SubscriptionWatcher::new(spec, self.pool.clone()))
            .collect();
        let _cleanup = CleanupGuard(&watchers);

        let settled: Vec<_> = watchers
            .iter()
            .map(|w| Box::pin(outcome_of(w.start())))
            .collect();
        let first_settled = async move { select_all(settled).await.0 };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitOutcome::error(CANCELLED_REASON),
            outcome = first_settled => match outcome {
                WatchOutcome::Triggered => {
                    WaitOutcome::triggered(watchers.iter().map(SubscriptionWatcher::result).collect())
                }
                WatchOutcome::Disconnected(reason) => WaitOutcome::error(reason),
            },
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => WaitOutcome::timeout(timeout_secs),
        };

        info!(
            status = ?outcome.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "wait finished"
        );
        outcome
    }
}

/// A watcher's receiver, where a dropped sender never settles.
async fn outcome_of(rx: oneshot::Receiver<WatchOutcome>) -> WatchOutcome {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => std::future::pending().await,
    }
}

struct CleanupGuard<'a>(&'a [SubscriptionWatcher]);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        for watcher in self.0 {
            watcher.cleanup();
        }
    }
}

fn validate(request: &WaitRequest, max_timeout_secs: u64) -> Result<(), String> {
    if request.subscriptions.is_empty() {
        return Err("At least one subscription is required".into());
    }
    if request.timeout == 0 || request.timeout > max_timeout_secs {
        return Err(format!(
            "Timeout must be between 1 and {max_timeout_secs} seconds, got {}",
            request.timeout
        ));
    }
    for spec in &request.subscriptions {
        if spec.product_id.trim().is_empty() {
            return Err("Every subscription needs a productId".into());
        }
        if spec.conditions.is_empty() {
            return Err(format!("Subscription for {} has no conditions", spec.product_id));
        }
        for condition in &spec.conditions {
            if !condition.threshold.is_finite() {
                return Err(format!("Condition threshold for {} must be finite", spec.product_id));
            }
            if let Some(period) = condition.period {
                if period == 0 || period > MAX_CANDLES_PER_REQUEST {
                    return Err(format!(
                        "Condition period for {} must be between 1 and {MAX_CANDLES_PER_REQUEST}, got {period}",
                        spec.product_id
                    ));
                }
            }
            if let Some(indicator) = condition.indicator() {
                if condition.granularity.is_none() {
                    return Err(format!(
                        "Indicator condition {indicator} for {} requires a granularity",
                        spec.product_id
                    ));
                }
            }
        }
    }
    Ok(())
}
