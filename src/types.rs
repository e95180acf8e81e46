// =============================================================================
// Shared types used across the event engine
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bar width of a candle series, named the way the Coinbase Advanced Trade
/// API names them.
///
/// The granularity decides both the refresh cadence of a polled series and
/// whether the series is carried by the streaming connection at all: the
/// `candles` channel only ever delivers five-minute bars.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    #[serde(alias = "1m")]
    OneMinute,
    #[serde(alias = "5m")]
    FiveMinute,
    #[serde(alias = "15m")]
    FifteenMinute,
    #[serde(alias = "30m")]
    ThirtyMinute,
    #[serde(alias = "1h")]
    OneHour,
    #[serde(alias = "2h")]
    TwoHour,
    #[serde(alias = "6h")]
    SixHour,
    #[serde(alias = "1d")]
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 8] = [
        Self::OneMinute,
        Self::FiveMinute,
        Self::FifteenMinute,
        Self::ThirtyMinute,
        Self::OneHour,
        Self::TwoHour,
        Self::SixHour,
        Self::OneDay,
    ];

    /// Width of one bar in seconds.
    pub fn seconds(self) -> u64 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinute => 300,
            Self::FifteenMinute => 900,
            Self::ThirtyMinute => 1_800,
            Self::OneHour => 3_600,
            Self::TwoHour => 7_200,
            Self::SixHour => 21_600,
            Self::OneDay => 86_400,
        }
    }

    /// Interval at which a polled series is refreshed.
    pub fn refresh_interval(self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Whether the streaming `candles` channel carries this granularity.
    pub fn is_streamed(self) -> bool {
        matches!(self, Self::FiveMinute)
    }

    /// Wire name, e.g. `ONE_HOUR`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "ONE_MINUTE",
            Self::FiveMinute => "FIVE_MINUTE",
            Self::FifteenMinute => "FIFTEEN_MINUTE",
            Self::ThirtyMinute => "THIRTY_MINUTE",
            Self::OneHour => "ONE_HOUR",
            Self::TwoHour => "TWO_HOUR",
            Self::SixHour => "SIX_HOUR",
            Self::OneDay => "ONE_DAY",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the per-condition results of one subscription are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLogic {
    #[serde(alias = "ANY")]
    Any,
    #[serde(alias = "ALL")]
    All,
}

impl Default for ConditionLogic {
    fn default() -> Self {
        Self::Any
    }
}

impl ConditionLogic {
    /// Combine per-condition flags. An empty set never satisfies either mode.
    pub fn combine(self, flags: impl IntoIterator<Item = bool>) -> bool {
        let mut iter = flags.into_iter().peekable();
        if iter.peek().is_none() {
            return false;
        }
        match self {
            Self::Any => iter.any(|f| f),
            Self::All => iter.all(|f| f),
        }
    }
}

impl std::fmt::Display for ConditionLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::All => write!(f, "all"),
        }
    }
}
