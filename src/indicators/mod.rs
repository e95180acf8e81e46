// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure functions over closes or OHLC candles. Every entry point returns
// `Option` / an empty series so callers handle short history explicitly.
//
// `Indicator` is the catalogue the trigger conditions reference by name. Each
// variant knows its default period, how many candles it should be fed, and
// how to reduce a candle window to a single value.
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod macd;
pub mod moving_average;
pub mod roc;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Indicator {
    Sma,
    Ema,
    Rsi,
    Macd,
    MacdSignal,
    MacdHistogram,
    BollingerUpper,
    BollingerMiddle,
    BollingerLower,
    BollingerPercentB,
    Atr,
    Adx,
    Roc,
}

impl Indicator {
    /// Period used when a condition does not give one. MACD variants always
    /// use 12 / 26 / 9 and ignore the period.
    pub fn default_period(self) -> usize {
        match self {
            Self::Sma | Self::Ema => 20,
            Self::Rsi | Self::Atr | Self::Adx => 14,
            Self::Macd | Self::MacdSignal | Self::MacdHistogram => macd::DEFAULT_SLOW,
            Self::BollingerUpper
            | Self::BollingerMiddle
            | Self::BollingerLower
            | Self::BollingerPercentB => bollinger::DEFAULT_PERIOD,
            Self::Roc => 12,
        }
    }

    /// Candles to request for this indicator: the minimum needed for one
    /// value plus warm-up for the smoothed ones.
    pub fn lookback(self, period: Option<usize>) -> usize {
        let p = self.effective_period(period);
        match self {
            Self::Sma
            | Self::BollingerUpper
            | Self::BollingerMiddle
            | Self::BollingerLower
            | Self::BollingerPercentB => p,
            Self::Ema => p.saturating_mul(2),
            Self::Rsi | Self::Atr => p.saturating_mul(2).saturating_add(1),
            Self::Adx => p.saturating_mul(3).saturating_add(1),
            Self::Roc => p.saturating_add(1),
            Self::Macd | Self::MacdSignal | Self::MacdHistogram => {
                2 * macd::DEFAULT_SLOW + macd::DEFAULT_SIGNAL
            }
        }
    }

    /// Reduce `candles` (oldest first) to the indicator's latest value.
    /// `None` when the window is too short or the math degenerates.
    pub fn compute(self, candles: &[Candle], period: Option<usize>) -> Option<f64> {
        let p = self.effective_period(period);
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        match self {
            Self::Sma => moving_average::calculate_sma(&closes, p),
            Self::Ema => moving_average::current_ema(&closes, p),
            Self::Rsi => rsi::current_rsi(&closes, p),
            Self::Macd | Self::MacdSignal | Self::MacdHistogram => {
                let r = macd::calculate_macd(
                    &closes,
                    macd::DEFAULT_FAST,
                    macd::DEFAULT_SLOW,
                    macd::DEFAULT_SIGNAL,
                )?;
                Some(match self {
                    Self::Macd => r.macd,
                    Self::MacdSignal => r.signal,
                    _ => r.histogram,
                })
            }
            Self::BollingerUpper
            | Self::BollingerMiddle
            | Self::BollingerLower
            | Self::BollingerPercentB => {
                let bb = bollinger::calculate_bollinger(&closes, p, bollinger::DEFAULT_NUM_STD)?;
                match self {
                    Self::BollingerUpper => Some(bb.upper),
                    Self::BollingerMiddle => Some(bb.middle),
                    Self::BollingerLower => Some(bb.lower),
                    _ => bb.percent_b,
                }
            }
            Self::Atr => atr::calculate_atr(candles, p),
            Self::Adx => adx::calculate_adx(candles, p),
            Self::Roc => roc::current_roc(&closes, p),
        }
    }

    fn effective_period(self, period: Option<usize>) -> usize {
        match period {
            Some(p) if p > 0 => p,
            _ => self.default_period(),
        }
    }
}

impl std::fmt::Display for Indicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{name}")
    }
}
