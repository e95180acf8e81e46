// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = mean of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Candle;

/// True range of each bar against its predecessor (`candles.len() - 1`
/// values).
pub(crate) fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect()
}

/// Most recent ATR. Needs `period + 1` candles.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let tr = true_ranges(candles);
    let period_f = period as f64;
    let mut atr = tr[..period].iter().sum::<f64>() / period_f;
    for &value in &tr[period..] {
        atr = (atr * (period_f - 1.0) + value) / period_f;
    }
    atr.is_finite().then_some(atr)
}
