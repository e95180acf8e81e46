// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================
//
// SMA   = mean of the last `period` closes.
// EMA_t = close_t * k + EMA_{t-1} * (1 - k),   k = 2 / (period + 1)
//
// The first EMA value is seeded with the SMA of the first `period` closes, so
// an EMA series starts at index `period - 1` of its input.
// =============================================================================

/// Simple moving average of the last `period` closes.
pub fn calculate_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sma = window.iter().sum::<f64>() / period as f64;
    sma.is_finite().then_some(sma)
}

/// Full EMA series for `closes`.
///
/// Returns an empty `Vec` when the input is shorter than `period` or the
/// period is zero. A non-finite intermediate value truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }
    result
}

/// Most recent EMA value.
pub fn current_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}
