// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(period), upper / lower = middle ± k·σ (population σ).
// %B = (close - lower) / (upper - lower): 0 at the lower band, 1 at the upper.
// =============================================================================

pub const DEFAULT_PERIOD: usize = 20;
pub const DEFAULT_NUM_STD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// `None` when the bands have collapsed (zero width).
    pub percent_b: Option<f64>,
}

/// Bands over the last `period` closes.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    if !(upper.is_finite() && lower.is_finite()) {
        return None;
    }

    let last = *window.last()?;
    let width = upper - lower;
    let percent_b = (width > 0.0).then(|| (last - lower) / width);

    Some(BollingerResult {
        upper,
        middle,
        lower,
        percent_b,
    })
}
