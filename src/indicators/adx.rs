// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
//   1. +DM / -DM and TR per bar.
//   2. Wilder-smooth each over `period`.
//   3. +DI = sm(+DM) / sm(TR) * 100,  -DI = sm(-DM) / sm(TR) * 100
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   5. ADX = Wilder average of DX over `period`.
//
// ADX measures trend strength regardless of direction.
// =============================================================================

use super::atr::true_ranges;
use crate::market_data::Candle;

/// Most recent ADX. Needs `2 * period + 1` candles.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let (plus_dm, minus_dm): (Vec<f64>, Vec<f64>) = candles
        .windows(2)
        .map(|w| {
            let up = w[1].high - w[0].high;
            let down = w[0].low - w[1].low;
            let pdm = if up > down && up > 0.0 { up } else { 0.0 };
            let mdm = if down > up && down > 0.0 { down } else { 0.0 };
            (pdm, mdm)
        })
        .unzip();
    let tr = true_ranges(candles);

    let period_f = period as f64;
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(tr.len() - period + 1);
    dx_values.push(compute_dx(sm_plus, sm_minus, sm_tr)?);

    for i in period..tr.len() {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr[i];
        dx_values.push(compute_dx(sm_plus, sm_minus, sm_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }
    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }
    adx.is_finite().then_some(adx)
}

/// `None` on a zero true range; zero directional movement reads as DX 0.
fn compute_dx(sm_plus: f64, sm_minus: f64, sm_tr: f64) -> Option<f64> {
    if sm_tr == 0.0 {
        return None;
    }
    let plus_di = sm_plus / sm_tr * 100.0;
    let minus_di = sm_minus / sm_tr * 100.0;
    let sum = plus_di + minus_di;
    if sum == 0.0 {
        return Some(0.0);
    }
    let dx = (plus_di - minus_di).abs() / sum * 100.0;
    dx.is_finite().then_some(dx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            product_id: "ETH-USD".into(),
            start: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn adx_insufficient_data() {
        let candles: Vec<Candle> = (0..28).map(|i| bar(i as f64 + 1.0, i as f64, i as f64)).collect();
        assert!(calculate_adx(&candles, 14).is_none());
    }

    #[test]
    fn adx_strong_trend_is_high() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx > 50.0, "steady uptrend should read strong, got {adx}");
    }

    #[test]
    fn adx_flat_bars_have_no_value() {
        let candles = vec![bar(100.0, 100.0, 100.0); 40];
        assert!(calculate_adx(&candles, 14).is_none());
    }
}
