// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// Wilder smoothing:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// The Supertrend band calculation consumes the full ATR series, so this
// module exposes both the series and the latest value.
// =============================================================================

use crate::candles::Candle;

/// Full ATR series aligned to `candles[period..]` (the first ATR value
/// corresponds to the candle at index `period`).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// candles, or an intermediate value is non-finite.
pub fn atr_series(candles: &[Candle], period: usize) -> Option<Vec<f64>> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let high = pair[1].high;
        let low = pair[1].low;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let period_f = period as f64;
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut series = Vec::with_capacity(tr_values.len() - period + 1);
    series.push(seed);

    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
        series.push(atr);
    }

    Some(series)
}

/// Most recent ATR value.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).and_then(|s| s.last().copied())
}
