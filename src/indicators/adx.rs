// =============================================================================
// Average Directional Index (ADX) with DI+/DI−
// =============================================================================
//
// ADX quantifies trend strength regardless of direction. Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder-smooth all three over `period`.
//   3. +DI = 100 · smoothed(+DM)/smoothed(TR), -DI likewise.
//   4. DX = 100 · |+DI − -DI| / (+DI + -DI).
//   5. ADX = Wilder-smoothed DX over `period`.
//
// The signal gate compares ADX against its entry threshold; DI values are
// reported for status output.
// =============================================================================

use crate::candles::Candle;

/// Latest ADX reading plus the directional components behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxOutput {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Compute the most recent ADX from `candles` (oldest first).
///
/// Needs at least `2 * period + 1` candles: `period` transitions seed the
/// directional smoothing and another `period` DX values seed the ADX
/// average. Returns `None` below that, for `period == 0`, or when any
/// intermediate value is non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxOutput> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;

    // Raw directional movement and true range per bar transition.
    let transitions = candles.len() - 1;
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut true_range = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        true_range.push(tr);
    }

    // Wilder smoothing, seeded by plain sums over the first `period` bars.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = true_range[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(directional_index(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + true_range[i];
        dx_values.push(directional_index(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }
    if !adx.is_finite() {
        return None;
    }

    // Final DI values from the last smoothed state.
    if smooth_tr == 0.0 {
        return None;
    }
    let plus_di = 100.0 * smooth_plus / smooth_tr;
    let minus_di = 100.0 * smooth_minus / smooth_tr;

    Some(AdxOutput {
        adx,
        plus_di,
        minus_di,
    })
}

/// DX from the smoothed components. `None` when TR collapses to zero; zero
/// when there is no directional movement at all.
fn directional_index(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }
    let plus_di = 100.0 * smooth_plus / smooth_tr;
    let minus_di = 100.0 * smooth_minus / smooth_tr;
    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }
    let dx = 100.0 * (plus_di - minus_di).abs() / di_sum;
    dx.is_finite().then_some(dx)
}
