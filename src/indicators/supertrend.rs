// =============================================================================
// Supertrend — ATR-band trend overlay
// =============================================================================
//
// Bands around the bar midpoint:
//   basic upper = HL2 + multiplier · ATR
//   basic lower = HL2 − multiplier · ATR
//
// Final bands ratchet toward price: the upper band only moves down while
// price stays below it, the lower band only moves up while price stays above
// it. Direction flips to +1 when close crosses above the final upper band
// and to −1 when close crosses below the final lower band. The Supertrend
// line rides the lower band in an uptrend and the upper band in a downtrend.
// =============================================================================

use crate::candles::Candle;
use crate::indicators::atr::atr_series;

/// Latest Supertrend state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupertrendOutput {
    /// +1 above the line (bullish), −1 below it (bearish).
    pub direction: i8,
    /// Direction changed on the most recent bar.
    pub flipped: bool,
    /// Current Supertrend line value.
    pub line: f64,
}

/// Compute the most recent Supertrend state over `candles` (oldest first).
///
/// Needs `period + 2` candles: `period + 1` to seed the ATR plus one more
/// bar so a flip on the latest bar is observable. Returns `None` below that
/// or when the ATR is undefined.
pub fn calculate_supertrend(
    candles: &[Candle],
    period: usize,
    multiplier: f64,
) -> Option<SupertrendOutput> {
    if candles.len() < period + 2 {
        return None;
    }

    let atrs = atr_series(candles, period)?;
    // ATR series aligns to candles[period..].
    let bars = &candles[period..];
    debug_assert_eq!(atrs.len(), bars.len());

    let mut final_upper = f64::NAN;
    let mut final_lower = f64::NAN;
    let mut prev_close = candles[period - 1].close;
    let mut direction: i8 = 1;
    let mut prev_direction: i8 = 1;
    let mut line = 0.0;

    for (i, (bar, atr)) in bars.iter().zip(atrs.iter()).enumerate() {
        let hl2 = (bar.high + bar.low) / 2.0;
        let basic_upper = hl2 + multiplier * atr;
        let basic_lower = hl2 - multiplier * atr;

        // Band ratchet against the previous final bands.
        let upper = if i == 0 || basic_upper < final_upper || prev_close > final_upper {
            basic_upper
        } else {
            final_upper
        };
        let lower = if i == 0 || basic_lower > final_lower || prev_close < final_lower {
            basic_lower
        } else {
            final_lower
        };

        prev_direction = direction;
        direction = if i == 0 {
            if bar.close >= basic_lower { 1 } else { -1 }
        } else if bar.close > final_upper {
            1
        } else if bar.close < final_lower {
            -1
        } else {
            prev_direction
        };

        final_upper = upper;
        final_lower = lower;
        line = if direction > 0 { final_lower } else { final_upper };
        prev_close = bar.close;

        if !line.is_finite() {
            return None;
        }
    }

    Some(SupertrendOutput {
        direction,
        flipped: direction != prev_direction,
        line,
    })
}
