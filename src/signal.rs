// =============================================================================
// Signal gate — Supertrend flip × ADX strength
// =============================================================================
//
// Per symbol, per decision tick, exactly one of {BUY_CE, BUY_PE, NONE}:
//
//   BUY_CE  iff Supertrend just flipped −1 → +1 AND ADX ≥ threshold
//   BUY_PE  iff Supertrend just flipped +1 → −1 AND ADX ≥ threshold
//   NONE    otherwise
//
// A flip is consumed once: the gate remembers the last direction it saw per
// symbol, so repeated ticks on the same bar set yield NONE even while ADX
// stays strong. With insufficient history for either indicator the result is
// NONE.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::candles::Candle;
use crate::indicators::{calculate_adx, calculate_supertrend};
use crate::types::{OptionType, Signal, SignalKind};

/// Stateful gate; one instance serves every symbol.
#[derive(Debug)]
pub struct SignalEngine {
    supertrend_period: usize,
    supertrend_multiplier: f64,
    adx_period: usize,
    adx_threshold: f64,
    /// Last Supertrend direction observed per symbol. A flip relative to
    /// this map is what arms an entry; evaluating updates it, consuming the
    /// flip.
    last_direction: Mutex<HashMap<String, i8>>,
}

impl SignalEngine {
    pub fn new(
        supertrend_period: usize,
        supertrend_multiplier: f64,
        adx_period: usize,
        adx_threshold: f64,
    ) -> Self {
        Self {
            supertrend_period,
            supertrend_multiplier,
            adx_period,
            adx_threshold,
            last_direction: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate the gate for `symbol` over its 3-minute series.
    pub fn evaluate(&self, symbol: &str, candles: &[Candle]) -> Signal {
        let none = |direction: i8, adx: f64| Signal {
            symbol: symbol.to_string(),
            kind: SignalKind::None,
            adx,
            supertrend_direction: direction,
            at: Utc::now(),
        };

        let supertrend =
            match calculate_supertrend(candles, self.supertrend_period, self.supertrend_multiplier)
            {
                Some(st) => st,
                None => {
                    debug!(symbol, bars = candles.len(), "insufficient history for supertrend");
                    return none(0, 0.0);
                }
            };

        let adx = calculate_adx(candles, self.adx_period);
        let adx_value = adx.map(|a| a.adx).unwrap_or(0.0);

        // Flip detection against the per-symbol memory; reading and updating
        // under one lock consumes the flip exactly once.
        let flipped_to = {
            let mut last = self.last_direction.lock();
            let prev = last.insert(symbol.to_string(), supertrend.direction);
            match prev {
                Some(p) if p != supertrend.direction => Some(supertrend.direction),
                // First observation establishes the baseline, no signal.
                _ => None,
            }
        };

        let kind = match flipped_to {
            Some(1) if adx.is_some() && adx_value >= self.adx_threshold => SignalKind::BuyCe,
            Some(-1) if adx.is_some() && adx_value >= self.adx_threshold => SignalKind::BuyPe,
            Some(dir) => {
                debug!(
                    symbol,
                    direction = dir,
                    adx = adx_value,
                    threshold = self.adx_threshold,
                    "supertrend flip without ADX confirmation — consumed"
                );
                SignalKind::None
            }
            None => SignalKind::None,
        };

        if kind != SignalKind::None {
            info!(
                symbol,
                signal = %kind,
                adx = format!("{adx_value:.1}"),
                direction = supertrend.direction,
                "entry signal"
            );
        }

        Signal {
            symbol: symbol.to_string(),
            kind,
            adx: adx_value,
            supertrend_direction: supertrend.direction,
            at: Utc::now(),
        }
    }

    /// Last observed Supertrend direction for `symbol` (0 when never seen).
    pub fn current_direction(&self, symbol: &str) -> i8 {
        self.last_direction.lock().get(symbol).copied().unwrap_or(0)
    }

    /// Whether the current trend favours holding this option type: CE rides
    /// a bullish underlying, PE a bearish one.
    pub fn trend_favours(&self, symbol: &str, option_type: OptionType) -> bool {
        let dir = self.current_direction(symbol);
        match option_type {
            OptionType::Ce => dir > 0,
            OptionType::Pe => dir < 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1,
        }
    }

    fn falling(start: f64, step: f64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = start - i as f64 * step;
                candle(base, base + 1.0, base - 1.0, base - 0.5)
            })
            .collect()
    }

    fn rising(start: f64, step: f64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = start + i as f64 * step;
                candle(base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect()
    }

    fn engine() -> SignalEngine {
        SignalEngine::new(10, 3.0, 14, 25.0)
    }

    /// A long decline followed by a sharp rally: bearish baseline, then a
    /// bullish flip with strong ADX.
    fn reversal_series() -> (Vec<Candle>, Vec<Candle>) {
        let before = falling(300.0, 2.0, 40);
        let mut after = before.clone();
        after.extend(rising(222.0, 6.0, 15));
        (before, after)
    }

    #[test]
    fn insufficient_history_is_none() {
        let gate = engine();
        let signal = gate.evaluate("NIFTY", &rising(100.0, 1.0, 5));
        assert_eq!(signal.kind, SignalKind::None);
        assert_eq!(signal.supertrend_direction, 0);
    }

    #[test]
    fn first_observation_establishes_baseline_without_signal() {
        let gate = engine();
        let signal = gate.evaluate("NIFTY", &rising(100.0, 2.0, 40));
        assert_eq!(signal.kind, SignalKind::None);
        assert_eq!(gate.current_direction("NIFTY"), 1);
    }

    #[test]
    fn bullish_flip_with_strong_adx_buys_ce() {
        let gate = engine();
        let (before, after) = reversal_series();

        let baseline = gate.evaluate("NIFTY", &before);
        assert_eq!(baseline.kind, SignalKind::None);
        assert_eq!(baseline.supertrend_direction, -1);

        let signal = gate.evaluate("NIFTY", &after);
        assert_eq!(signal.kind, SignalKind::BuyCe);
        assert_eq!(signal.supertrend_direction, 1);
        assert!(signal.adx >= 25.0, "adx was {}", signal.adx);
    }

    #[test]
    fn bearish_flip_with_strong_adx_buys_pe() {
        let gate = engine();
        let mut before = rising(100.0, 2.0, 40);
        gate.evaluate("BANKNIFTY", &before);

        before.extend(falling(176.0, 6.0, 15));
        let signal = gate.evaluate("BANKNIFTY", &before);
        assert_eq!(signal.kind, SignalKind::BuyPe);
        assert_eq!(signal.supertrend_direction, -1);
    }

    #[test]
    fn flip_is_consumed_once() {
        let gate = engine();
        let (before, after) = reversal_series();

        gate.evaluate("NIFTY", &before);
        let first = gate.evaluate("NIFTY", &after);
        assert_eq!(first.kind, SignalKind::BuyCe);

        // Same bar set again: no new flip, no signal, ADX still strong.
        let second = gate.evaluate("NIFTY", &after);
        assert_eq!(second.kind, SignalKind::None);
        assert!(second.adx >= 25.0);
    }

    #[test]
    fn weak_adx_suppresses_and_still_consumes_the_flip() {
        let gate = SignalEngine::new(10, 3.0, 14, 99.0); // unreachable threshold
        let (before, after) = reversal_series();

        gate.evaluate("NIFTY", &before);
        let suppressed = gate.evaluate("NIFTY", &after);
        assert_eq!(suppressed.kind, SignalKind::None);

        // Flip was consumed even though no entry fired.
        let repeat = gate.evaluate("NIFTY", &after);
        assert_eq!(repeat.kind, SignalKind::None);
        assert_eq!(gate.current_direction("NIFTY"), 1);
    }

    #[test]
    fn symbols_are_independent() {
        let gate = engine();
        let (before, after) = reversal_series();

        gate.evaluate("NIFTY", &before);
        gate.evaluate("SENSEX", &after); // baseline only for SENSEX

        let nifty = gate.evaluate("NIFTY", &after);
        assert_eq!(nifty.kind, SignalKind::BuyCe);
        let sensex = gate.evaluate("SENSEX", &after);
        assert_eq!(sensex.kind, SignalKind::None);
    }

    #[test]
    fn trend_favours_maps_direction_to_leg() {
        let gate = engine();
        gate.evaluate("NIFTY", &rising(100.0, 2.0, 40));
        assert!(gate.trend_favours("NIFTY", OptionType::Ce));
        assert!(!gate.trend_favours("NIFTY", OptionType::Pe));
        // Unknown symbol favours nothing.
        assert!(!gate.trend_favours("BANKNIFTY", OptionType::Ce));
    }
}
