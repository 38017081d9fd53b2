// =============================================================================
// Candle series — per-instrument 1-minute bars and the 3-minute view
// =============================================================================
//
// Each subscribed symbol owns a ring of sealed 1-minute candles plus one
// in-progress bar that ticks update in place. When a tick lands in a new
// minute the in-progress bar seals into the ring and the ring trims to the
// retention cap.
//
// The signal engine consumes a derived 3-minute series: consecutive sealed
// 1-minute bars grouped by 3-minute boundary, OHLC = (open of first, max of
// highs, min of lows, close of last, sum of volumes). The IST offset is a
// whole multiple of 3 minutes, so grouping on the epoch clock aligns with
// IST boundaries.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const MINUTE_MS: i64 = 60_000;
const THREE_MINUTE_MS: i64 = 3 * MINUTE_MS;

/// A single OHLCV bar. Immutable once sealed into the ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, epoch milliseconds, aligned to the bar interval.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    fn seeded(open_time: i64, price: f64, volume: u64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn absorb(&mut self, price: f64, volume: u64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

// ---------------------------------------------------------------------------
// Single-instrument series
// ---------------------------------------------------------------------------

/// Ring of sealed 1-minute candles plus the current in-progress bar.
#[derive(Debug)]
pub struct CandleSeries {
    sealed: VecDeque<Candle>,
    current: Option<Candle>,
    max_bars: usize,
}

impl CandleSeries {
    pub fn new(max_bars: usize) -> Self {
        Self {
            sealed: VecDeque::with_capacity(max_bars + 1),
            current: None,
            max_bars,
        }
    }

    /// Fold one tick into the series. `ts` is the tick's epoch-millisecond
    /// timestamp; `volume` is the incremental traded volume attributed to
    /// this tick (zero for index feeds).
    pub fn apply_tick(&mut self, price: f64, volume: u64, ts: i64) {
        let bucket = ts - ts.rem_euclid(MINUTE_MS);

        match self.current.as_mut() {
            Some(bar) if bar.open_time == bucket => {
                bar.absorb(price, volume);
                return;
            }
            // Stale tick for an already-sealed minute: drop it.
            Some(bar) if bar.open_time > bucket => return,
            _ => {}
        }

        if let Some(sealed) = self.current.take() {
            self.push_sealed(sealed);
        }
        self.current = Some(Candle::seeded(bucket, price, volume));
    }

    /// Append a fully-formed sealed candle (used by recovery/backfill).
    pub fn push_sealed(&mut self, candle: Candle) {
        self.sealed.push_back(candle);
        while self.sealed.len() > self.max_bars {
            self.sealed.pop_front();
        }
    }

    /// Sealed 1-minute candles, oldest first.
    pub fn closed(&self) -> impl Iterator<Item = &Candle> {
        self.sealed.iter()
    }

    pub fn closed_count(&self) -> usize {
        self.sealed.len()
    }

    /// Close price of the most recent sealed bar.
    pub fn last_close(&self) -> Option<f64> {
        self.sealed.back().map(|c| c.close)
    }

    /// Derived 3-minute series over the sealed bars.
    pub fn three_minute(&self) -> Vec<Candle> {
        aggregate_three_minute(self.sealed.iter())
    }
}

/// Group sealed 1-minute candles into 3-minute bars by aligned boundary.
/// A group at the start or end of the window may hold fewer than three bars;
/// it still aggregates (open of first, extremes, close of last, volume sum).
pub fn aggregate_three_minute<'a>(candles: impl Iterator<Item = &'a Candle>) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();

    for candle in candles {
        let boundary = candle.open_time - candle.open_time.rem_euclid(THREE_MINUTE_MS);
        match out.last_mut() {
            Some(bar) if bar.open_time == boundary => {
                bar.high = bar.high.max(candle.high);
                bar.low = bar.low.min(candle.low);
                bar.close = candle.close;
                bar.volume += candle.volume;
            }
            _ => out.push(Candle {
                open_time: boundary,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
            }),
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Multi-instrument store
// ---------------------------------------------------------------------------

/// Default retention per instrument.
pub const DEFAULT_MAX_BARS: usize = 500;

/// Thread-safe collection of candle series keyed by symbol.
#[derive(Debug)]
pub struct CandleStore {
    series: RwLock<HashMap<String, CandleSeries>>,
    max_bars: usize,
}

impl CandleStore {
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    pub fn apply_tick(&self, symbol: &str, price: f64, volume: u64, ts: i64) {
        let mut map = self.series.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| CandleSeries::new(self.max_bars))
            .apply_tick(price, volume, ts);
    }

    /// Snapshot of the 3-minute aggregation for `symbol`.
    pub fn three_minute(&self, symbol: &str) -> Vec<Candle> {
        let map = self.series.read();
        map.get(symbol).map(|s| s.three_minute()).unwrap_or_default()
    }

    pub fn closed_count(&self, symbol: &str) -> usize {
        let map = self.series.read();
        map.get(symbol).map(|s| s.closed_count()).unwrap_or(0)
    }

    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        let map = self.series.read();
        map.get(symbol).and_then(|s| s.last_close())
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BARS)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, o: f64, h: f64, l: f64, c: f64, v: u64) -> Candle {
        Candle {
            open_time,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn ticks_build_minute_bars() {
        let mut series = CandleSeries::new(10);
        series.apply_tick(100.0, 5, 0);
        series.apply_tick(102.0, 5, 20_000);
        series.apply_tick(99.0, 5, 40_000);
        // New minute seals the first bar.
        series.apply_tick(101.0, 5, 60_000);

        assert_eq!(series.closed_count(), 1);
        let bar = series.closed().next().unwrap();
        assert_eq!(bar.open_time, 0);
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.high - 102.0).abs() < f64::EPSILON);
        assert!((bar.low - 99.0).abs() < f64::EPSILON);
        assert!((bar.close - 99.0).abs() < f64::EPSILON);
        assert_eq!(bar.volume, 15);
    }

    #[test]
    fn ring_trims_to_cap() {
        let mut series = CandleSeries::new(3);
        for minute in 0..6i64 {
            series.apply_tick(100.0 + minute as f64, 1, minute * 60_000);
        }
        assert_eq!(series.closed_count(), 3);
        let first = series.closed().next().unwrap();
        assert_eq!(first.open_time, 2 * 60_000);
    }

    #[test]
    fn stale_tick_does_not_reopen_a_sealed_minute() {
        let mut series = CandleSeries::new(10);
        series.apply_tick(100.0, 1, 60_000);
        series.apply_tick(101.0, 1, 120_000);
        // A frame from the already-sealed first minute arrives late.
        series.apply_tick(250.0, 1, 61_000);

        assert_eq!(series.closed_count(), 1);
        assert!((series.closed().next().unwrap().high - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn three_minute_aggregation_matches_reference() {
        // o=100 h=105 l=99 c=104 v=10 | o=104 h=108 l=103 c=107 v=20
        // | o=107 h=109 l=106 c=108 v=30  =>  o=100 h=109 l=99 c=108 v=60
        let bars = [
            candle(0, 100.0, 105.0, 99.0, 104.0, 10),
            candle(60_000, 104.0, 108.0, 103.0, 107.0, 20),
            candle(120_000, 107.0, 109.0, 106.0, 108.0, 30),
        ];
        let agg = aggregate_three_minute(bars.iter());

        assert_eq!(agg.len(), 1);
        let bar = &agg[0];
        assert!((bar.open - 100.0).abs() < f64::EPSILON);
        assert!((bar.high - 109.0).abs() < f64::EPSILON);
        assert!((bar.low - 99.0).abs() < f64::EPSILON);
        assert!((bar.close - 108.0).abs() < f64::EPSILON);
        assert_eq!(bar.volume, 60);
    }

    #[test]
    fn three_minute_volume_equals_window_sum() {
        let bars: Vec<Candle> = (0..9i64)
            .map(|i| candle(i * 60_000, 100.0, 101.0, 99.0, 100.5, (i + 1) as u64))
            .collect();
        let agg = aggregate_three_minute(bars.iter());

        assert_eq!(agg.len(), 3);
        assert_eq!(agg[0].volume, 1 + 2 + 3);
        assert_eq!(agg[1].volume, 4 + 5 + 6);
        assert_eq!(agg[2].volume, 7 + 8 + 9);
        // Open of first, close of last within each window.
        assert_eq!(agg[1].open_time, 180_000);
    }

    #[test]
    fn misaligned_start_creates_partial_first_group() {
        // Series starts on the middle minute of a 3-minute window.
        let bars = [
            candle(60_000, 100.0, 101.0, 99.0, 100.0, 5),
            candle(120_000, 100.0, 102.0, 100.0, 101.0, 5),
            candle(180_000, 101.0, 103.0, 101.0, 102.0, 5),
        ];
        let agg = aggregate_three_minute(bars.iter());

        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].open_time, 0);
        assert_eq!(agg[0].volume, 10);
        assert_eq!(agg[1].open_time, 180_000);
    }

    #[test]
    fn store_is_symbol_scoped() {
        let store = CandleStore::new(10);
        store.apply_tick("NIFTY", 24_500.0, 0, 0);
        store.apply_tick("NIFTY", 24_510.0, 0, 60_000);
        store.apply_tick("SENSEX", 81_000.0, 0, 0);

        assert_eq!(store.closed_count("NIFTY"), 1);
        assert_eq!(store.closed_count("SENSEX"), 0);
        assert_eq!(store.last_close("NIFTY"), Some(24_500.0));
        assert!(store.three_minute("BANKNIFTY").is_empty());
    }
}
