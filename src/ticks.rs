// =============================================================================
// Tick cache — process-local latest-tick map
// =============================================================================
//
// Concurrent map from (segment, security_id) to the most recent tick. The
// feed ingestor writes, the risk loop and signal engine read; neither side
// blocks the other. Last-writer-wins per key, ordered by exchange timestamp,
// so a late frame never regresses the cache.
//
// No persistence: market data is reconstructed from the feed on reconnect.
// =============================================================================

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::money::Money;
use crate::session::epoch_millis;
use crate::types::{SecurityId, Segment, Tick};

/// Key type for the cache.
pub type TickKey = (Segment, SecurityId);

/// Process-wide latest-tick cache.
#[derive(Debug, Default)]
pub struct TickCache {
    map: DashMap<TickKey, Tick>,
}

impl TickCache {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Insert `tick`, discarding it if a newer tick for the same key is
    /// already cached.
    pub fn put(&self, tick: Tick) {
        let key = (tick.segment, tick.security_id.clone());
        match self.map.entry(key) {
            Entry::Occupied(mut existing) => {
                if tick.ts >= existing.get().ts {
                    existing.insert(tick);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(tick);
            }
        }
    }

    /// Latest tick for the instrument, if any has arrived.
    pub fn get(&self, segment: Segment, security_id: &str) -> Option<Tick> {
        self.map
            .get(&(segment, security_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Latest traded price for the instrument.
    pub fn ltp(&self, segment: Segment, security_id: &str) -> Option<Money> {
        self.get(segment, security_id).map(|t| t.ltp)
    }

    /// Age of the latest tick in seconds, by wall clock. `None` when no tick
    /// has ever arrived.
    pub fn age_secs(&self, segment: Segment, security_id: &str) -> Option<u64> {
        self.get(segment, security_id)
            .map(|t| ((epoch_millis() - t.ts).max(0) as u64) / 1000)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(security_id: &str, ltp: f64, ts: i64) -> Tick {
        Tick::ltp_only(Segment::NseFno, security_id, Money::from_f64(ltp), ts)
    }

    #[test]
    fn put_then_get() {
        let cache = TickCache::new();
        cache.put(tick("42501", 104.50, 1_000));

        let got = cache.get(Segment::NseFno, "42501").unwrap();
        assert_eq!(got.ltp, Money::from_f64(104.50));
        assert_eq!(cache.ltp(Segment::NseFno, "42501"), Some(Money::from_f64(104.50)));
    }

    #[test]
    fn missing_key_is_none() {
        let cache = TickCache::new();
        assert!(cache.get(Segment::NseFno, "99999").is_none());
        assert!(cache.ltp(Segment::IdxI, "13").is_none());
    }

    #[test]
    fn newer_timestamp_wins() {
        let cache = TickCache::new();
        cache.put(tick("42501", 100.0, 1_000));
        cache.put(tick("42501", 105.0, 2_000));

        assert_eq!(cache.ltp(Segment::NseFno, "42501"), Some(Money::from_f64(105.0)));
    }

    #[test]
    fn older_timestamp_is_discarded() {
        let cache = TickCache::new();
        cache.put(tick("42501", 105.0, 2_000));
        cache.put(tick("42501", 100.0, 1_000));

        assert_eq!(cache.ltp(Segment::NseFno, "42501"), Some(Money::from_f64(105.0)));
    }

    #[test]
    fn keys_are_segment_scoped() {
        let cache = TickCache::new();
        cache.put(Tick::ltp_only(Segment::IdxI, "13", Money::from_f64(24_500.0), 1_000));
        cache.put(Tick::ltp_only(Segment::NseFno, "13", Money::from_f64(180.0), 1_000));

        assert_eq!(cache.ltp(Segment::IdxI, "13"), Some(Money::from_f64(24_500.0)));
        assert_eq!(cache.ltp(Segment::NseFno, "13"), Some(Money::from_f64(180.0)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_writers_do_not_lose_the_newest() {
        use std::sync::Arc;

        let cache = Arc::new(TickCache::new());
        let mut handles = Vec::new();
        for writer in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000i64 {
                    cache.put(tick("42501", i as f64, i * 8 + writer));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Highest timestamp across all writers is 999*8+7.
        let last = cache.get(Segment::NseFno, "42501").unwrap();
        assert_eq!(last.ts, 999 * 8 + 7);
    }
}
