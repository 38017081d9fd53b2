// =============================================================================
// In-memory KvStore — the hermetic test double
// =============================================================================
//
// Implements the exact `KvStore` contract, including NX-with-expiry and the
// ratchet semantics, against a process-local map. TTLs are honoured lazily:
// an expired entry is treated as absent on its next access.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::KvStore;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

/// Process-local store with `KvStore` semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl_secs: Option<u64>) -> Option<Instant> {
        ttl_secs.map(|s| Instant::now() + Duration::from_secs(s))
    }

    /// Fetch a live entry, dropping it if expired.
    fn take_live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        if let Some(entry) = entries.get(key) {
            if !entry.live() {
                entries.remove(key);
                return None;
            }
        }
        entries.get_mut(key)
    }

    /// Test hook: expire a key immediately, simulating TTL lapse.
    pub fn force_expire(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        let map: HashMap<String, String> = fields.iter().cloned().collect();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(map),
                expires_at: Self::deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut entries = self.entries.lock();
        match Self::take_live(&mut entries, key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match Self::take_live(&mut entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        match Self::take_live(&mut entries, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
            }
            _ => {
                let mut set = HashSet::new();
                set.insert(member.to_string());
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(set),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            value: Value::Set(set),
            ..
        }) = Self::take_live(&mut entries, key)
        {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        match Self::take_live(&mut entries, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::take_live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::deadline(Some(ttl_secs)),
            },
        );
        Ok(true)
    }

    async fn ratchet_max(&self, key: &str, value: f64, ttl_secs: u64) -> Result<bool> {
        self.ratchet_step(key, value, 0.0, ttl_secs).await
    }

    async fn ratchet_step(
        &self,
        key: &str,
        value: f64,
        min_step: f64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();

        let current = match Self::take_live(&mut entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => s.parse::<f64>().ok(),
            _ => None,
        };

        let advance = match current {
            None => true,
            // Step of zero means "any strictly upward move".
            Some(cur) if min_step == 0.0 => value > cur,
            Some(cur) => value - cur >= min_step,
        };

        if advance {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(format!("{value}")),
                    expires_at: Self::deadline(Some(ttl_secs)),
                },
            );
        }
        Ok(advance)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_round_trip() {
        let store = MemoryStore::new();
        let fields = vec![
            ("available".to_string(), "92480.00".to_string()),
            ("used".to_string(), "7520.00".to_string()),
        ];
        store.hash_set_all("k", &fields, Some(60)).await.unwrap();

        let got = store.hash_get_all("k").await.unwrap();
        assert_eq!(got.get("available").unwrap(), "92480.00");
        assert_eq!(got.len(), 2);

        assert!(store.hash_get_all("absent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_membership() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "b").await.unwrap();
        store.set_add("s", "a").await.unwrap();

        let mut members = store.set_members("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        store.set_remove("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn nx_blocks_within_window() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("dedupe", "1", 10).await.unwrap());
        assert!(!store.set_nx_ex("dedupe", "1", 10).await.unwrap());

        store.force_expire("dedupe");
        assert!(store.set_nx_ex("dedupe", "1", 10).await.unwrap());
    }

    #[tokio::test]
    async fn ratchet_max_only_advances() {
        let store = MemoryStore::new();
        assert!(store.ratchet_max("peak", 100.0, 60).await.unwrap());
        assert!(store.ratchet_max("peak", 115.0, 60).await.unwrap());
        assert!(!store.ratchet_max("peak", 110.0, 60).await.unwrap());
        assert!(!store.ratchet_max("peak", 115.0, 60).await.unwrap());

        assert_eq!(store.get_string("peak").await.unwrap().unwrap(), "115");
    }

    #[tokio::test]
    async fn ratchet_step_enforces_minimum_improvement() {
        let store = MemoryStore::new();
        assert!(store.ratchet_step("trigger", 109.50, 3.0, 60).await.unwrap());
        // +0.13 — below the step.
        assert!(!store.ratchet_step("trigger", 109.63, 3.0, 60).await.unwrap());
        // +3.55 — accepted.
        assert!(store.ratchet_step("trigger", 113.05, 3.0, 60).await.unwrap());
    }
}
