// =============================================================================
// Key-value store seam — Redis in production, in-memory in tests
// =============================================================================
//
// Everything the engine persists (wallet, positions, orders, session reports,
// peak/trigger ratchets, trend flags, dedupe markers) goes through the
// `KvStore` trait. `RedisStore` is the production implementation;
// `MemoryStore` implements the identical contract for hermetic tests.
// =============================================================================

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Key namespace prefix shared by every persisted key.
pub const NAMESPACE: &str = "dhan_scalper:v1";

/// TTLs, seconds.
pub mod ttl {
    /// Balance hash — a full trading day plus slack.
    pub const BALANCE: u64 = 24 * 60 * 60;
    /// Peak / trigger ratchet values.
    pub const PEAK: u64 = 60 * 60;
    /// Trend ON/OFF flag.
    pub const TREND: u64 = 5 * 60;
    /// Idempotency markers.
    pub const DEDUPE: u64 = 10;
}

/// Canonical key builders. Layout:
///
/// ```text
/// dhan_scalper:v1:balance:{session_id}
/// dhan_scalper:v1:position:{position_id}
/// dhan_scalper:v1:positions:{session_id}
/// dhan_scalper:v1:order:{order_id}
/// dhan_scalper:v1:session:{session_id}
/// dhan_scalper:v1:session_meta:{session_id}
/// dhan_scalper:v1:peak:{security_id}
/// dhan_scalper:v1:trigger:{security_id}
/// dhan_scalper:v1:trend:{security_id}
/// dhan_scalper:v1:dedupe:{action_key}
/// ```
pub mod keys {
    use super::NAMESPACE;

    pub fn balance(session_id: &str) -> String {
        format!("{NAMESPACE}:balance:{session_id}")
    }

    pub fn position(position_id: &str) -> String {
        format!("{NAMESPACE}:position:{position_id}")
    }

    pub fn positions(session_id: &str) -> String {
        format!("{NAMESPACE}:positions:{session_id}")
    }

    pub fn order(order_id: &str) -> String {
        format!("{NAMESPACE}:order:{order_id}")
    }

    pub fn session(session_id: &str) -> String {
        format!("{NAMESPACE}:session:{session_id}")
    }

    pub fn session_meta(session_id: &str) -> String {
        format!("{NAMESPACE}:session_meta:{session_id}")
    }

    pub fn peak(security_id: &str) -> String {
        format!("{NAMESPACE}:peak:{security_id}")
    }

    pub fn trigger(security_id: &str) -> String {
        format!("{NAMESPACE}:trigger:{security_id}")
    }

    pub fn trend(security_id: &str) -> String {
        format!("{NAMESPACE}:trend:{security_id}")
    }

    pub fn dedupe(action_key: &str) -> String {
        format!("{NAMESPACE}:dedupe:{action_key}")
    }
}

/// Typed key-value operations the engine relies on.
///
/// The two ratchet operations are the only compound writes; on Redis they run
/// as Lua scripts so peak/trigger values advance atomically and only upward.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Replace every field of a hash; optionally (re)set its TTL.
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: Option<u64>,
    ) -> Result<()>;

    /// All fields of a hash. Empty map when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn set_string(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// SET NX EX — returns true when the marker was absent and has been
    /// placed. The idempotency primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Store `value` iff the key is absent or `value` is strictly greater
    /// than the current number. Returns whether the write happened.
    async fn ratchet_max(&self, key: &str, value: f64, ttl_secs: u64) -> Result<bool>;

    /// Store `value` iff the key is absent or `value` exceeds the current
    /// number by at least `min_step`. Returns whether the write happened.
    async fn ratchet_step(&self, key: &str, value: f64, min_step: f64, ttl_secs: u64)
        -> Result<bool>;
}
