// =============================================================================
// Broker interface — one contract, two implementations
// =============================================================================
//
// `Broker::place_order` is the single seam between decision/risk logic and
// execution. The paper implementation settles against the tick cache and the
// simulated wallet; the live implementation forwards to the broker API. Both
// observe the same idempotency contract: at most one outstanding action per
// (security_id, side, quantity, intent) within a 10-second window.
// =============================================================================

pub mod dhan;
pub mod live;
pub mod paper;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::positions::ContractMeta;
use crate::session::ist_timestamp;
use crate::store::{keys, ttl, KvStore};
use crate::types::{SecurityId, Segment, Side};

pub use dhan::{DhanClient, DhanError, OrderGateway};
pub use live::LiveBroker;
pub use paper::PaperBroker;

// ---------------------------------------------------------------------------
// Request / result / record
// ---------------------------------------------------------------------------

/// An order the engine wants executed.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub underlying_symbol: String,
    pub security_id: SecurityId,
    pub segment: Segment,
    pub side: Side,
    pub quantity: i64,
    /// Reference price. Paper fills settle at the cached LTP regardless;
    /// live orders go out as MARKET and this is only a sizing reference.
    pub price: Money,
    /// Why this order exists — "entry", "exit-emergency", … Part of the
    /// idempotency key.
    pub intent: String,
    /// Contract details, required on entries to open the position record.
    pub meta: Option<ContractMeta>,
}

/// Successful execution.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub fill_price: Money,
}

/// The persisted order record (`order:{id}`), immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub security_id: SecurityId,
    pub side: Side,
    pub quantity: i64,
    pub average_price: Money,
    pub timestamp: String,
}

impl OrderRecord {
    pub fn new(id: &str, request: &OrderRequest, fill_price: Money) -> Self {
        Self {
            id: id.to_string(),
            security_id: request.security_id.clone(),
            side: request.side,
            quantity: request.quantity,
            average_price: fill_price,
            timestamp: ist_timestamp(),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.clone()),
            ("security_id".into(), self.security_id.clone()),
            ("side".into(), self.side.to_string()),
            ("quantity".into(), self.quantity.to_string()),
            ("average_price".into(), self.average_price.to_string()),
            ("timestamp".into(), self.timestamp.clone()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Mode-pluggable execution seam.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Execute a market order. Errors are values — they never panic through
    /// the scheduler.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult>;
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Claim the idempotency slot for `request`, or fail with `Duplicate` when
/// an identical action was issued within the window.
pub(crate) async fn claim_idempotency(
    store: &Arc<dyn KvStore>,
    request: &OrderRequest,
) -> Result<()> {
    let action = format!(
        "{}|{}|{}|{}",
        request.security_id, request.side, request.quantity, request.intent
    );
    let digest = hex::encode(&Sha256::digest(action.as_bytes())[..16]);

    let claimed = store
        .set_nx_ex(&keys::dedupe(&digest), &ist_timestamp(), ttl::DEDUPE)
        .await?;
    if claimed {
        Ok(())
    } else {
        Err(ScalperError::Duplicate(action))
    }
}

/// Persist the order record hash.
pub(crate) async fn record_order(store: &Arc<dyn KvStore>, record: &OrderRecord) -> Result<()> {
    store
        .hash_set_all(&keys::order(&record.id), &record.to_fields(), None)
        .await
}

// ---------------------------------------------------------------------------
// Order journal — in-memory ring for reports and status output
// ---------------------------------------------------------------------------

const JOURNAL_CAP: usize = 200;

/// Ring buffer of the session's orders, shared between the broker and the
/// session reporter.
#[derive(Debug, Default)]
pub struct OrderJournal {
    entries: Mutex<VecDeque<OrderRecord>>,
}

impl OrderJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: OrderRecord) {
        let mut entries = self.entries.lock();
        entries.push_back(record);
        while entries.len() > JOURNAL_CAP {
            entries.pop_front();
        }
    }

    /// Snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<OrderRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request(intent: &str) -> OrderRequest {
        OrderRequest {
            underlying_symbol: "NIFTY".into(),
            security_id: "42501".into(),
            segment: Segment::NseFno,
            side: Side::Sell,
            quantity: 75,
            price: Money::from_rupees(100),
            intent: intent.into(),
            meta: None,
        }
    }

    #[tokio::test]
    async fn identical_actions_within_window_are_duplicates() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        claim_idempotency(&store, &request("exit-emergency")).await.unwrap();
        let err = claim_idempotency(&store, &request("exit-emergency"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScalperError::Duplicate(_)));
    }

    #[tokio::test]
    async fn different_intent_is_a_different_action() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        claim_idempotency(&store, &request("exit-emergency")).await.unwrap();
        claim_idempotency(&store, &request("exit-trailing_stop")).await.unwrap();
    }

    #[tokio::test]
    async fn window_expiry_releases_the_slot() {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn KvStore> = mem.clone();

        claim_idempotency(&store, &request("entry")).await.unwrap();

        // Simulate the 10-second TTL lapsing.
        let action = "42501|SELL|75|entry";
        let digest = hex::encode(&Sha256::digest(action.as_bytes())[..16]);
        mem.force_expire(&keys::dedupe(&digest));

        claim_idempotency(&store, &request("entry")).await.unwrap();
    }

    #[test]
    fn journal_caps_and_orders_oldest_first() {
        let journal = OrderJournal::new();
        for i in 0..(JOURNAL_CAP + 10) {
            journal.push(OrderRecord {
                id: format!("P-{i}"),
                security_id: "42501".into(),
                side: Side::Buy,
                quantity: 75,
                average_price: Money::from_rupees(100),
                timestamp: String::new(),
            });
        }
        let snap = journal.snapshot();
        assert_eq!(snap.len(), JOURNAL_CAP);
        assert_eq!(snap.first().unwrap().id, "P-10");
        assert_eq!(snap.last().unwrap().id, format!("P-{}", JOURNAL_CAP + 9));
    }
}
