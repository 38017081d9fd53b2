// =============================================================================
// Session reporter — PnL and position snapshots at checkpoints and shutdown
// =============================================================================
//
// Serialises the session's wallet, open positions, and order journal into
// `session:{session_id}` (JSON) plus a small `session_meta:{session_id}`
// hash for quick listing, and logs a one-line summary. The reporter only
// reads; it never mutates trading state.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::{OrderJournal, OrderRecord};
use crate::money::Money;
use crate::positions::PositionTracker;
use crate::session::ist_timestamp;
use crate::store::{keys, KvStore};
use crate::wallet::PaperWallet;

/// One open position as reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub security_id: String,
    pub underlying_symbol: String,
    pub option_type: String,
    pub strike: i64,
    pub net_qty: i64,
    pub buy_avg: Money,
    pub current_price: Money,
    pub unrealized_pnl: Money,
}

/// PnL rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlSummary {
    pub starting_balance: Money,
    pub available: Money,
    pub used: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    /// starting + realised + unrealised.
    pub total: Money,
}

/// Full persisted session report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub positions: Vec<PositionSnapshot>,
    pub orders: Vec<OrderRecord>,
    pub pnl: PnlSummary,
}

/// Builds and persists session reports.
pub struct SessionReporter {
    store: Arc<dyn KvStore>,
    wallet: Arc<PaperWallet>,
    positions: Arc<PositionTracker>,
    journal: Arc<OrderJournal>,
    session_id: String,
    start_time: String,
}

impl SessionReporter {
    pub fn new(
        store: Arc<dyn KvStore>,
        wallet: Arc<PaperWallet>,
        positions: Arc<PositionTracker>,
        journal: Arc<OrderJournal>,
        session_id: &str,
    ) -> Self {
        Self {
            store,
            wallet,
            positions,
            journal,
            session_id: session_id.to_string(),
            start_time: ist_timestamp(),
        }
    }

    /// Assemble the current report without persisting it.
    pub async fn build(&self, closing: bool) -> SessionReport {
        let balance = self.wallet.snapshot().await;
        let open = self.positions.all().await;

        let unrealized = open
            .iter()
            .fold(Money::ZERO, |acc, p| acc + p.unrealized_pnl);

        let positions = open
            .into_iter()
            .map(|p| PositionSnapshot {
                security_id: p.security_id,
                underlying_symbol: p.underlying_symbol,
                option_type: p.option_type.to_string(),
                strike: p.strike,
                net_qty: p.net_qty,
                buy_avg: p.buy_avg,
                current_price: p.current_price,
                unrealized_pnl: p.unrealized_pnl,
            })
            .collect();

        SessionReport {
            session_id: self.session_id.clone(),
            start_time: self.start_time.clone(),
            end_time: closing.then(ist_timestamp),
            positions,
            orders: self.journal.snapshot(),
            pnl: PnlSummary {
                starting_balance: balance.starting_balance,
                available: balance.available,
                used: balance.used,
                realized_pnl: balance.realized_pnl,
                unrealized_pnl: unrealized,
                total: balance.starting_balance + balance.realized_pnl + unrealized,
            },
        }
    }

    /// Persist a checkpoint snapshot.
    pub async fn checkpoint(&self) -> crate::error::Result<SessionReport> {
        self.persist(false).await
    }

    /// Persist the final snapshot with an end time.
    pub async fn finalise(&self) -> crate::error::Result<SessionReport> {
        self.persist(true).await
    }

    async fn persist(&self, closing: bool) -> crate::error::Result<SessionReport> {
        let report = self.build(closing).await;

        let json = serde_json::to_string(&report).map_err(|e| {
            crate::error::ScalperError::ConfigInvalid(format!("report serialisation failed: {e}"))
        })?;
        self.store
            .set_string(&keys::session(&self.session_id), &json, None)
            .await?;

        let meta = vec![
            ("session_id".to_string(), report.session_id.clone()),
            ("start_time".to_string(), report.start_time.clone()),
            (
                "end_time".to_string(),
                report.end_time.clone().unwrap_or_default(),
            ),
            ("realized_pnl".to_string(), report.pnl.realized_pnl.to_string()),
            ("total".to_string(), report.pnl.total.to_string()),
            (
                "open_positions".to_string(),
                report.positions.len().to_string(),
            ),
            ("orders".to_string(), report.orders.len().to_string()),
        ];
        self.store
            .hash_set_all(&keys::session_meta(&self.session_id), &meta, None)
            .await?;

        info!(
            session_id = %self.session_id,
            realized = %report.pnl.realized_pnl,
            unrealized = %report.pnl.unrealized_pnl,
            total = %report.pnl.total.format(),
            open_positions = report.positions.len(),
            orders = report.orders.len(),
            closing,
            "session snapshot persisted"
        );

        Ok(report)
    }
}

impl std::fmt::Debug for SessionReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReporter")
            .field("session_id", &self.session_id)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::{ContractMeta, PositionKey};
    use crate::store::MemoryStore;
    use crate::types::{OptionType, Segment};

    async fn reporter_rig() -> (SessionReporter, Arc<PositionTracker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KvStore> = store.clone();
        let wallet = Arc::new(
            PaperWallet::load_or_init(kv.clone(), "PAPER_20260803", Money::from_rupees(100_000))
                .await
                .unwrap(),
        );
        let positions = Arc::new(PositionTracker::new(kv.clone(), "PAPER_20260803"));
        let journal = Arc::new(OrderJournal::new());
        let reporter = SessionReporter::new(kv, wallet, positions.clone(), journal, "PAPER_20260803");
        (reporter, positions, store)
    }

    #[tokio::test]
    async fn checkpoint_persists_json_and_meta() {
        let (reporter, positions, store) = reporter_rig().await;

        positions
            .add_position(
                PositionKey::long(Segment::NseFno, "42501"),
                75,
                Money::from_rupees(100),
                ContractMeta {
                    option_type: OptionType::Ce,
                    strike: 24_500,
                    expiry: "2026-08-06".into(),
                    underlying_symbol: "NIFTY".into(),
                },
            )
            .await
            .unwrap();

        let report = reporter.checkpoint().await.unwrap();
        assert_eq!(report.positions.len(), 1);
        assert!(report.end_time.is_none());
        assert_eq!(report.pnl.starting_balance, Money::from_rupees(100_000));

        let json = store
            .get_string(&keys::session("PAPER_20260803"))
            .await
            .unwrap()
            .unwrap();
        let parsed: SessionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, "PAPER_20260803");
        assert_eq!(parsed.positions[0].strike, 24_500);

        let meta = store
            .hash_get_all(&keys::session_meta("PAPER_20260803"))
            .await
            .unwrap();
        assert_eq!(meta.get("open_positions").unwrap(), "1");
    }

    #[tokio::test]
    async fn finalise_stamps_end_time() {
        let (reporter, _, _) = reporter_rig().await;
        let report = reporter.finalise().await.unwrap();
        assert!(report.end_time.is_some());
    }

    #[tokio::test]
    async fn total_reflects_unrealized() {
        let (reporter, positions, _) = reporter_rig().await;
        let key = PositionKey::long(Segment::NseFno, "42501");
        positions
            .add_position(
                key.clone(),
                75,
                Money::from_rupees(100),
                ContractMeta {
                    option_type: OptionType::Ce,
                    strike: 24_500,
                    expiry: "2026-08-06".into(),
                    underlying_symbol: "NIFTY".into(),
                },
            )
            .await
            .unwrap();
        positions
            .update_unrealized(&key, Money::from_rupees(110))
            .await
            .unwrap();

        let report = reporter.build(false).await;
        assert_eq!(report.pnl.unrealized_pnl, Money::from_rupees(750));
        assert_eq!(report.pnl.total, Money::from_rupees(100_750));
    }
}
