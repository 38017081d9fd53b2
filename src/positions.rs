// =============================================================================
// Position tracker — net-position ledger with weighted-average entries
// =============================================================================
//
// Records are keyed by (segment, security_id, side). Mutations for one key
// are serialised by lock striping: the key hashes to one of a fixed set of
// shard mutexes, and the shard lock covers the in-memory update plus the
// Redis write, so observers always see consistent net_qty / buy_avg pairs.
//
// A record is deleted (from memory, its Redis hash, and the session set) the
// moment net_qty reaches zero. On startup `recover` reloads the session set
// so an intraday restart resumes open positions.
//
// Only LONG positions are produced by this engine; SHORT remains
// representable in the data model but exit math rejects it.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::session::ist_timestamp;
use crate::store::{keys, KvStore};
use crate::types::{OptionType, PositionSide, SecurityId, Segment};

const SHARD_COUNT: usize = 16;

// ---------------------------------------------------------------------------
// Key & record
// ---------------------------------------------------------------------------

/// Identity of one net position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn long(segment: Segment, security_id: impl Into<SecurityId>) -> Self {
        Self {
            segment,
            security_id: security_id.into(),
            side: PositionSide::Long,
        }
    }

    /// Stable id used in Redis keys and the session set.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.segment, self.security_id, self.side)
    }
}

/// Static contract details attached to a position at entry.
#[derive(Debug, Clone)]
pub struct ContractMeta {
    pub option_type: OptionType,
    pub strike: i64,
    pub expiry: String,
    pub underlying_symbol: String,
}

/// One tracked net position.
#[derive(Debug, Clone)]
pub struct Position {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub side: PositionSide,
    pub net_qty: i64,
    pub buy_qty: i64,
    pub buy_avg: Money,
    pub sell_qty: i64,
    pub sell_avg: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub current_price: Money,
    pub option_type: OptionType,
    pub strike: i64,
    pub expiry: String,
    pub underlying_symbol: String,
    pub created_at: String,
    pub last_updated: String,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            segment: self.segment,
            security_id: self.security_id.clone(),
            side: self.side,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("exchange_segment".into(), self.segment.to_string()),
            ("security_id".into(), self.security_id.clone()),
            ("side".into(), self.side.to_string()),
            ("net_qty".into(), self.net_qty.to_string()),
            ("buy_qty".into(), self.buy_qty.to_string()),
            ("buy_avg".into(), self.buy_avg.to_string()),
            ("sell_qty".into(), self.sell_qty.to_string()),
            ("sell_avg".into(), self.sell_avg.to_string()),
            ("realized_pnl".into(), self.realized_pnl.to_string()),
            ("unrealized_pnl".into(), self.unrealized_pnl.to_string()),
            ("current_price".into(), self.current_price.to_string()),
            ("option_type".into(), self.option_type.to_string()),
            ("strike".into(), self.strike.to_string()),
            ("expiry".into(), self.expiry.clone()),
            ("underlying_symbol".into(), self.underlying_symbol.clone()),
            ("created_at".into(), self.created_at.clone()),
            ("last_updated".into(), self.last_updated.clone()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            segment: fields.get("exchange_segment")?.parse().ok()?,
            security_id: fields.get("security_id")?.clone(),
            side: fields.get("side")?.parse().ok()?,
            net_qty: fields.get("net_qty")?.parse().ok()?,
            buy_qty: fields.get("buy_qty")?.parse().ok()?,
            buy_avg: fields.get("buy_avg")?.parse().ok()?,
            sell_qty: fields.get("sell_qty")?.parse().ok()?,
            sell_avg: fields.get("sell_avg")?.parse().ok()?,
            realized_pnl: fields.get("realized_pnl")?.parse().ok()?,
            unrealized_pnl: fields.get("unrealized_pnl")?.parse().ok()?,
            current_price: fields.get("current_price")?.parse().ok()?,
            option_type: fields.get("option_type")?.parse().ok()?,
            strike: fields.get("strike")?.parse().ok()?,
            expiry: fields.get("expiry")?.clone(),
            underlying_symbol: fields.get("underlying_symbol")?.clone(),
            created_at: fields.get("created_at")?.clone(),
            last_updated: fields.get("last_updated")?.clone(),
        })
    }
}

/// Result of a partial (or full) exit.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    /// Gross realised PnL of this exit leg, fees excluded.
    pub gross_pnl: Money,
    /// Weighted entry price the exit settled against.
    pub buy_avg: Money,
    /// Quantity sold in this exit.
    pub exited_qty: i64,
    /// Whether the position reached net_qty = 0 and was deleted.
    pub closed: bool,
    /// Remaining net quantity.
    pub remaining_qty: i64,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Striped-lock position ledger with write-through persistence.
pub struct PositionTracker {
    shards: Vec<Mutex<HashMap<PositionKey, Position>>>,
    store: Arc<dyn KvStore>,
    session_id: String,
}

impl PositionTracker {
    pub fn new(store: Arc<dyn KvStore>, session_id: &str) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            store,
            session_id: session_id.to_string(),
        }
    }

    fn shard_for(&self, key: &PositionKey) -> &Mutex<HashMap<PositionKey, Position>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Record a buy. Creates the position, or folds the fill into the
    /// weighted-average entry price of an existing one.
    pub async fn add_position(
        &self,
        key: PositionKey,
        qty: i64,
        price: Money,
        meta: ContractMeta,
    ) -> Result<Position> {
        if qty <= 0 {
            return Err(ScalperError::OrderRejected(format!(
                "buy quantity must be positive, got {qty}"
            )));
        }

        let mut shard = self.shard_for(&key).lock().await;
        let now = ist_timestamp();

        let updated = match shard.get(&key) {
            Some(existing) => {
                let mut p = existing.clone();
                // Weighted-average entry across incremental buys.
                let total_cost = p.buy_avg.multiply_qty(p.buy_qty) + price.multiply_qty(qty);
                p.buy_avg = total_cost.divide(Money::from_rupees(p.buy_qty + qty));
                p.buy_qty += qty;
                p.net_qty += qty;
                p.current_price = price;
                p.last_updated = now;
                p
            }
            None => Position {
                segment: key.segment,
                security_id: key.security_id.clone(),
                side: key.side,
                net_qty: qty,
                buy_qty: qty,
                buy_avg: price,
                sell_qty: 0,
                sell_avg: Money::ZERO,
                realized_pnl: Money::ZERO,
                unrealized_pnl: Money::ZERO,
                current_price: price,
                option_type: meta.option_type,
                strike: meta.strike,
                expiry: meta.expiry.clone(),
                underlying_symbol: meta.underlying_symbol.clone(),
                created_at: now.clone(),
                last_updated: now,
            },
        };

        self.persist(&updated).await?;
        info!(
            position = %key.id(),
            qty,
            price = %price,
            buy_avg = %updated.buy_avg,
            net_qty = updated.net_qty,
            "position buy recorded"
        );
        shard.insert(key, updated.clone());
        Ok(updated)
    }

    /// Record a sell against a LONG position. Realised PnL accrues at
    /// `(price − buy_avg) · qty`; when the position flattens it is deleted
    /// from the store and the session set.
    pub async fn partial_exit(&self, key: &PositionKey, qty: i64, price: Money) -> Result<ExitOutcome> {
        if key.side == PositionSide::Short {
            return Err(ScalperError::OrderRejected(
                "short position exits are not supported".into(),
            ));
        }

        let mut shard = self.shard_for(key).lock().await;
        let existing = shard.get(key).ok_or_else(|| {
            ScalperError::OrderRejected(format!("no open position for {}", key.id()))
        })?;

        if qty <= 0 || qty > existing.net_qty {
            return Err(ScalperError::OrderRejected(format!(
                "exit qty {qty} invalid against net {}",
                existing.net_qty
            )));
        }

        let mut p = existing.clone();
        let gross_pnl = (price - p.buy_avg).multiply_qty(qty);
        let buy_avg = p.buy_avg;

        let total_sold = p.sell_avg.multiply_qty(p.sell_qty) + price.multiply_qty(qty);
        p.sell_avg = total_sold.divide(Money::from_rupees(p.sell_qty + qty));
        p.sell_qty += qty;
        p.net_qty -= qty;
        p.realized_pnl = p.realized_pnl + gross_pnl;
        p.current_price = price;
        p.last_updated = ist_timestamp();

        let closed = p.net_qty == 0;
        if closed {
            p.unrealized_pnl = Money::ZERO;
            let id = key.id();
            self.store.delete(&keys::position(&id)).await?;
            self.store
                .set_remove(&keys::positions(&self.session_id), &id)
                .await?;
            shard.remove(key);
        } else {
            self.persist(&p).await?;
            shard.insert(key.clone(), p.clone());
        }

        info!(
            position = %key.id(),
            qty,
            price = %price,
            gross_pnl = %gross_pnl,
            remaining = p.net_qty,
            closed,
            "position sell recorded"
        );

        Ok(ExitOutcome {
            gross_pnl,
            buy_avg,
            exited_qty: qty,
            closed,
            remaining_qty: p.net_qty,
        })
    }

    /// Refresh mark-to-market for one position.
    pub async fn update_unrealized(&self, key: &PositionKey, current_price: Money) -> Result<Money> {
        let mut shard = self.shard_for(key).lock().await;
        let existing = shard.get(key).ok_or_else(|| {
            ScalperError::OrderRejected(format!("no open position for {}", key.id()))
        })?;

        let mut p = existing.clone();
        p.current_price = current_price;
        p.unrealized_pnl = (current_price - p.buy_avg).multiply_qty(p.net_qty);
        p.last_updated = ist_timestamp();

        self.persist(&p).await?;
        let unrealized = p.unrealized_pnl;
        shard.insert(key.clone(), p);
        Ok(unrealized)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, key: &PositionKey) -> Option<Position> {
        self.shard_for(key).lock().await.get(key).cloned()
    }

    /// Snapshot of every open position.
    pub async fn all(&self) -> Vec<Position> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().await.values().cloned());
        }
        out
    }

    pub async fn open_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.lock().await.len();
        }
        count
    }

    /// Sum of unrealised PnL across open positions.
    pub async fn total_unrealized(&self) -> Money {
        let mut total = Money::ZERO;
        for p in self.all().await {
            total = total + p.unrealized_pnl;
        }
        total
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Reload the session's open positions from the store. Returns how many
    /// were recovered; malformed hashes are skipped with a warning.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self
            .store
            .set_members(&keys::positions(&self.session_id))
            .await?;

        let mut recovered = 0;
        for id in ids {
            let fields = self.store.hash_get_all(&keys::position(&id)).await?;
            match Position::from_fields(&fields) {
                Some(position) => {
                    let key = position.key();
                    self.shard_for(&key).lock().await.insert(key, position);
                    recovered += 1;
                }
                None => {
                    warn!(position = %id, "skipping unparseable persisted position");
                }
            }
        }

        if recovered > 0 {
            info!(session_id = %self.session_id, recovered, "positions recovered");
        }
        Ok(recovered)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn persist(&self, position: &Position) -> Result<()> {
        let id = position.key().id();
        self.store
            .hash_set_all(&keys::position(&id), &position.to_fields(), None)
            .await?;
        self.store
            .set_add(&keys::positions(&self.session_id), &id)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("session_id", &self.session_id)
            .field("shards", &self.shards.len())
            .finish()
    }
}
