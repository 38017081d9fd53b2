// =============================================================================
// Paper wallet — the session cash ledger
// =============================================================================
//
// Tracks {available, used, total, realized_pnl, starting_balance} in fixed-
// point money. A single async mutex serialises every mutation; the critical
// section covers the invariant check, the in-memory update, AND the Redis
// hash write, so either all three take effect or none do — a failed Redis
// write rolls the in-memory state back and surfaces the error.
//
// Ledger invariants, holding at every quiescent state:
//   available ≥ 0, used ≥ 0
//   total = available + used
//   total = starting_balance + realized_pnl   (after each buy/sell/pnl set)
//
// On startup the session hash is loaded if present (intraday restart resumes
// the same wallet); otherwise the starting fields are initialised and saved.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::session::ist_timestamp;
use crate::store::{keys, ttl, KvStore};

/// The persisted balance fields.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceState {
    pub available: Money,
    pub used: Money,
    pub total: Money,
    pub realized_pnl: Money,
    pub starting_balance: Money,
    pub last_updated: String,
}

impl BalanceState {
    fn fresh(starting: Money) -> Self {
        Self {
            available: starting,
            used: Money::ZERO,
            total: starting,
            realized_pnl: Money::ZERO,
            starting_balance: starting,
            last_updated: ist_timestamp(),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("available".into(), self.available.to_string()),
            ("used".into(), self.used.to_string()),
            ("total".into(), self.total.to_string()),
            ("realized_pnl".into(), self.realized_pnl.to_string()),
            ("starting_balance".into(), self.starting_balance.to_string()),
            ("last_updated".into(), self.last_updated.clone()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let money = |name: &str| -> Option<Money> { fields.get(name)?.parse().ok() };
        Some(Self {
            available: money("available")?,
            used: money("used")?,
            total: money("total")?,
            realized_pnl: money("realized_pnl")?,
            starting_balance: money("starting_balance")?,
            last_updated: fields.get("last_updated")?.clone(),
        })
    }
}

/// Session wallet with transactional Redis persistence.
pub struct PaperWallet {
    state: Mutex<BalanceState>,
    store: Arc<dyn KvStore>,
    session_id: String,
}

impl PaperWallet {
    /// Load the wallet for `session_id`, resuming a persisted hash when one
    /// exists, otherwise initialising with `starting_balance` and saving.
    pub async fn load_or_init(
        store: Arc<dyn KvStore>,
        session_id: &str,
        starting_balance: Money,
    ) -> Result<Self> {
        let key = keys::balance(session_id);
        let fields = store.hash_get_all(&key).await?;

        let state = match BalanceState::from_fields(&fields) {
            Some(loaded) => {
                info!(
                    session_id,
                    available = %loaded.available,
                    used = %loaded.used,
                    realized_pnl = %loaded.realized_pnl,
                    "wallet resumed from store"
                );
                loaded
            }
            None => {
                let fresh = BalanceState::fresh(starting_balance);
                store
                    .hash_set_all(&key, &fresh.to_fields(), Some(ttl::BALANCE))
                    .await?;
                info!(session_id, starting = %starting_balance, "wallet initialised");
                fresh
            }
        };

        Ok(Self {
            state: Mutex::new(state),
            store,
            session_id: session_id.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Reserve `principal + fee` for a buy. Fails with `InsufficientBalance`
    /// when available cannot cover it; fails (and rolls back) when the
    /// persistence write fails.
    pub async fn debit_for_buy(&self, principal: Money, fee: Money) -> Result<BalanceState> {
        let mut state = self.state.lock().await;
        let needed = principal + fee;

        if state.available.less_than(needed) {
            return Err(ScalperError::InsufficientBalance {
                needed: needed.to_string(),
                available: state.available.to_string(),
            });
        }

        let rollback = state.clone();
        state.available = state.available - needed;
        state.used = state.used + needed;
        state.total = state.available + state.used;
        state.last_updated = ist_timestamp();

        self.persist_or_rollback(&mut state, rollback).await?;
        Ok(state.clone())
    }

    /// Credit sale proceeds and release the reserved principal. `used` is
    /// clamped at zero so a rounding remainder can never drive it negative.
    pub async fn credit_for_sell(
        &self,
        net_proceeds: Money,
        released_principal: Money,
    ) -> Result<BalanceState> {
        let mut state = self.state.lock().await;
        let rollback = state.clone();

        state.available = state.available + net_proceeds;
        state.used = (state.used - released_principal).max(Money::ZERO);
        state.total = state.available + state.used;
        state.last_updated = ist_timestamp();

        self.persist_or_rollback(&mut state, rollback).await?;
        Ok(state.clone())
    }

    /// Record realised PnL. Pure ledger update — the cash already moved with
    /// the sell — bringing `total` back to `starting + realized`.
    pub async fn add_realized_pnl(&self, delta: Money) -> Result<BalanceState> {
        let mut state = self.state.lock().await;
        let rollback = state.clone();

        state.realized_pnl = state.realized_pnl + delta;
        state.total = state.starting_balance + state.realized_pnl;
        state.last_updated = ist_timestamp();

        self.persist_or_rollback(&mut state, rollback).await?;
        Ok(state.clone())
    }

    /// Reinitialise every field from `amount`. Admin surface only.
    pub async fn reset_balance(&self, amount: Money) -> Result<BalanceState> {
        let mut state = self.state.lock().await;
        let rollback = state.clone();

        *state = BalanceState::fresh(amount);

        self.persist_or_rollback(&mut state, rollback).await?;
        warn!(session_id = %self.session_id, amount = %amount, "wallet reset");
        Ok(state.clone())
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    /// Whole-mutation snapshot of the ledger.
    pub async fn snapshot(&self) -> BalanceState {
        self.state.lock().await.clone()
    }

    pub async fn available(&self) -> Money {
        self.state.lock().await.available
    }

    /// Reporting view: starting + realised + the caller's unrealised PnL.
    /// Does not mutate the ledger.
    pub async fn update_total_with_pnl(&self, unrealized: Money) -> Money {
        let state = self.state.lock().await;
        state.starting_balance + state.realized_pnl + unrealized
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Write the full hash; restore `rollback` on failure. Caller holds the
    /// state lock for the whole sequence.
    async fn persist_or_rollback(
        &self,
        state: &mut BalanceState,
        rollback: BalanceState,
    ) -> Result<()> {
        let key = keys::balance(&self.session_id);
        match self
            .store
            .hash_set_all(&key, &state.to_fields(), Some(ttl::BALANCE))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "wallet persistence failed — rolling back mutation");
                *state = rollback;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for PaperWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperWallet")
            .field("session_id", &self.session_id)
            .finish()
    }
}
