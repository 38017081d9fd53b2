// =============================================================================
// Paper broker — simulated execution against the tick cache and wallet
// =============================================================================
//
// Fills settle at the tick-cache LTP, not the requested price — the same
// price the live feed would have filled a market order near. A missing or
// non-positive LTP fails the order.
//
// BUY:  debit principal + charge from the wallet, then record the order and
//       open/augment the position. A failure after the debit refunds it.
// SELL: realise the exit through the position tracker, credit net proceeds,
//       release the reserved principal (plus the entry charge when the
//       position fully closes), and post realised PnL net of charges.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::positions::{PositionKey, PositionTracker};
use crate::session::epoch_millis;
use crate::store::KvStore;
use crate::ticks::TickCache;
use crate::types::Side;
use crate::wallet::PaperWallet;

use super::{claim_idempotency, record_order, Broker, OrderJournal, OrderRecord, OrderRequest, OrderResult};

/// Simulated broker for paper sessions.
pub struct PaperBroker {
    ticks: Arc<TickCache>,
    wallet: Arc<PaperWallet>,
    positions: Arc<PositionTracker>,
    store: Arc<dyn KvStore>,
    journal: Arc<OrderJournal>,
    charge_per_order: Money,
}

impl PaperBroker {
    pub fn new(
        ticks: Arc<TickCache>,
        wallet: Arc<PaperWallet>,
        positions: Arc<PositionTracker>,
        store: Arc<dyn KvStore>,
        journal: Arc<OrderJournal>,
        charge_per_order: Money,
    ) -> Self {
        Self {
            ticks,
            wallet,
            positions,
            store,
            journal,
            charge_per_order,
        }
    }

    async fn execute_buy(&self, request: &OrderRequest, fill: Money) -> Result<OrderResult> {
        let meta = request.meta.clone().ok_or_else(|| {
            ScalperError::OrderRejected("entry order missing contract meta".into())
        })?;

        let principal = fill.multiply_qty(request.quantity);
        self.wallet
            .debit_for_buy(principal, self.charge_per_order)
            .await?;

        let key = PositionKey {
            segment: request.segment,
            security_id: request.security_id.clone(),
            side: crate::types::PositionSide::Long,
        };
        if let Err(e) = self
            .positions
            .add_position(key, request.quantity, fill, meta)
            .await
        {
            // Compensate the reserved cash before surfacing the failure.
            warn!(error = %e, security_id = %request.security_id, "position open failed — refunding debit");
            let reserved = principal + self.charge_per_order;
            let _ = self.wallet.credit_for_sell(reserved, reserved).await;
            return Err(e);
        }

        let order_id = format!("P-{}", epoch_millis());
        let record = OrderRecord::new(&order_id, request, fill);
        record_order(&self.store, &record).await?;
        self.journal.push(record);

        info!(
            order_id = %order_id,
            security_id = %request.security_id,
            qty = request.quantity,
            fill = %fill,
            "paper buy filled"
        );
        Ok(OrderResult {
            order_id,
            fill_price: fill,
        })
    }

    async fn execute_sell(&self, request: &OrderRequest, fill: Money) -> Result<OrderResult> {
        let key = PositionKey {
            segment: request.segment,
            security_id: request.security_id.clone(),
            side: crate::types::PositionSide::Long,
        };

        let exit = self
            .positions
            .partial_exit(&key, request.quantity, fill)
            .await?;

        // Release the weighted principal; the entry charge unwinds with the
        // final leg so `used` lands exactly on zero.
        let mut released = exit.buy_avg.multiply_qty(exit.exited_qty);
        let mut realized = exit.gross_pnl - self.charge_per_order;
        if exit.closed {
            released = released + self.charge_per_order;
            realized = realized - self.charge_per_order;
        }
        let net_proceeds = fill.multiply_qty(exit.exited_qty) - self.charge_per_order;

        self.wallet.credit_for_sell(net_proceeds, released).await?;
        self.wallet.add_realized_pnl(realized).await?;

        let order_id = format!("P-{}", epoch_millis());
        let record = OrderRecord::new(&order_id, request, fill);
        record_order(&self.store, &record).await?;
        self.journal.push(record);

        info!(
            order_id = %order_id,
            security_id = %request.security_id,
            qty = request.quantity,
            fill = %fill,
            gross_pnl = %exit.gross_pnl,
            closed = exit.closed,
            intent = %request.intent,
            "paper sell filled"
        );
        Ok(OrderResult {
            order_id,
            fill_price: fill,
        })
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult> {
        claim_idempotency(&self.store, &request).await?;

        let fill = match self.ticks.ltp(request.segment, &request.security_id) {
            Some(ltp) if ltp.is_positive() => ltp,
            _ => {
                return Err(ScalperError::MarketDataStale {
                    security_id: request.security_id.clone(),
                    age_secs: self
                        .ticks
                        .age_secs(request.segment, &request.security_id)
                        .unwrap_or(0),
                })
            }
        };

        match request.side {
            Side::Buy => self.execute_buy(&request, fill).await,
            Side::Sell => self.execute_sell(&request, fill).await,
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("charge_per_order", &self.charge_per_order)
            .finish()
    }
}
