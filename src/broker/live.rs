// =============================================================================
// Live broker — market orders via the exchange order gateway
// =============================================================================
//
// Shares every decision and risk path with the paper broker; only execution
// and cash custody differ (the exchange holds the cash, so no wallet is
// involved). Fills are still recorded into the position tracker so the risk
// loop rides live positions exactly as it rides paper ones.
//
// Transport failures retry up to three times with 250 ms → 500 ms → 1 s
// backoff; a rejection is the broker's final decision and never retries.
// After placement the trade book is polled best-effort for the average fill
// price, falling back to the request's reference price.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::positions::{PositionKey, PositionTracker};
use crate::store::KvStore;
use crate::types::{PositionSide, Side};

use super::dhan::{DhanError, DhanOrderRequest, DhanOrderResponse, OrderGateway};
use super::{
    claim_idempotency, record_order, Broker, OrderJournal, OrderRecord, OrderRequest, OrderResult,
};

/// Retry backoff ladder for transport-level failures.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1_000),
];

/// Live execution against the broker API.
pub struct LiveBroker {
    gateway: Arc<dyn OrderGateway>,
    positions: Arc<PositionTracker>,
    store: Arc<dyn KvStore>,
    journal: Arc<OrderJournal>,
}

impl LiveBroker {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        positions: Arc<PositionTracker>,
        store: Arc<dyn KvStore>,
        journal: Arc<OrderJournal>,
    ) -> Self {
        Self {
            gateway,
            positions,
            store,
            journal,
        }
    }

    /// One broker decision: a rejection surfaces immediately; transport
    /// trouble walks the backoff ladder, one attempt per rung.
    async fn submit_with_retry(&self, body: &DhanOrderRequest) -> Result<DhanOrderResponse> {
        let mut last_error = String::new();
        for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
            match self.gateway.place_order(body).await {
                Ok(ack) => return Ok(ack),
                Err(rejection @ DhanError::Rejected { .. }) => {
                    warn!(
                        security_id = %body.security_id,
                        error = %rejection,
                        "order rejected by broker"
                    );
                    return Err(ScalperError::OrderRejected(rejection.to_string()));
                }
                Err(DhanError::Transport(message)) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %message,
                        "broker call failed — backing off"
                    );
                    last_error = message;
                    if attempt + 1 < RETRY_BACKOFF.len() {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }
        Err(ScalperError::BrokerUnavailable(last_error))
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult> {
        claim_idempotency(&self.store, &request).await?;

        let body = DhanOrderRequest::market(
            self.gateway.client_id(),
            request.side,
            request.segment,
            &request.security_id,
            request.quantity,
        );

        let ack = self.submit_with_retry(&body).await?;

        // Best effort: the trade may not have printed yet.
        let fill_price = match self.gateway.trade_avg_price(&ack.order_id).await {
            Ok(Some(avg)) => Money::from_f64(avg),
            Ok(None) => request.price,
            Err(e) => {
                warn!(order_id = %ack.order_id, error = %e, "trade book unavailable — using reference price");
                request.price
            }
        };

        // Mirror the fill into the position ledger so risk management sees
        // live positions exactly as paper ones.
        let key = PositionKey {
            segment: request.segment,
            security_id: request.security_id.clone(),
            side: PositionSide::Long,
        };
        match request.side {
            Side::Buy => {
                let meta = request.meta.clone().ok_or_else(|| {
                    ScalperError::OrderRejected("entry order missing contract meta".into())
                })?;
                self.positions
                    .add_position(key, request.quantity, fill_price, meta)
                    .await?;
            }
            Side::Sell => {
                self.positions
                    .partial_exit(&key, request.quantity, fill_price)
                    .await?;
            }
        }

        let record = OrderRecord::new(&ack.order_id, &request, fill_price);
        record_order(&self.store, &record).await?;
        self.journal.push(record);

        info!(
            order_id = %ack.order_id,
            security_id = %request.security_id,
            side = %request.side,
            qty = request.quantity,
            fill = %fill_price,
            intent = %request.intent,
            "live order placed"
        );

        Ok(OrderResult {
            order_id: ack.order_id,
            fill_price,
        })
    }
}

impl std::fmt::Debug for LiveBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroker").finish()
    }
}

// =============================================================================
// Tests — fake gateway behind the retry ladder
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::positions::ContractMeta;
    use crate::store::MemoryStore;
    use crate::types::{OptionType, Segment};

    /// Scripted gateway: pops one outcome per placement attempt and counts
    /// how many attempts were made.
    struct FakeGateway {
        outcomes: Mutex<VecDeque<std::result::Result<DhanOrderResponse, DhanError>>>,
        attempts: AtomicUsize,
        avg_price: Option<f64>,
    }

    impl FakeGateway {
        fn scripted(
            outcomes: Vec<std::result::Result<DhanOrderResponse, DhanError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                attempts: AtomicUsize::new(0),
                avg_price: None,
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderGateway for FakeGateway {
        fn client_id(&self) -> &str {
            "1000000001"
        }

        async fn place_order(
            &self,
            _request: &DhanOrderRequest,
        ) -> std::result::Result<DhanOrderResponse, DhanError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(DhanError::Transport("script exhausted".into())))
        }

        async fn trade_avg_price(&self, _order_id: &str) -> anyhow::Result<Option<f64>> {
            Ok(self.avg_price)
        }
    }

    fn ack(order_id: &str) -> std::result::Result<DhanOrderResponse, DhanError> {
        Ok(DhanOrderResponse {
            order_id: order_id.to_string(),
            order_status: "PENDING".to_string(),
        })
    }

    fn transport() -> std::result::Result<DhanOrderResponse, DhanError> {
        Err(DhanError::Transport("connection reset".into()))
    }

    fn rejection() -> std::result::Result<DhanOrderResponse, DhanError> {
        Err(DhanError::Rejected {
            status: "400 Bad Request".into(),
            message: "insufficient margin".into(),
        })
    }

    struct Rig {
        broker: LiveBroker,
        gateway: Arc<FakeGateway>,
        positions: Arc<PositionTracker>,
        journal: Arc<OrderJournal>,
    }

    fn rig(gateway: Arc<FakeGateway>) -> Rig {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let positions = Arc::new(PositionTracker::new(store.clone(), "LIVE_20260803"));
        let journal = Arc::new(OrderJournal::new());
        let broker = LiveBroker::new(
            gateway.clone(),
            positions.clone(),
            store,
            journal.clone(),
        );
        Rig {
            broker,
            gateway,
            positions,
            journal,
        }
    }

    fn buy_request(intent: &str) -> OrderRequest {
        OrderRequest {
            underlying_symbol: "NIFTY".into(),
            security_id: "42501".into(),
            segment: Segment::NseFno,
            side: Side::Buy,
            quantity: 75,
            price: Money::from_rupees(100),
            intent: intent.into(),
            meta: Some(ContractMeta {
                option_type: OptionType::Ce,
                strike: 24_500,
                expiry: "2026-08-06".into(),
                underlying_symbol: "NIFTY".into(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_then_success_retries_once() {
        let rig = rig(FakeGateway::scripted(vec![transport(), ack("112111182045")]));

        let result = rig.broker.place_order(buy_request("entry")).await.unwrap();
        assert_eq!(result.order_id, "112111182045");
        assert_eq!(rig.gateway.attempts(), 2);

        // The fill landed in the ledger and the journal.
        assert_eq!(rig.positions.open_count().await, 1);
        assert_eq!(rig.journal.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_transport_failures_exhaust_the_ladder() {
        let rig = rig(FakeGateway::scripted(vec![
            transport(),
            transport(),
            transport(),
        ]));

        let err = rig.broker.place_order(buy_request("entry")).await.unwrap_err();
        assert!(matches!(err, ScalperError::BrokerUnavailable(_)));
        // Exactly three attempts, never a fourth.
        assert_eq!(rig.gateway.attempts(), 3);

        assert_eq!(rig.positions.open_count().await, 0);
        assert!(rig.journal.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_final_with_zero_retries() {
        let rig = rig(FakeGateway::scripted(vec![rejection(), ack("never-used")]));

        let err = rig.broker.place_order(buy_request("entry")).await.unwrap_err();
        match err {
            ScalperError::OrderRejected(message) => {
                assert!(message.contains("insufficient margin"), "message: {message}");
            }
            other => panic!("expected OrderRejected, got {other:?}"),
        }
        assert_eq!(rig.gateway.attempts(), 1);
        assert_eq!(rig.positions.open_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_mid_ladder_stops_retrying() {
        let rig = rig(FakeGateway::scripted(vec![transport(), rejection()]));

        let err = rig.broker.place_order(buy_request("entry")).await.unwrap_err();
        assert!(matches!(err, ScalperError::OrderRejected(_)));
        assert_eq!(rig.gateway.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fill_price_comes_from_the_trade_book() {
        let gateway = Arc::new(FakeGateway {
            outcomes: Mutex::new(vec![ack("112111182045")].into()),
            attempts: AtomicUsize::new(0),
            avg_price: Some(101.55),
        });
        let rig = rig(gateway);

        let result = rig.broker.place_order(buy_request("entry")).await.unwrap();
        assert_eq!(result.fill_price, Money::from_f64(101.55));

        let position = rig.positions.all().await.pop().unwrap();
        assert_eq!(position.buy_avg, Money::from_f64(101.55));
    }

    #[tokio::test(start_paused = true)]
    async fn sell_fill_realises_through_the_ledger() {
        let gateway = FakeGateway::scripted(vec![ack("buy-1"), ack("sell-1")]);
        let rig = rig(gateway);

        rig.broker.place_order(buy_request("entry")).await.unwrap();

        let sell = OrderRequest {
            side: Side::Sell,
            price: Money::from_rupees(120),
            intent: "exit-trailing_stop".into(),
            meta: None,
            ..buy_request("entry")
        };
        rig.broker.place_order(sell).await.unwrap();

        assert_eq!(rig.positions.open_count().await, 0);
        assert_eq!(rig.journal.len(), 2);
    }
}
