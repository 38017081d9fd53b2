// =============================================================================
// Risk manager — the no-loss trend rider
// =============================================================================
//
// Every risk tick walks the open positions and evaluates a fixed precedence
// ladder, acting on the first match:
//
//   1. emergency floor    pnl ≤ −emergency_floor_rupees         → exit
//   2. initial stop       pnl% ≤ −initial_sl_pct (pre-armed)    → exit
//   3. breakeven arms     once peak% ≥ breakeven_threshold_pct  (sticky)
//   4. breakeven lock     armed AND price < entry               → exit
//   5. trailing stop      armed AND price ≤ trigger             → exit
//   6. adjust trailing    armed AND trend ON: trigger ratchets to
//                         peak · (1 − trail_pct), but only in steps of at
//                         least rupee_step
//
// Peak and trigger live in the store behind compare-and-set ratchets, so
// they only ever advance and survive an intraday restart. "Armed" is
// derived from the peak, which makes it sticky for free.
//
// Exits are idempotent: each (security_id, reason) claims a 10-second
// dedupe slot before the sell goes out; a repeat inside the window reports
// `Duplicate` instead of re-issuing the order.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::broker::{Broker, OrderRequest};
use crate::config::RiskParams;
use crate::error::{Result, ScalperError};
use crate::money::Money;
use crate::positions::{Position, PositionTracker};
use crate::session::ist_timestamp;
use crate::store::{keys, ttl, KvStore};
use crate::ticks::TickCache;
use crate::types::{PositionSide, Side};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Emergency,
    InitialSl,
    BreakevenLock,
    TrailingStop,
    SessionEnd,
    DayLossLimit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::InitialSl => "initial_sl",
            Self::BreakevenLock => "breakeven_lock",
            Self::TrailingStop => "trailing_stop",
            Self::SessionEnd => "session_end",
            Self::DayLossLimit => "day_loss_limit",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What one evaluation pass decided for one position.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskAction {
    /// Position was market-exited.
    Exited { reason: ExitReason },
    /// The trailing trigger advanced.
    TriggerAdjusted { trigger: f64 },
    /// Nothing to do this tick.
    Held,
    /// No tick has ever arrived for the security; nothing can be evaluated.
    NoTick,
    /// An identical exit was issued within the idempotency window.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Trend rider
// ---------------------------------------------------------------------------

/// Per-position trailing risk engine.
pub struct TrendRider {
    params: RiskParams,
    ticks: Arc<TickCache>,
    positions: Arc<PositionTracker>,
    store: Arc<dyn KvStore>,
    broker: Arc<dyn Broker>,
}

impl TrendRider {
    pub fn new(
        params: RiskParams,
        ticks: Arc<TickCache>,
        positions: Arc<PositionTracker>,
        store: Arc<dyn KvStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            params,
            ticks,
            positions,
            store,
            broker,
        }
    }

    /// One risk tick: evaluate every open position. Failures are logged per
    /// position; one bad position never starves the rest.
    pub async fn evaluate_all(&self) {
        for position in self.positions.all().await {
            if position.side != PositionSide::Long {
                continue;
            }
            match self.evaluate_position(&position).await {
                Ok(RiskAction::Held) | Ok(RiskAction::NoTick) => {}
                Ok(action) => {
                    debug!(security_id = %position.security_id, ?action, "risk action");
                }
                Err(e) => {
                    error!(security_id = %position.security_id, error = %e, "risk evaluation failed");
                }
            }
        }
    }

    /// Evaluate the precedence ladder for one position.
    pub async fn evaluate_position(&self, position: &Position) -> Result<RiskAction> {
        let tick = match self.ticks.get(position.segment, &position.security_id) {
            Some(t) => t,
            None => return Ok(RiskAction::NoTick),
        };

        let price = tick.ltp;
        let entry = position.buy_avg;
        let entry_f = entry.to_f64();
        if entry_f <= 0.0 {
            return Ok(RiskAction::Held);
        }

        let pnl = (price - entry).multiply_qty(position.net_qty);
        let pnl_pct = price.to_f64() / entry_f - 1.0;

        // Advance the peak first so arming sees this tick's high. The peak
        // never starts below entry.
        let peak_key = keys::peak(&position.security_id);
        self.store
            .ratchet_max(&peak_key, price.to_f64().max(entry_f), ttl::PEAK)
            .await?;
        let peak = self
            .store
            .get_string(&peak_key)
            .await?
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(entry_f);
        let peak_pct = peak / entry_f - 1.0;

        // 1. Emergency floor.
        let floor = Money::from_f64(self.params.emergency_floor_rupees);
        if pnl <= floor.negate() {
            return self.exit(position, price, ExitReason::Emergency).await;
        }

        // 3. Breakeven arms off the peak and stays armed for the life of
        //    the position.
        let armed = peak_pct >= self.params.breakeven_threshold_pct;

        // 2. Initial stop loss, only while breakeven has not armed.
        if !armed && pnl_pct <= -self.params.initial_sl_pct {
            return self.exit(position, price, ExitReason::InitialSl).await;
        }

        if armed {
            // 4. Breakeven lock: never give back to below entry.
            if price.less_than(entry) {
                return self.exit(position, price, ExitReason::BreakevenLock).await;
            }

            // 5. Trailing stop.
            let trigger_key = keys::trigger(&position.security_id);
            let trigger = self
                .store
                .get_string(&trigger_key)
                .await?
                .and_then(|s| s.parse::<f64>().ok());
            if let Some(t) = trigger {
                if price.to_f64() <= t {
                    return self.exit(position, price, ExitReason::TrailingStop).await;
                }
            }

            // 6. Adjust the trailing trigger while the trend is still on.
            if self.trend_on(&position.security_id).await? {
                let candidate = peak * (1.0 - self.params.trail_pct);
                let advanced = self
                    .store
                    .ratchet_step(&trigger_key, candidate, self.params.rupee_step, ttl::PEAK)
                    .await?;
                if advanced {
                    info!(
                        security_id = %position.security_id,
                        trigger = format!("{candidate:.2}"),
                        peak = format!("{peak:.2}"),
                        "trailing trigger advanced"
                    );
                    return Ok(RiskAction::TriggerAdjusted { trigger: candidate });
                }
            }
        }

        Ok(RiskAction::Held)
    }

    /// Market-exit every open position, e.g. at the session cutoff or on a
    /// day-loss breach. Returns how many exits were issued.
    pub async fn flatten_all(&self, reason: ExitReason) -> usize {
        let mut exited = 0;
        for position in self.positions.all().await {
            if position.side != PositionSide::Long {
                continue;
            }
            let price = self
                .ticks
                .ltp(position.segment, &position.security_id)
                .unwrap_or(position.current_price);
            match self.exit(&position, price, reason).await {
                Ok(RiskAction::Exited { .. }) => exited += 1,
                Ok(other) => {
                    debug!(security_id = %position.security_id, ?other, "flatten skipped");
                }
                Err(e) => {
                    error!(security_id = %position.security_id, error = %e, "flatten exit failed");
                }
            }
        }
        exited
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn trend_on(&self, security_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_string(&keys::trend(security_id))
            .await?
            .as_deref()
            == Some("ON"))
    }

    async fn exit(
        &self,
        position: &Position,
        price: Money,
        reason: ExitReason,
    ) -> Result<RiskAction> {
        // Idempotency: one exit per (security, reason) per window.
        let slot = format!("risk:{}:{}", position.security_id, reason);
        let claimed = self
            .store
            .set_nx_ex(&keys::dedupe(&slot), &ist_timestamp(), ttl::DEDUPE)
            .await?;
        if !claimed {
            warn!(security_id = %position.security_id, %reason, "exit suppressed — duplicate within window");
            return Ok(RiskAction::Duplicate);
        }

        let request = OrderRequest {
            underlying_symbol: position.underlying_symbol.clone(),
            security_id: position.security_id.clone(),
            segment: position.segment,
            side: Side::Sell,
            quantity: position.net_qty,
            price,
            intent: format!("exit-{reason}"),
            meta: None,
        };

        match self.broker.place_order(request).await {
            Ok(result) => {
                info!(
                    security_id = %position.security_id,
                    %reason,
                    qty = position.net_qty,
                    fill = %result.fill_price,
                    order_id = %result.order_id,
                    "position exited"
                );
                self.cleanup_keys(&position.security_id).await;
                Ok(RiskAction::Exited { reason })
            }
            Err(ScalperError::Duplicate(d)) => {
                warn!(security_id = %position.security_id, "broker reported duplicate: {d}");
                Ok(RiskAction::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the per-security ratchet and trend keys after an exit.
    async fn cleanup_keys(&self, security_id: &str) {
        for key in [
            keys::peak(security_id),
            keys::trigger(security_id),
            keys::trend(security_id),
        ] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "risk key cleanup failed");
            }
        }
    }
}

impl std::fmt::Debug for TrendRider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrendRider")
            .field("params", &self.params)
            .finish()
    }
}

// =============================================================================
// Tests — full paper stack behind the trend rider
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OrderJournal, PaperBroker};
    use crate::positions::{ContractMeta, PositionKey};
    use crate::store::MemoryStore;
    use crate::types::{OptionType, Segment, Tick};
    use crate::wallet::PaperWallet;

    struct Rig {
        rider: TrendRider,
        ticks: Arc<TickCache>,
        positions: Arc<PositionTracker>,
        store: Arc<MemoryStore>,
        journal: Arc<OrderJournal>,
    }

    fn params() -> RiskParams {
        RiskParams {
            initial_sl_pct: 0.02,
            trail_pct: 0.05,
            breakeven_threshold_pct: 0.15,
            rupee_step: 3.0,
            emergency_floor_rupees: 2_000.0,
            day_loss_limit: 5_000.0,
            session_target: 10_000.0,
        }
    }

    async fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KvStore> = store.clone();
        let ticks = Arc::new(TickCache::new());
        let wallet = Arc::new(
            PaperWallet::load_or_init(kv.clone(), "PAPER_20260803", Money::from_rupees(200_000))
                .await
                .unwrap(),
        );
        let positions = Arc::new(PositionTracker::new(kv.clone(), "PAPER_20260803"));
        let journal = Arc::new(OrderJournal::new());
        let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(
            ticks.clone(),
            wallet,
            positions.clone(),
            kv.clone(),
            journal.clone(),
            Money::from_rupees(20),
        ));
        let rider = TrendRider::new(params(), ticks.clone(), positions.clone(), kv, broker);
        Rig {
            rider,
            ticks,
            positions,
            store,
            journal,
        }
    }

    fn meta() -> ContractMeta {
        ContractMeta {
            option_type: OptionType::Ce,
            strike: 24_500,
            expiry: "2026-08-06".into(),
            underlying_symbol: "NIFTY".into(),
        }
    }

    async fn open_position(rig: &Rig, qty: i64, entry: f64) -> Position {
        let key = PositionKey::long(Segment::NseFno, "42501");
        rig.positions
            .add_position(key, qty, Money::from_f64(entry), meta())
            .await
            .unwrap()
    }

    fn set_ltp(rig: &Rig, price: f64, ts: i64) {
        rig.ticks.put(Tick::ltp_only(
            Segment::NseFno,
            "42501",
            Money::from_f64(price),
            ts,
        ));
    }

    async fn set_trend_on(rig: &Rig) {
        rig.store
            .set_string(&keys::trend("42501"), "ON", Some(300))
            .await
            .unwrap();
    }

    async fn evaluate(rig: &Rig) -> RiskAction {
        let position = rig.positions.all().await.pop().expect("open position");
        rig.rider.evaluate_position(&position).await.unwrap()
    }

    #[tokio::test]
    async fn no_tick_skips_evaluation() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        assert_eq!(evaluate(&rig).await, RiskAction::NoTick);
    }

    #[tokio::test]
    async fn healthy_position_is_held() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_ltp(&rig, 101.0, 1);
        assert_eq!(evaluate(&rig).await, RiskAction::Held);
    }

    #[tokio::test]
    async fn initial_stop_loss_exits_before_breakeven_arms() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_ltp(&rig, 97.9, 1);

        assert_eq!(
            evaluate(&rig).await,
            RiskAction::Exited {
                reason: ExitReason::InitialSl
            }
        );
        assert_eq!(rig.positions.open_count().await, 0);
    }

    #[tokio::test]
    async fn emergency_floor_takes_precedence_over_everything() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        // pnl = −3750 breaches the −2000 floor; pnl% breaches the initial SL
        // too — the emergency reason must win.
        set_ltp(&rig, 50.0, 1);

        assert_eq!(
            evaluate(&rig).await,
            RiskAction::Exited {
                reason: ExitReason::Emergency
            }
        );
    }

    #[tokio::test]
    async fn breakeven_arms_at_peak_and_locks_above_entry() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;

        // Peak +15% arms breakeven.
        set_ltp(&rig, 115.0, 1);
        set_trend_on(&rig).await;
        let action = evaluate(&rig).await;
        assert!(
            matches!(action, RiskAction::TriggerAdjusted { .. }),
            "arming tick should also set the first trigger, got {action:?}"
        );

        // Drop below entry: breakeven lock fires, not the initial SL.
        set_ltp(&rig, 99.0, 2);
        assert_eq!(
            evaluate(&rig).await,
            RiskAction::Exited {
                reason: ExitReason::BreakevenLock
            }
        );
    }

    #[tokio::test]
    async fn armed_position_ignores_initial_stop() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_ltp(&rig, 115.0, 1);
        evaluate(&rig).await; // arms

        // −2.5% from entry would hit the initial SL, but breakeven is armed
        // and 97.5 < entry, so the lock fires instead.
        set_ltp(&rig, 97.5, 2);
        assert_eq!(
            evaluate(&rig).await,
            RiskAction::Exited {
                reason: ExitReason::BreakevenLock
            }
        );
    }

    #[tokio::test]
    async fn trailing_stop_fires_at_trigger() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_trend_on(&rig).await;

        set_ltp(&rig, 120.0, 1);
        let action = evaluate(&rig).await;
        // Trigger lands at 120 · 0.95 = 114.
        match action {
            RiskAction::TriggerAdjusted { trigger } => {
                assert!((trigger - 114.0).abs() < 1e-9, "trigger {trigger}");
            }
            other => panic!("expected adjustment, got {other:?}"),
        }

        // Still above trigger and entry: held (no step-worthy improvement).
        set_ltp(&rig, 116.0, 2);
        assert_eq!(evaluate(&rig).await, RiskAction::Held);

        set_ltp(&rig, 113.5, 3);
        assert_eq!(
            evaluate(&rig).await,
            RiskAction::Exited {
                reason: ExitReason::TrailingStop
            }
        );
    }

    #[tokio::test]
    async fn trigger_adjustment_respects_rupee_step() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_trend_on(&rig).await;

        // Seed: peak 115.26 → trigger 109.50 (115.26 · 0.95 = 109.497 ≈ …).
        rig.store
            .set_string(&keys::trigger("42501"), "109.50", Some(3_600))
            .await
            .unwrap();

        // Peak 115.4 → candidate 109.63, only +0.13: clamped.
        set_ltp(&rig, 115.4, 1);
        assert_eq!(evaluate(&rig).await, RiskAction::Held);
        assert_eq!(
            rig.store.get_string(&keys::trigger("42501")).await.unwrap().unwrap(),
            "109.50"
        );

        // Peak 119 → candidate 113.05, +3.55 ≥ step: accepted.
        set_ltp(&rig, 119.0, 2);
        let action = evaluate(&rig).await;
        match action {
            RiskAction::TriggerAdjusted { trigger } => {
                assert!((trigger - 113.05).abs() < 1e-9, "trigger {trigger}");
            }
            other => panic!("expected adjustment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn trend_off_freezes_the_trigger() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        // No trend key at all — armed but no adjustments.
        set_ltp(&rig, 120.0, 1);
        assert_eq!(evaluate(&rig).await, RiskAction::Held);
        assert!(rig
            .store
            .get_string(&keys::trigger("42501"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn peak_is_monotonic_across_price_retreats() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;

        set_ltp(&rig, 110.0, 1);
        evaluate(&rig).await;
        set_ltp(&rig, 105.0, 2);
        evaluate(&rig).await;

        let peak: f64 = rig
            .store
            .get_string(&keys::peak("42501"))
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert!((peak - 110.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_exit_within_window_is_suppressed() {
        let rig = rig().await;
        let position = open_position(&rig, 75, 100.0).await;
        set_ltp(&rig, 50.0, 1);

        // First pass exits; calling the ladder again with the stale position
        // snapshot inside the window must not produce a second sell.
        assert_eq!(
            rig.rider.evaluate_position(&position).await.unwrap(),
            RiskAction::Exited {
                reason: ExitReason::Emergency
            }
        );
        assert_eq!(
            rig.rider.evaluate_position(&position).await.unwrap(),
            RiskAction::Duplicate
        );

        let sells = rig
            .journal
            .snapshot()
            .into_iter()
            .filter(|o| o.side == Side::Sell)
            .count();
        assert_eq!(sells, 1);
    }

    #[tokio::test]
    async fn exit_cleans_up_risk_keys() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_trend_on(&rig).await;
        set_ltp(&rig, 120.0, 1);
        evaluate(&rig).await; // sets peak + trigger

        set_ltp(&rig, 50.0, 2);
        evaluate(&rig).await; // emergency exit

        assert!(rig.store.get_string(&keys::peak("42501")).await.unwrap().is_none());
        assert!(rig.store.get_string(&keys::trigger("42501")).await.unwrap().is_none());
        assert!(rig.store.get_string(&keys::trend("42501")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flatten_all_exits_every_position() {
        let rig = rig().await;
        open_position(&rig, 75, 100.0).await;
        set_ltp(&rig, 104.0, 1);

        let other = PositionKey::long(Segment::NseFno, "42502");
        rig.positions
            .add_position(other, 50, Money::from_f64(80.0), meta())
            .await
            .unwrap();
        rig.ticks.put(Tick::ltp_only(
            Segment::NseFno,
            "42502",
            Money::from_f64(82.0),
            1,
        ));

        let exited = rig.rider.flatten_all(ExitReason::SessionEnd).await;
        assert_eq!(exited, 2);
        assert_eq!(rig.positions.open_count().await, 0);
    }
}
