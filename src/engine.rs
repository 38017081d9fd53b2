// =============================================================================
// Engine — wires the subsystems and runs a trading session
// =============================================================================
//
// Dependency direction is strictly top-down: the engine injects the store,
// tick cache, instruments, wallet, positions, and broker into the layers
// that need them; no lower layer ever reaches back up.
//
// Scheduled tasks:
//   trading-decision   signal gate → picker → sizer → broker BUY
//   risk-loop          trend rider over open positions
//   status             status line + session report checkpoint
//   md:{symbol}        tick cache → candle series + mark-to-market,
//                      staggered across symbols
//
// Session-stopping conditions: manual panic switch (Ctrl+C), the `-t`
// auto-stop timeout, the intraday flatten cutoff, a day-loss-limit breach
// (flat-all, then fatal), and the session profit target once flat (clean).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, DhanClient, LiveBroker, OrderJournal, OrderRequest, PaperBroker};
use crate::candles::CandleStore;
use crate::config::AppConfig;
use crate::error::ScalperError;
use crate::feed::{spawn_feed, FeedHandle, FeedInstrument};
use crate::instruments::InstrumentStore;
use crate::money::Money;
use crate::picker::{pick_option, size_quantity};
use crate::positions::{ContractMeta, PositionTracker};
use crate::reporter::SessionReporter;
use crate::risk::{ExitReason, TrendRider};
use crate::sched::Scheduler;
use crate::session::{ist_now, is_market_open_at, past_flatten_cutoff, session_id};
use crate::signal::SignalEngine;
use crate::store::{keys, ttl, KvStore, RedisStore};
use crate::ticks::TickCache;
use crate::types::{Mode, Segment, Side, SignalKind};
use crate::wallet::PaperWallet;

// ---------------------------------------------------------------------------
// Stop handling
// ---------------------------------------------------------------------------

/// Why the session ended. Fatal reasons map to a non-zero exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Clean(String),
    Fatal(String),
}

impl StopReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clean(_) => 0,
            Self::Fatal(_) => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Funds
// ---------------------------------------------------------------------------

/// Where "available balance" comes from for sizing.
pub enum FundsSource {
    Paper(Arc<PaperWallet>),
    Live(Arc<DhanClient>),
}

impl FundsSource {
    async fn available(&self) -> Money {
        match self {
            Self::Paper(wallet) => wallet.available().await,
            Self::Live(client) => match client.available_balance().await {
                Ok(balance) => Money::from_f64(balance),
                Err(e) => {
                    warn!(error = %e, "fund limit lookup failed — sizing as zero");
                    Money::ZERO
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the scheduled task bodies need, shared behind one `Arc`.
pub struct EngineContext {
    pub cfg: AppConfig,
    pub mode: Mode,
    pub dryrun: bool,
    pub session_id: String,
    pub store: Arc<dyn KvStore>,
    pub instruments: Arc<InstrumentStore>,
    pub ticks: Arc<TickCache>,
    pub candles: Arc<CandleStore>,
    pub signals: Arc<SignalEngine>,
    pub wallet: Arc<PaperWallet>,
    pub positions: Arc<PositionTracker>,
    pub broker: Arc<dyn Broker>,
    pub rider: Arc<TrendRider>,
    pub reporter: Arc<SessionReporter>,
    pub journal: Arc<OrderJournal>,
    pub funds: FundsSource,
    pub feed: Option<FeedHandle>,
    stop_reason: Mutex<Option<StopReason>>,
    stop_notify: Notify,
}

impl EngineContext {
    /// Request shutdown. The first reason wins.
    pub fn request_stop(&self, reason: StopReason) {
        let mut slot = self.stop_reason.lock();
        if slot.is_none() {
            info!(?reason, "session stop requested");
            *slot = Some(reason);
            self.stop_notify.notify_waiters();
        }
    }

    pub fn stopping(&self) -> bool {
        self.stop_reason.lock().is_some()
    }

    fn spot_segment() -> Segment {
        Segment::IdxI
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    ctx: Arc<EngineContext>,
    scheduler: Arc<Scheduler>,
    enhanced: bool,
}

impl Engine {
    /// Build a full engine for `mode`. Connects Redis, loads the instrument
    /// master, resumes the session wallet and positions, and spawns the
    /// market feed.
    pub async fn build(cfg: AppConfig, mode: Mode, dryrun: bool, enhanced: bool) -> anyhow::Result<Self> {
        let session = session_id(mode);
        info!(session_id = %session, %mode, dryrun, "building engine");

        let redis = RedisStore::connect(&cfg.redis_url).await?;
        let store: Arc<dyn KvStore> = Arc::new(redis);

        let instruments = Arc::new(InstrumentStore::load(&cfg.instruments_csv)?);
        let ticks = Arc::new(TickCache::new());
        let candles = Arc::new(CandleStore::default());
        let signals = Arc::new(SignalEngine::new(
            cfg.supertrend_period,
            cfg.supertrend_multiplier,
            cfg.adx_period,
            cfg.adx_threshold,
        ));

        let wallet = Arc::new(
            PaperWallet::load_or_init(
                store.clone(),
                &session,
                Money::from_f64(cfg.starting_balance),
            )
            .await?,
        );
        let positions = Arc::new(PositionTracker::new(store.clone(), &session));
        let recovered = positions.recover().await?;
        if recovered > 0 {
            info!(recovered, "resuming open positions from a previous run today");
        }

        let journal = Arc::new(OrderJournal::new());

        let (broker, funds): (Arc<dyn Broker>, FundsSource) = match mode {
            Mode::Paper => {
                let broker = Arc::new(PaperBroker::new(
                    ticks.clone(),
                    wallet.clone(),
                    positions.clone(),
                    store.clone(),
                    journal.clone(),
                    Money::from_f64(cfg.charge_per_order),
                ));
                (broker, FundsSource::Paper(wallet.clone()))
            }
            Mode::Live => {
                if cfg.client_id.is_empty() || cfg.access_token.is_empty() {
                    return Err(ScalperError::ConfigInvalid(
                        "live mode requires CLIENT_ID and ACCESS_TOKEN".into(),
                    )
                    .into());
                }
                let client = Arc::new(DhanClient::new(&cfg.client_id, &cfg.access_token));
                let broker = Arc::new(LiveBroker::new(
                    client.clone(),
                    positions.clone(),
                    store.clone(),
                    journal.clone(),
                ));
                (broker, FundsSource::Live(client))
            }
        };

        let rider = Arc::new(TrendRider::new(
            cfg.risk.clone(),
            ticks.clone(),
            positions.clone(),
            store.clone(),
            broker.clone(),
        ));

        let reporter = Arc::new(SessionReporter::new(
            store.clone(),
            wallet.clone(),
            positions.clone(),
            journal.clone(),
            &session,
        ));

        // Initial feed subscriptions: every enabled index spot plus any
        // recovered option positions.
        let mut subscriptions = Vec::new();
        for symbol in cfg.active_symbols() {
            match instruments.spot_security(&symbol.name) {
                Ok(id) => subscriptions.push(FeedInstrument {
                    segment: EngineContext::spot_segment(),
                    security_id: id.clone(),
                }),
                Err(e) => warn!(symbol = %symbol.name, error = %e, "no spot security — symbol will not tick"),
            }
        }
        for position in positions.all().await {
            subscriptions.push(FeedInstrument {
                segment: position.segment,
                security_id: position.security_id,
            });
        }
        let feed = spawn_feed(
            cfg.client_id.clone(),
            cfg.access_token.clone(),
            subscriptions,
            ticks.clone(),
        );

        let ctx = Arc::new(EngineContext {
            cfg,
            mode,
            dryrun,
            session_id: session,
            store,
            instruments,
            ticks,
            candles,
            signals,
            wallet,
            positions,
            broker,
            rider,
            reporter,
            journal,
            funds,
            feed: Some(feed),
            stop_reason: Mutex::new(None),
            stop_notify: Notify::new(),
        });

        Ok(Self {
            ctx,
            scheduler: Arc::new(Scheduler::new()),
            enhanced,
        })
    }

    /// Register the recurring tasks and run until a stop condition fires.
    /// Returns the stop reason for the process exit code.
    pub async fn run(&self, auto_stop: Option<Duration>) -> StopReason {
        self.register_tasks();
        self.scheduler.start();
        info!(session_id = %self.ctx.session_id, "engine running");

        let stopped = self.ctx.stop_notify.notified();
        tokio::pin!(stopped);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                self.ctx.request_stop(StopReason::Clean("interrupted".into()));
            }
            _ = &mut stopped => {}
            _ = async {
                match auto_stop {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending().await,
                }
            } => {
                self.ctx.request_stop(StopReason::Clean("auto-stop timeout".into()));
            }
        }

        // Flatten anything still open, then snapshot and wind down.
        if !self.ctx.dryrun && self.ctx.positions.open_count().await > 0 {
            let exited = self.ctx.rider.flatten_all(ExitReason::SessionEnd).await;
            info!(exited, "open positions flattened at shutdown");
        }
        if let Err(e) = self.ctx.reporter.finalise().await {
            error!(error = %e, "final session report failed");
        }
        self.scheduler.stop(Duration::from_secs(5)).await;

        let reason = self
            .ctx
            .stop_reason
            .lock()
            .clone()
            .unwrap_or_else(|| StopReason::Clean("stopped".into()));
        info!(?reason, "session ended");
        reason
    }

    fn register_tasks(&self) {
        let intervals = self.ctx.cfg.intervals.clone();

        let ctx = self.ctx.clone();
        self.scheduler.schedule_recurring(
            "trading-decision",
            Duration::from_secs(intervals.decision_secs),
            Arc::new(move || {
                let ctx = ctx.clone();
                Box::pin(async move { decision_tick(ctx).await })
            }),
        );

        let ctx = self.ctx.clone();
        self.scheduler.schedule_recurring(
            "risk-loop",
            Duration::from_secs(intervals.risk_secs),
            Arc::new(move || {
                let ctx = ctx.clone();
                Box::pin(async move {
                    if !ctx.stopping() {
                        ctx.rider.evaluate_all().await;
                    }
                })
            }),
        );

        let ctx = self.ctx.clone();
        let enhanced = self.enhanced;
        self.scheduler.schedule_recurring(
            "status",
            Duration::from_secs(intervals.status_secs),
            Arc::new(move || {
                let ctx = ctx.clone();
                Box::pin(async move { status_tick(ctx, enhanced).await })
            }),
        );

        let symbols: Vec<String> = self
            .ctx
            .cfg
            .active_symbols()
            .map(|s| s.name.clone())
            .collect();
        for (index, symbol) in symbols.into_iter().enumerate() {
            let ctx = self.ctx.clone();
            let name = format!("md:{symbol}");
            let sym = symbol.clone();
            self.scheduler.schedule_recurring_offset(
                &name,
                Duration::from_secs(intervals.md_refresh_secs),
                Duration::from_secs(intervals.md_stagger_secs * index as u64),
                Arc::new(move || {
                    let ctx = ctx.clone();
                    let sym = sym.clone();
                    Box::pin(async move { market_data_tick(ctx, sym).await })
                }),
            );
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.ctx.session_id)
            .field("mode", &self.ctx.mode)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

/// The trading-decision tick: session-level guards, then the signal →
/// picker → sizer → broker pipeline per symbol.
pub async fn decision_tick(ctx: Arc<EngineContext>) {
    if ctx.stopping() {
        return;
    }

    let now = ist_now();

    // Market closed is not an error: return without acting.
    if ctx.cfg.enforce_market_hours && !is_market_open_at(now) {
        debug!("market closed — decision tick idle");
        return;
    }

    // Intraday flatten cutoff.
    if past_flatten_cutoff(now) {
        if ctx.positions.open_count().await > 0 {
            let exited = ctx.rider.flatten_all(ExitReason::SessionEnd).await;
            info!(exited, "flatten cutoff reached");
        }
        ctx.request_stop(StopReason::Clean("intraday flatten cutoff".into()));
        return;
    }

    if check_session_limits(&ctx).await {
        return;
    }

    let today = now.date_naive();
    for symbol_cfg in ctx.cfg.active_symbols() {
        let symbol = symbol_cfg.name.clone();

        let spot_id = match ctx.instruments.spot_security(&symbol) {
            Ok(id) => id.clone(),
            Err(_) => continue,
        };

        let spot_tick = match ctx.ticks.get(EngineContext::spot_segment(), &spot_id) {
            Some(t) => t,
            None => {
                debug!(symbol, "no spot tick yet");
                continue;
            }
        };

        // Feed health: entries pause when the spot has gone quiet; exits in
        // the risk loop keep working off the last tick.
        let age = ctx
            .ticks
            .age_secs(EngineContext::spot_segment(), &spot_id)
            .unwrap_or(u64::MAX);
        let stale = age > ctx.cfg.heartbeat_window_secs;
        if stale {
            warn!(symbol, age_secs = age, "market data stale — entries paused");
        }

        let bars = ctx.candles.three_minute(&symbol);
        let signal = ctx.signals.evaluate(&symbol, &bars);
        publish_trend(&ctx, &symbol).await;

        if signal.kind == SignalKind::None || stale {
            continue;
        }

        if ctx.dryrun {
            info!(
                symbol,
                signal = %signal.kind,
                adx = format!("{:.1}", signal.adx),
                spot = %spot_tick.ltp,
                "dryrun — signal not traded"
            );
            continue;
        }

        if ctx.positions.open_count().await >= ctx.cfg.max_open_positions as usize {
            info!(symbol, signal = %signal.kind, "signal skipped — position limit reached");
            continue;
        }

        let spot = spot_tick.ltp.to_f64();
        let pick = match pick_option(
            &ctx.instruments,
            &ctx.ticks,
            &symbol,
            spot,
            signal.kind,
            today,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol, error = %e, "option pick failed");
                continue;
            }
        };

        let (security_id, option_type) = match pick.leg(signal.kind) {
            Some(leg) => leg,
            None => continue,
        };

        // Get the leg ticking before (and after) the entry.
        if let Some(feed) = &ctx.feed {
            feed.subscribe(vec![FeedInstrument {
                segment: pick.segment,
                security_id: security_id.clone(),
            }]);
        }

        let available = ctx.funds.available().await;
        let quantity = size_quantity(
            available,
            ctx.cfg.allocation_pct,
            pick.premium,
            pick.lot_size,
            ctx.cfg.max_lots,
        );
        if quantity == 0 {
            info!(
                symbol,
                premium = %pick.premium,
                available = %available,
                "entry skipped — sized to zero"
            );
            continue;
        }

        let request = OrderRequest {
            underlying_symbol: symbol.clone(),
            security_id: security_id.clone(),
            segment: pick.segment,
            side: Side::Buy,
            quantity: quantity as i64,
            price: pick.premium,
            intent: "entry".into(),
            meta: Some(ContractMeta {
                option_type,
                strike: pick.strike,
                expiry: pick.expiry.to_string(),
                underlying_symbol: symbol.clone(),
            }),
        };

        match ctx.broker.place_order(request).await {
            Ok(result) => {
                info!(
                    symbol,
                    signal = %signal.kind,
                    strike = pick.strike,
                    qty = quantity,
                    fill = %result.fill_price,
                    order_id = %result.order_id,
                    "entry executed"
                );
            }
            Err(ScalperError::Duplicate(d)) => {
                debug!(symbol, "entry suppressed as duplicate: {d}");
            }
            Err(e) => {
                warn!(symbol, error = %e, "entry failed");
            }
        }
    }
}

/// Day-loss limit and session target. Returns true when the session is over.
async fn check_session_limits(ctx: &Arc<EngineContext>) -> bool {
    let balance = ctx.wallet.snapshot().await;
    let unrealized = ctx.positions.total_unrealized().await;
    let session_pnl = balance.realized_pnl + unrealized;

    let loss_limit = Money::from_f64(ctx.cfg.risk.day_loss_limit);
    if session_pnl <= loss_limit.negate() {
        error!(
            session_pnl = %session_pnl,
            limit = %loss_limit,
            "day loss limit breached — flattening and stopping"
        );
        ctx.rider.flatten_all(ExitReason::DayLossLimit).await;
        ctx.request_stop(StopReason::Fatal("day loss limit breached".into()));
        return true;
    }

    let target = Money::from_f64(ctx.cfg.risk.session_target);
    if session_pnl >= target && ctx.positions.open_count().await == 0 {
        info!(session_pnl = %session_pnl, target = %target, "session target reached — stopping clean");
        ctx.request_stop(StopReason::Clean("session target reached".into()));
        return true;
    }

    false
}

/// Write `trend:{security_id}` for every open position of `symbol`, so the
/// risk loop's trailing adjustments follow the signal engine's view.
pub async fn publish_trend(ctx: &Arc<EngineContext>, symbol: &str) {
    for position in ctx.positions.all().await {
        if position.underlying_symbol != symbol {
            continue;
        }
        let on = ctx.signals.trend_favours(symbol, position.option_type);
        let value = if on { "ON" } else { "OFF" };
        if let Err(e) = ctx
            .store
            .set_string(&keys::trend(&position.security_id), value, Some(ttl::TREND))
            .await
        {
            warn!(security_id = %position.security_id, error = %e, "trend flag write failed");
        }
    }
}

/// The status tick: one summary line, optional per-position detail, and a
/// session report checkpoint.
async fn status_tick(ctx: Arc<EngineContext>, enhanced: bool) {
    let balance = ctx.wallet.snapshot().await;
    let unrealized = ctx.positions.total_unrealized().await;
    let open = ctx.positions.open_count().await;

    info!(
        session_id = %ctx.session_id,
        available = %balance.available.format(),
        used = %balance.used.format(),
        realized = %balance.realized_pnl.format(),
        unrealized = %unrealized.format(),
        total = %(balance.starting_balance + balance.realized_pnl + unrealized).format(),
        open_positions = open,
        orders = ctx.journal.len(),
        "status"
    );

    if enhanced {
        for p in ctx.positions.all().await {
            info!(
                security_id = %p.security_id,
                underlying = %p.underlying_symbol,
                leg = %p.option_type,
                strike = p.strike,
                net_qty = p.net_qty,
                entry = %p.buy_avg,
                ltp = %p.current_price,
                pnl = %p.unrealized_pnl,
                "open position"
            );
        }
    }

    if let Err(e) = ctx.reporter.checkpoint().await {
        warn!(error = %e, "session checkpoint failed");
    }
}

/// Per-symbol market-data refresh: fold the spot tick into the candle
/// series and mark open option positions to market.
async fn market_data_tick(ctx: Arc<EngineContext>, symbol: String) {
    let spot_id = match ctx.instruments.spot_security(&symbol) {
        Ok(id) => id.clone(),
        Err(_) => return,
    };

    if let Some(tick) = ctx.ticks.get(EngineContext::spot_segment(), &spot_id) {
        ctx.candles
            .apply_tick(&symbol, tick.ltp.to_f64(), tick.volume, tick.ts);
    }

    for position in ctx.positions.all().await {
        if position.underlying_symbol != symbol {
            continue;
        }
        if let Some(ltp) = ctx.ticks.ltp(position.segment, &position.security_id) {
            let key = position.key();
            if let Err(e) = ctx.positions.update_unrealized(&key, ltp).await {
                warn!(security_id = %key.security_id, error = %e, "mark-to-market failed");
            }
        }
    }
}
