// =============================================================================
// Option picker & quantity sizer
// =============================================================================
//
// Picker: given the spot level and an entry signal, choose the strike (ATM,
// or the next strike toward the money when it sits strictly closer to spot),
// resolve both legs' security ids for the nearest expiry, and estimate the
// entry premium from the tick cache.
//
// Sizer: lots = floor(min(max_lots, (available · allocation) / (premium ·
// lot_size))); the order quantity is lots · lot_size and zero means skip.
// =============================================================================

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::instruments::InstrumentStore;
use crate::money::Money;
use crate::ticks::TickCache;
use crate::types::{OptionType, SecurityId, Segment, SignalKind};

/// Premium estimate used before the chosen leg has ever ticked, as a
/// fraction of spot. Sizing only; fills always use the live LTP.
const PREMIUM_ESTIMATE_PCT: f64 = 0.01;

/// A resolved candidate trade: both legs of the chosen strike.
#[derive(Debug, Clone)]
pub struct OptionPick {
    pub underlying: String,
    pub strike: i64,
    pub expiry: NaiveDate,
    pub segment: Segment,
    pub ce_security_id: SecurityId,
    pub pe_security_id: SecurityId,
    pub lot_size: u32,
    /// Estimated premium of the leg the signal buys.
    pub premium: Money,
}

impl OptionPick {
    /// Security id of the leg a signal buys.
    pub fn leg(&self, kind: SignalKind) -> Option<(&SecurityId, OptionType)> {
        match kind {
            SignalKind::BuyCe => Some((&self.ce_security_id, OptionType::Ce)),
            SignalKind::BuyPe => Some((&self.pe_security_id, OptionType::Pe)),
            SignalKind::None => None,
        }
    }
}

/// Strike chosen for a signal: ATM, nudged one step toward the money when
/// that neighbour is strictly closer to spot.
pub fn choose_strike(spot: f64, step: i64, kind: SignalKind) -> i64 {
    let step_f = step as f64;
    let atm = (spot / step_f).round() as i64 * step;

    let neighbour = match kind {
        SignalKind::BuyCe => atm + step,
        SignalKind::BuyPe => atm - step,
        SignalKind::None => return atm,
    };

    let d_atm = (spot - atm as f64).abs();
    let d_neighbour = (spot - neighbour as f64).abs();
    if d_neighbour < d_atm {
        neighbour
    } else {
        atm
    }
}

/// Resolve the tradeable pick for `signal` at the current spot.
pub fn pick_option(
    instruments: &InstrumentStore,
    ticks: &TickCache,
    underlying: &str,
    spot: f64,
    kind: SignalKind,
    today: NaiveDate,
) -> crate::error::Result<OptionPick> {
    let step = instruments.strike_step(underlying)?;
    let expiry = instruments.nearest_expiry(underlying, today)?;
    let strike = choose_strike(spot, step, kind);

    let ce = instruments.resolve(underlying, expiry, strike, OptionType::Ce)?;
    let pe = instruments.resolve(underlying, expiry, strike, OptionType::Pe)?;

    let leg_id = match kind {
        SignalKind::BuyPe => &pe.security_id,
        _ => &ce.security_id,
    };
    let premium = match ticks.ltp(ce.segment, leg_id) {
        Some(ltp) if ltp.is_positive() => ltp,
        _ => {
            let estimate = Money::from_f64(spot * PREMIUM_ESTIMATE_PCT);
            warn!(
                underlying,
                strike,
                security_id = %leg_id,
                estimate = %estimate,
                "no tick for picked leg — premium estimated from spot"
            );
            estimate
        }
    };

    debug!(
        underlying,
        spot,
        strike,
        expiry = %expiry,
        premium = %premium,
        "option picked"
    );

    Ok(OptionPick {
        underlying: underlying.to_string(),
        strike,
        expiry,
        segment: ce.segment,
        ce_security_id: ce.security_id.clone(),
        pe_security_id: pe.security_id.clone(),
        lot_size: ce.lot_size,
        premium,
    })
}

/// Order quantity from the wallet's available balance. Zero means the entry
/// is skipped.
pub fn size_quantity(
    available: Money,
    allocation_pct: f64,
    premium: Money,
    lot_size: u32,
    max_lots: u32,
) -> u32 {
    if !premium.is_positive() || lot_size == 0 || max_lots == 0 {
        return 0;
    }

    let allocation = match Decimal::from_f64(allocation_pct) {
        Some(a) if a > Decimal::ZERO => a,
        _ => return 0,
    };

    let budget = available.as_decimal() * allocation;
    let per_lot = premium.as_decimal() * Decimal::from(lot_size);
    if per_lot <= Decimal::ZERO {
        return 0;
    }

    let lots = (budget / per_lot).floor().to_u32().unwrap_or(0);
    lots.min(max_lots) * lot_size
}
