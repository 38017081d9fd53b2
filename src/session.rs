// =============================================================================
// Trading session identity and IST market clock
// =============================================================================
//
// All persisted state is scoped to a session id of the form `PAPER_YYYYMMDD`
// (or `LIVE_YYYYMMDD`), date-scoped in IST so that a restart within the same
// trading day resumes the same wallet and positions.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Asia::Kolkata;
use chrono_tz::Tz;

use crate::types::Mode;

/// NSE/BSE cash-session open, IST.
pub fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).expect("valid market open time")
}

/// NSE/BSE cash-session close, IST.
pub fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid market close time")
}

/// Intraday flatten cutoff — all open positions are market-exited at this
/// time so nothing carries overnight.
pub fn flatten_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 25, 0).expect("valid flatten cutoff time")
}

/// Current instant in IST.
pub fn ist_now() -> DateTime<Tz> {
    Utc::now().with_timezone(&Kolkata)
}

/// ISO-8601 timestamp with the IST offset, the persisted timestamp format.
pub fn ist_timestamp() -> String {
    ist_now().to_rfc3339()
}

/// Session id for the current IST trading date, e.g. `PAPER_20260801`.
pub fn session_id(mode: Mode) -> String {
    session_id_for(mode, ist_now())
}

fn session_id_for(mode: Mode, at: DateTime<Tz>) -> String {
    format!("{}_{}", mode, at.format("%Y%m%d"))
}

/// Whether the exchange is open at `at`. Weekends are closed; exchange
/// holidays are not modelled and are handled by the feed simply never
/// ticking.
pub fn is_market_open_at(at: DateTime<Tz>) -> bool {
    match at.weekday() {
        Weekday::Sat | Weekday::Sun => return false,
        _ => {}
    }
    let t = at.time();
    t >= market_open() && t <= market_close()
}

pub fn is_market_open() -> bool {
    is_market_open_at(ist_now())
}

/// True once the intraday flatten cutoff has passed for the day.
pub fn past_flatten_cutoff(at: DateTime<Tz>) -> bool {
    match at.weekday() {
        Weekday::Sat | Weekday::Sun => return false,
        _ => {}
    }
    at.time() >= flatten_cutoff()
}

/// Epoch milliseconds for "now" — the timestamp stamped on synthetic ticks.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}
