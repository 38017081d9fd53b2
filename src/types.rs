// =============================================================================
// Shared types used across the scalping engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Broker-assigned instrument identifier (string form, as the wire uses it).
pub type SecurityId = String;

/// Whether the engine routes orders to the simulated wallet or the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Paper,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Order transaction side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Net-position direction. SHORT is representable but no entry path in this
/// engine produces one; all entries are long option buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(format!("unknown position side: {other}")),
        }
    }
}

/// Option leg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Ce,
    Pe,
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ce => write!(f, "CE"),
            Self::Pe => write!(f, "PE"),
        }
    }
}

impl std::str::FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CE" => Ok(Self::Ce),
            "PE" => Ok(Self::Pe),
            other => Err(format!("unknown option type: {other}")),
        }
    }
}

/// Market segment tag, combined with a security id to identify an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// NSE futures & options.
    NseFno,
    /// BSE futures & options (SENSEX contracts).
    BseFno,
    /// Index spot values.
    IdxI,
}

impl Segment {
    /// Wire name used by the broker API and Redis keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NseFno => "NSE_FNO",
            Self::BseFno => "BSE_FNO",
            Self::IdxI => "IDX_I",
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NSE_FNO" => Ok(Self::NseFno),
            "BSE_FNO" => Ok(Self::BseFno),
            "IDX_I" => Ok(Self::IdxI),
            other => Err(format!("unknown exchange segment: {other}")),
        }
    }
}

/// Latest market state for one instrument, written by the feed ingestor and
/// overwritten in the tick cache. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub ltp: Money,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Exchange timestamp, epoch milliseconds.
    pub ts: i64,
}

impl Tick {
    /// Minimal tick carrying only a last-traded price (index feeds send no
    /// OHLC or volume).
    pub fn ltp_only(
        segment: Segment,
        security_id: impl Into<SecurityId>,
        ltp: Money,
        ts: i64,
    ) -> Self {
        let px = ltp.to_f64();
        Self {
            segment,
            security_id: security_id.into(),
            ltp,
            open: px,
            high: px,
            low: px,
            close: px,
            volume: 0,
            ts,
        }
    }
}

/// What the signal gate decided for one symbol on one decision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    BuyCe,
    BuyPe,
    None,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyCe => write!(f, "BUY_CE"),
            Self::BuyPe => write!(f, "BUY_PE"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Full signal emitted per symbol per decision tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    pub adx: f64,
    pub supertrend_direction: i8,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trips_wire_names() {
        for seg in [Segment::NseFno, Segment::BseFno, Segment::IdxI] {
            let parsed: Segment = seg.as_str().parse().unwrap();
            assert_eq!(parsed, seg);
        }
        assert!("NSE_EQ".parse::<Segment>().is_err());
    }

    #[test]
    fn option_type_round_trips() {
        assert_eq!("CE".parse::<OptionType>().unwrap(), OptionType::Ce);
        assert_eq!("PE".parse::<OptionType>().unwrap(), OptionType::Pe);
        assert_eq!(OptionType::Ce.to_string(), "CE");
    }

    #[test]
    fn ltp_only_tick_mirrors_price_into_ohlc() {
        let tick = Tick::ltp_only(Segment::IdxI, "13", Money::from_f64(24_312.4), 1_700_000_000_000);
        assert_eq!(tick.volume, 0);
        assert!((tick.open - 24_312.4).abs() < 1e-9);
        assert!((tick.close - 24_312.4).abs() < 1e-9);
    }
}
