// =============================================================================
// Instrument resolver — broker scrip master lookup
// =============================================================================
//
// The broker publishes a CSV master mapping every tradeable contract to a
// numeric security id. This module loads the rows relevant to index options,
// indexes them for O(1) resolution, and answers:
//
//   * ordered expiries per underlying,
//   * (underlying, expiry, strike, CE|PE) -> security id + lot size,
//   * index spot security ids,
//   * the strike step, derived from the actual strike grid.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, ScalperError};
use crate::types::{OptionType, SecurityId, Segment};

/// One CSV row of the scrip master. Non-option rows (futures, equities) are
/// skipped at load time.
#[derive(Debug, Deserialize)]
struct InstrumentRow {
    underlying_symbol: String,
    security_id: String,
    segment: String,
    instrument_type: String,
    #[serde(default)]
    expiry_date: String,
    #[serde(default)]
    strike: Option<i64>,
    #[serde(default)]
    option_type: String,
    #[serde(default)]
    lot_size: Option<u32>,
}

/// A resolved option contract.
#[derive(Debug, Clone)]
pub struct OptionInstrument {
    pub security_id: SecurityId,
    pub segment: Segment,
    pub lot_size: u32,
}

/// In-memory index over the scrip master. Built once at startup; read-only
/// afterwards, so it is shared as a plain `Arc` with no lock.
#[derive(Debug, Default)]
pub struct InstrumentStore {
    options: HashMap<(String, NaiveDate, i64, OptionType), OptionInstrument>,
    expiries: HashMap<String, Vec<NaiveDate>>,
    spot: HashMap<String, SecurityId>,
    lot_sizes: HashMap<String, u32>,
    strike_steps: HashMap<String, i64>,
}

impl InstrumentStore {
    /// Load the scrip master from a CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            ScalperError::ConfigInvalid(format!(
                "cannot open instrument master {}: {e}",
                path.display()
            ))
        })?;
        let store = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            options = store.options.len(),
            underlyings = store.expiries.len(),
            "instrument master loaded"
        );
        Ok(store)
    }

    /// Parse the scrip master from any reader (tests feed string buffers).
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut store = Self::default();
        let mut expiry_sets: HashMap<String, BTreeSet<NaiveDate>> = HashMap::new();
        let mut strike_sets: HashMap<String, BTreeSet<i64>> = HashMap::new();

        for record in csv_reader.deserialize::<InstrumentRow>() {
            let row = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping malformed instrument row");
                    continue;
                }
            };

            let underlying = row.underlying_symbol.to_uppercase();

            if row.instrument_type.eq_ignore_ascii_case("INDEX") {
                store.spot.insert(underlying, row.security_id);
                continue;
            }
            if !row.instrument_type.eq_ignore_ascii_case("OPTIDX") {
                continue;
            }

            let segment: Segment = match row.segment.parse() {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, security_id = %row.security_id, "skipping row");
                    continue;
                }
            };
            let expiry = match NaiveDate::parse_from_str(&row.expiry_date, "%Y-%m-%d") {
                Ok(d) => d,
                Err(_) => {
                    warn!(
                        expiry = %row.expiry_date,
                        security_id = %row.security_id,
                        "skipping row with unparseable expiry"
                    );
                    continue;
                }
            };
            let (strike, option_type) = match (row.strike, row.option_type.parse::<OptionType>()) {
                (Some(strike), Ok(ot)) => (strike, ot),
                _ => {
                    warn!(security_id = %row.security_id, "skipping option row without strike/type");
                    continue;
                }
            };
            let lot_size = row.lot_size.unwrap_or(0);
            if lot_size == 0 {
                warn!(security_id = %row.security_id, "skipping option row with zero lot size");
                continue;
            }

            expiry_sets.entry(underlying.clone()).or_default().insert(expiry);
            strike_sets.entry(underlying.clone()).or_default().insert(strike);
            store.lot_sizes.entry(underlying.clone()).or_insert(lot_size);
            store.options.insert(
                (underlying, expiry, strike, option_type),
                OptionInstrument {
                    security_id: row.security_id,
                    segment,
                    lot_size,
                },
            );
        }

        for (underlying, set) in expiry_sets {
            store
                .expiries
                .insert(underlying, set.into_iter().collect());
        }
        for (underlying, strikes) in strike_sets {
            store
                .strike_steps
                .insert(underlying.clone(), derive_strike_step(&strikes));
        }

        Ok(store)
    }

    /// Expiries for `underlying`, ascending. Empty when unknown.
    pub fn expiries(&self, underlying: &str) -> &[NaiveDate] {
        self.expiries
            .get(underlying)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nearest expiry on or after `today`.
    pub fn nearest_expiry(&self, underlying: &str, today: NaiveDate) -> Result<NaiveDate> {
        self.expiries(underlying)
            .iter()
            .copied()
            .find(|d| *d >= today)
            .ok_or_else(|| {
                ScalperError::InvalidInstrument(format!("no live expiry for {underlying}"))
            })
    }

    /// Resolve one option contract.
    pub fn resolve(
        &self,
        underlying: &str,
        expiry: NaiveDate,
        strike: i64,
        option_type: OptionType,
    ) -> Result<&OptionInstrument> {
        self.options
            .get(&(underlying.to_uppercase(), expiry, strike, option_type))
            .ok_or_else(|| {
                ScalperError::InvalidInstrument(format!(
                    "{underlying} {expiry} {strike} {option_type} not in scrip master"
                ))
            })
    }

    /// Index spot security id (IDX_I segment).
    pub fn spot_security(&self, underlying: &str) -> Result<&SecurityId> {
        self.spot.get(underlying).ok_or_else(|| {
            ScalperError::InvalidInstrument(format!("no index row for {underlying}"))
        })
    }

    /// Contract lot size for the underlying.
    pub fn lot_size(&self, underlying: &str) -> Result<u32> {
        self.lot_sizes.get(underlying).copied().ok_or_else(|| {
            ScalperError::InvalidInstrument(format!("no lot size known for {underlying}"))
        })
    }

    /// Distance between adjacent strikes on the grid.
    pub fn strike_step(&self, underlying: &str) -> Result<i64> {
        self.strike_steps.get(underlying).copied().ok_or_else(|| {
            ScalperError::InvalidInstrument(format!("no strike grid known for {underlying}"))
        })
    }
}

/// Smallest positive gap between adjacent strikes. Falls back to 50 (the
/// NIFTY grid) for a degenerate single-strike master.
fn derive_strike_step(strikes: &BTreeSet<i64>) -> i64 {
    let mut step = i64::MAX;
    let mut prev: Option<i64> = None;
    for &strike in strikes {
        if let Some(p) = prev {
            let gap = strike - p;
            if gap > 0 && gap < step {
                step = gap;
            }
        }
        prev = Some(strike);
    }
    if step == i64::MAX {
        50
    } else {
        step
    }
}
