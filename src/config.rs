// =============================================================================
// Engine configuration — YAML file + environment overrides
// =============================================================================
//
// Every tunable lives here. All fields carry serde defaults so an older or
// partial YAML file still deserialises. Environment variables override the
// file for deployment-specific values (credentials, Redis URL, market-hours
// enforcement).
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ScalperError;
use crate::types::Segment;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<SymbolConfig> {
    vec![SymbolConfig {
        name: "NIFTY".to_string(),
        segment: Segment::NseFno,
        enabled: true,
    }]
}

fn default_starting_balance() -> f64 {
    200_000.0
}

fn default_allocation_pct() -> f64 {
    0.30
}

fn default_max_lots() -> u32 {
    10
}

fn default_charge_per_order() -> f64 {
    20.0
}

fn default_adx_threshold() -> f64 {
    25.0
}

fn default_supertrend_period() -> usize {
    10
}

fn default_supertrend_multiplier() -> f64 {
    3.0
}

fn default_adx_period() -> usize {
    14
}

fn default_initial_sl_pct() -> f64 {
    0.02
}

fn default_trail_pct() -> f64 {
    0.05
}

fn default_breakeven_threshold_pct() -> f64 {
    0.15
}

fn default_rupee_step() -> f64 {
    3.0
}

fn default_emergency_floor_rupees() -> f64 {
    2_000.0
}

fn default_day_loss_limit() -> f64 {
    5_000.0
}

fn default_session_target() -> f64 {
    10_000.0
}

fn default_decision_interval_secs() -> u64 {
    60
}

fn default_risk_interval_secs() -> u64 {
    1
}

fn default_status_interval_secs() -> u64 {
    60
}

fn default_md_refresh_interval_secs() -> u64 {
    5
}

fn default_md_stagger_secs() -> u64 {
    10
}

fn default_heartbeat_window_secs() -> u64 {
    120
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_instruments_csv() -> String {
    "instruments.csv".to_string()
}

fn default_max_open_positions() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Sections
// =============================================================================

/// One tradeable underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    /// Underlying symbol as it appears in the instrument master
    /// (NIFTY, BANKNIFTY, SENSEX).
    pub name: String,
    /// Derivative segment the options trade on.
    pub segment: Segment,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Risk-manager thresholds (fractions, not percent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Hard stop while breakeven is not yet armed.
    #[serde(default = "default_initial_sl_pct")]
    pub initial_sl_pct: f64,

    /// Trailing distance below peak.
    #[serde(default = "default_trail_pct")]
    pub trail_pct: f64,

    /// Peak gain that arms the breakeven lock.
    #[serde(default = "default_breakeven_threshold_pct")]
    pub breakeven_threshold_pct: f64,

    /// Minimum rupee improvement a trailing-trigger adjustment must deliver;
    /// clamps adjustment churn.
    #[serde(default = "default_rupee_step")]
    pub rupee_step: f64,

    /// Absolute rupee loss that triggers an unconditional exit.
    #[serde(default = "default_emergency_floor_rupees")]
    pub emergency_floor_rupees: f64,

    /// Session loss that forces flat-all and shutdown.
    #[serde(default = "default_day_loss_limit")]
    pub day_loss_limit: f64,

    /// Session profit that triggers a clean shutdown once flat.
    #[serde(default = "default_session_target")]
    pub session_target: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            initial_sl_pct: default_initial_sl_pct(),
            trail_pct: default_trail_pct(),
            breakeven_threshold_pct: default_breakeven_threshold_pct(),
            rupee_step: default_rupee_step(),
            emergency_floor_rupees: default_emergency_floor_rupees(),
            day_loss_limit: default_day_loss_limit(),
            session_target: default_session_target(),
        }
    }
}

/// Scheduler cadence for the recurring tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervals {
    #[serde(default = "default_decision_interval_secs")]
    pub decision_secs: u64,

    #[serde(default = "default_risk_interval_secs")]
    pub risk_secs: u64,

    #[serde(default = "default_status_interval_secs")]
    pub status_secs: u64,

    /// Per-symbol market-data refresh.
    #[serde(default = "default_md_refresh_interval_secs")]
    pub md_refresh_secs: u64,

    /// Phase offset between consecutive symbols' refresh tasks.
    #[serde(default = "default_md_stagger_secs")]
    pub md_stagger_secs: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            decision_secs: default_decision_interval_secs(),
            risk_secs: default_risk_interval_secs(),
            status_secs: default_status_interval_secs(),
            md_refresh_secs: default_md_refresh_interval_secs(),
            md_stagger_secs: default_md_stagger_secs(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolConfig>,

    /// Paper-wallet starting balance in rupees.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    /// Fraction of available balance allocated to one entry.
    #[serde(default = "default_allocation_pct")]
    pub allocation_pct: f64,

    #[serde(default = "default_max_lots")]
    pub max_lots: u32,

    /// Flat brokerage charged per order.
    #[serde(default = "default_charge_per_order")]
    pub charge_per_order: f64,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    // --- Signal parameters ---------------------------------------------------
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,

    #[serde(default = "default_adx_period")]
    pub adx_period: usize,

    #[serde(default = "default_supertrend_period")]
    pub supertrend_period: usize,

    #[serde(default = "default_supertrend_multiplier")]
    pub supertrend_multiplier: f64,

    // --- Risk ----------------------------------------------------------------
    #[serde(default)]
    pub risk: RiskParams,

    // --- Scheduling ----------------------------------------------------------
    #[serde(default)]
    pub intervals: Intervals,

    /// No tick within this window marks market data stale.
    #[serde(default = "default_heartbeat_window_secs")]
    pub heartbeat_window_secs: u64,

    // --- External services ---------------------------------------------------
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Path to the broker instrument master CSV.
    #[serde(default = "default_instruments_csv")]
    pub instruments_csv: String,

    /// Refuse entries outside 09:15–15:30 IST when set.
    #[serde(default = "default_true")]
    pub enforce_market_hours: bool,

    // --- Live credentials (env-only; never serialised back out) --------------
    #[serde(skip_serializing, default)]
    pub client_id: String,

    #[serde(skip_serializing, default)]
    pub access_token: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            starting_balance: default_starting_balance(),
            allocation_pct: default_allocation_pct(),
            max_lots: default_max_lots(),
            charge_per_order: default_charge_per_order(),
            max_open_positions: default_max_open_positions(),
            adx_threshold: default_adx_threshold(),
            adx_period: default_adx_period(),
            supertrend_period: default_supertrend_period(),
            supertrend_multiplier: default_supertrend_multiplier(),
            risk: RiskParams::default(),
            intervals: Intervals::default(),
            heartbeat_window_secs: default_heartbeat_window_secs(),
            redis_url: default_redis_url(),
            instruments_csv: default_instruments_csv(),
            enforce_market_hours: true,
            client_id: String::new(),
            access_token: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// A missing file is not an error — defaults apply, with a warning — but
    /// a file that exists and fails to parse is.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScalperError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ScalperError::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
            })?;
            let parsed: Self = serde_yaml::from_str(&content).map_err(|e| {
                ScalperError::ConfigInvalid(format!("failed to parse {}: {e}", path.display()))
            })?;
            info!(path = %path.display(), "config loaded");
            parsed
        } else {
            warn!(path = %path.display(), "config file not found — using defaults");
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides: `CLIENT_ID`, `ACCESS_TOKEN`, `REDIS_URL`,
    /// `ENFORCE_MARKET_HOURS`. (`LOG_LEVEL` is consumed by the tracing
    /// subscriber, not here.)
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CLIENT_ID") {
            self.client_id = v;
        }
        if let Ok(v) = std::env::var("ACCESS_TOKEN") {
            self.access_token = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("ENFORCE_MARKET_HOURS") {
            self.enforce_market_hours = !matches!(v.as_str(), "0" | "false" | "no");
        }
    }

    fn validate(&self) -> Result<(), ScalperError> {
        if self.symbols.iter().filter(|s| s.enabled).count() == 0 {
            return Err(ScalperError::ConfigInvalid(
                "no enabled symbols configured".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.allocation_pct) {
            return Err(ScalperError::ConfigInvalid(format!(
                "allocation_pct must be within 0..=1, got {}",
                self.allocation_pct
            )));
        }
        if self.starting_balance <= 0.0 {
            return Err(ScalperError::ConfigInvalid(
                "starting_balance must be positive".into(),
            ));
        }
        if self.risk.trail_pct <= 0.0 || self.risk.trail_pct >= 1.0 {
            return Err(ScalperError::ConfigInvalid(format!(
                "trail_pct must be within (0, 1), got {}",
                self.risk.trail_pct
            )));
        }
        Ok(())
    }

    /// Enabled symbols only.
    pub fn active_symbols(&self) -> impl Iterator<Item = &SymbolConfig> {
        self.symbols.iter().filter(|s| s.enabled)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.symbols.len(), 1);
        assert_eq!(cfg.symbols[0].name, "NIFTY");
        assert!((cfg.risk.initial_sl_pct - 0.02).abs() < f64::EPSILON);
        assert!((cfg.risk.trail_pct - 0.05).abs() < f64::EPSILON);
        assert!((cfg.risk.breakeven_threshold_pct - 0.15).abs() < f64::EPSILON);
        assert!((cfg.risk.rupee_step - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.intervals.decision_secs, 60);
        assert_eq!(cfg.intervals.risk_secs, 1);
        assert_eq!(cfg.heartbeat_window_secs, 120);
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert!((cfg.adx_threshold - 25.0).abs() < f64::EPSILON);
        assert_eq!(cfg.supertrend_period, 10);
        assert!((cfg.supertrend_multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
symbols:
  - name: BANKNIFTY
    segment: NseFno
  - name: SENSEX
    segment: BseFno
    enabled: false
allocation_pct: 0.5
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.symbols.len(), 2);
        assert_eq!(cfg.active_symbols().count(), 1);
        assert!((cfg.allocation_pct - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.max_lots, 10);
    }

    #[test]
    fn rejects_bad_allocation() {
        let mut cfg = AppConfig::default();
        cfg.allocation_pct = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_all_symbols_disabled() {
        let mut cfg = AppConfig::default();
        cfg.symbols[0].enabled = false;
        assert!(cfg.validate().is_err());
    }
}
