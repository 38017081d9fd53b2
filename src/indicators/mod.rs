// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators behind the signal
// gate. Every public function returns `Option<T>` so callers are forced to
// handle insufficient-data and numerical-edge-case scenarios.

pub mod adx;
pub mod atr;
pub mod supertrend;

pub use adx::{calculate_adx, AdxOutput};
pub use atr::calculate_atr;
pub use supertrend::{calculate_supertrend, SupertrendOutput};
