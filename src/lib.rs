// =============================================================================
// dhan-scalper — automated index-options scalping engine
// =============================================================================
//
// Core layout, leaves first:
//
//   money        fixed-point rupee arithmetic
//   ticks        concurrent latest-tick cache
//   store        Redis persistence seam (+ in-memory test double)
//   instruments  scrip-master resolver
//   candles      1-minute series + 3-minute aggregation
//   indicators   Supertrend, ADX, ATR
//   signal       Supertrend-flip × ADX entry gate
//   picker       strike selection + quantity sizing
//   wallet       atomic paper wallet
//   positions    striped-lock position tracker
//   broker       paper / live execution behind one trait
//   risk         no-loss trend rider
//   sched        named recurring tasks
//   feed         resilient WebSocket tick ingest
//   reporter     session snapshots
//   engine       top-down wiring + mode runner
// =============================================================================

pub mod broker;
pub mod candles;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod indicators;
pub mod instruments;
pub mod money;
pub mod picker;
pub mod positions;
pub mod reporter;
pub mod risk;
pub mod sched;
pub mod session;
pub mod signal;
pub mod store;
pub mod ticks;
pub mod wallet;

pub mod types;

pub use config::AppConfig;
pub use engine::{Engine, StopReason};
pub use error::{Result, ScalperError};
pub use money::Money;
pub use types::{Mode, OptionType, PositionSide, Segment, Side, SignalKind};
