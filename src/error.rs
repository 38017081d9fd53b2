// =============================================================================
// Error taxonomy for the scalping engine
// =============================================================================
//
// Order-placement failures are surfaced as values of this enum — they never
// escape into the scheduler as panics. Redis failures during a wallet or
// position mutation abort that mutation and roll back the in-memory state.
// =============================================================================

use thiserror::Error;

/// All failure modes the core distinguishes between.
#[derive(Debug, Error)]
pub enum ScalperError {
    /// The wallet cannot cover principal + fee for a buy.
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: String, available: String },

    /// The broker refused the order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// The broker API could not be reached.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// No tick has arrived for the instrument within the heartbeat window.
    #[error("market data stale for {security_id} ({age_secs}s old)")]
    MarketDataStale { security_id: String, age_secs: u64 },

    /// The tick feed is down and the heartbeat gap has been exceeded.
    #[error("feed disconnected")]
    FeedDisconnected,

    /// The instrument master has no row matching the request.
    #[error("invalid instrument: {0}")]
    InvalidInstrument(String),

    /// A Redis command failed.
    #[error("redis unavailable: {0}")]
    RedisUnavailable(String),

    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The market is closed. Non-fatal: the trading-decision task treats
    /// this as "return without acting".
    #[error("market closed")]
    MarketClosed,

    /// An identical action for the same security was issued within the
    /// idempotency window; the repeat is dropped.
    #[error("duplicate action within idempotency window: {0}")]
    Duplicate(String),
}

impl From<redis::RedisError> for ScalperError {
    fn from(e: redis::RedisError) -> Self {
        Self::RedisUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScalperError>;
