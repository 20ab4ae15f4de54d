use crate::contract::ContractKey;
use crate::order::OrderId;
use crate::tactic::TacticError;

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
/// Every failure kind the engine distinguishes. The supervisor converts these into trade
/// messages or cycle-retry counters; nothing in the engine panics on a fallible operation.
pub enum Error {
    #[error("tactic unreadable: {0}")]
    /// The tactic column could not be parsed. Demotes the trade.
    Parse(#[from] TacticError),
    #[error("contract {key} unresolved after {attempts} attempts")]
    /// Leg ids were not obtained from the broker within the retry budget. Demotes the trade.
    Resolution {
        /// The unresolvable shape.
        key: ContractKey,
        /// How many contract-details requests were issued.
        attempts: u32,
    },
    #[error("no valid bid/ask for {0} within the freshness window")]
    /// Pricing data is missing or stale. Retried next cycle.
    Pricing(ContractKey),
    #[error("order placement refused: {0}")]
    /// The broker rejected the order, or a pre-placement check failed.
    Placement(String),
    #[error("order {0} was not filled within the window")]
    /// A placed order timed out. The order is failed and a message raised.
    FillTimeout(OrderId),
    #[error("position mismatch on {key}: {detail}")]
    /// The broker-side portfolio disagrees with the store. Demotes the trade.
    PositionMismatch {
        /// The affected shape.
        key: ContractKey,
        /// What disagreed.
        detail: String,
    },
    #[error("sheet write failed: {0}")]
    /// A transient sheet fault. Logged and retried next cycle; never blocks state transitions.
    SheetWrite(String),
    #[error("bookkeeping fault: {0}")]
    /// Duplicate executions, stale positions, and other internal consistency faults.
    Bookkeeping(String),
    #[error("configuration fault: {0}")]
    /// The config file is missing or malformed.
    Config(String),
    #[error("broker transport fault: {0}")]
    /// The gateway connection failed or a request could not be sent.
    Broker(String),
}

impl Error {
    #[must_use]
    /// Whether the next cycle should simply retry. Transient sheet, broker, and pricing faults
    /// retry; parse/resolution/position faults demote the trade instead.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Pricing(_) | Self::SheetWrite(_) | Self::Broker(_) | Self::Bookkeeping(_)
        )
    }
}
