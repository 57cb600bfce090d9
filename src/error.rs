//! Error taxonomy for the trading engine

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::risk::RejectReason;

/// Errors raised by ledger and position mutations.
///
/// Every variant leaves the ledger untouched: a failed open or close is
/// all-or-nothing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("bot not found: {0}")]
    BotNotFound(Uuid),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("position already closed: {0}")]
    AlreadyClosed(Uuid),

    #[error("position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("open position already exists for {0}")]
    PositionExists(String),
}

/// Engine-level error taxonomy.
///
/// The first four kinds are caught and logged inside the per-bot cycle loop
/// and never stop a bot. Only `Fatal` escapes to the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Provider timeout, rate limit, connection failure. Retried next cycle.
    #[error("transient: {0}")]
    Transient(String),

    /// Missing symbol or insufficient history. The symbol is skipped for the
    /// cycle; other symbols proceed.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Risk validation rejected the signal. No position change, no retry.
    #[error("validation rejected: {0}")]
    Rejected(RejectReason),

    /// Ledger/position mutation failed; state guaranteed unchanged.
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Config missing or ledger corruption. The bot is marked stopped and
    /// requires external intervention.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether this error should stop the bot rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_is_fatal() {
        assert!(EngineError::Fatal("config missing".into()).is_fatal());
        assert!(!EngineError::Transient("timeout".into()).is_fatal());
        assert!(!EngineError::DataUnavailable("no candles".into()).is_fatal());
        assert!(!EngineError::Execution(ExecutionError::AlreadyClosed(Uuid::nil())).is_fatal());
    }
}
