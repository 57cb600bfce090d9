//! Perpbot Library
//!
//! Multi-bot trading core for leveraged perpetual swaps: indicator
//! computation, confluence signals, risk validation, paper execution, and
//! per-bot orchestration under a supervising scheduler.

pub mod config;
pub mod confluence;
pub mod decision;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod ledger;
pub mod market;
pub mod orchestrator;
pub mod provider;
pub mod risk;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use config::{BotConfig, BotStatus, DecisionMode, RiskLimits, TradingMode};
pub use confluence::{ConfidenceAdjuster, ConfluenceWeights, SignalGenerator};
pub use decision::{AdvisoryExternal, DecisionProvider, DeterministicConfluence, PortfolioContext};
pub use error::{EngineError, ExecutionError};
pub use execution::ExecutionEngine;
pub use indicators::{IndicatorEngine, IndicatorSet, SignalFlags};
pub use ledger::{CapitalLedger, EquitySnapshot, Position, Side, Trade};
pub use market::{Candle, MarketSnapshot, Ticker, Timeframe};
pub use orchestrator::{CycleOrchestrator, CyclePhase};
pub use provider::{
    HttpMarketData, MarketDataProvider, OrderExecutionProvider, PaperExecution, RateLimiter,
};
pub use risk::{ApprovedOrder, RejectReason, RiskValidator};
pub use scheduler::BotScheduler;
pub use settings::Settings;
pub use signal::{ConfidenceTier, Signal, SignalKind};
pub use store::{BotHealth, MemoryStore, PersistenceStore};
