//! External providers - market data, order execution, shared rate limiting

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::ledger::Side;
use crate::market::{Candle, Ticker, Timeframe};

/// Default timeout for one provider call.
const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Paper-fill slippage ceiling, in basis points.
const PAPER_SLIPPAGE_BPS: u32 = 5;
/// Default taker fee rate.
pub const DEFAULT_FEE_RATE: Decimal = Decimal::from_parts(4, 0, 0, false, 4);

/// Market data source. `Ok(None)` is typed unavailability (skip the symbol
/// this cycle); `Err(Transient)` is a retryable provider failure.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError>;
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Option<Vec<Candle>>, EngineError>;
}

/// Fill returned by the order provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub price: Decimal,
    pub fee: Decimal,
}

/// Order execution venue. Paper mode is a pure computation from the supplied
/// market price; live mode sits behind the same trait.
#[async_trait]
pub trait OrderExecutionProvider: Send + Sync {
    async fn open(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        market_price: Decimal,
    ) -> Result<Fill, EngineError>;

    async fn close(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        market_price: Decimal,
    ) -> Result<Fill, EngineError>;
}

/// Fair global limiter over concurrent provider calls.
///
/// A FIFO semaphore shared by every bot task: a bursting bot queues behind
/// the others rather than starving them.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        // Semaphore is closed only on drop, which cannot happen while we
        // hold a clone of the Arc.
        self.permits
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("limiter semaphore closed"))
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: Decimal,
    #[serde(default)]
    change_24h_pct: Option<f64>,
    #[serde(default)]
    volume_24h: Option<Decimal>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// HTTP market data client against a data-retrieval style REST service.
pub struct HttpMarketData {
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpMarketData {
    pub fn new(base_url: &str, timeout_secs: u64, limiter: RateLimiter) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(if timeout_secs == 0 {
                DEFAULT_TIMEOUT_SECS
            } else {
                timeout_secs
            }))
            .build()
            .map_err(|e| EngineError::Fatal(format!("failed to build http client: {e}")))?;

        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client, limiter })
    }

    fn map_error(context: &str, error: reqwest::Error) -> EngineError {
        if error.is_timeout() {
            EngineError::Transient(format!("{context} timed out"))
        } else if error.is_connect() {
            EngineError::Transient(format!("{context} connection failed: {error}"))
        } else {
            EngineError::Transient(format!("{context} failed: {error}"))
        }
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError> {
        let _permit = self.limiter.acquire().await;
        let url = format!("{}/ticker/{symbol}", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_error("ticker fetch", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(symbol, "ticker unavailable");
            return Ok(None);
        }
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::Transient("ticker fetch rate limited".into()));
        }
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "ticker fetch returned {}",
                response.status()
            )));
        }

        let body: TickerResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("ticker parse failed: {e}")))?;
        Ok(Some(Ticker {
            symbol: body.symbol,
            price: body.price,
            change_24h_pct: body.change_24h_pct,
            volume_24h: body.volume_24h,
            timestamp: body.timestamp,
        }))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Option<Vec<Candle>>, EngineError> {
        let _permit = self.limiter.acquire().await;
        let url = format!(
            "{}/ohlcv/{symbol}?timeframe={}&limit={limit}",
            self.base_url,
            timeframe.as_str()
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_error("ohlcv fetch", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(symbol, %timeframe, "ohlcv unavailable");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "ohlcv fetch returned {}",
                response.status()
            )));
        }

        let body: Vec<CandleResponse> = response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("ohlcv parse failed: {e}")))?;
        if body.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            body.into_iter()
                .map(|c| Candle {
                    timestamp: c.timestamp,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
                .collect(),
        ))
    }
}

/// Paper execution: fills at the supplied market price with bounded adverse
/// slippage and a fixed fee rate. No network involved.
pub struct PaperExecution {
    fee_rate: Decimal,
    slippage_bps: u32,
}

impl PaperExecution {
    pub fn new() -> Self {
        Self { fee_rate: DEFAULT_FEE_RATE, slippage_bps: PAPER_SLIPPAGE_BPS }
    }

    /// Deterministic variant for tests: no slippage, configurable fee.
    pub fn with_rates(fee_rate: Decimal, slippage_bps: u32) -> Self {
        Self { fee_rate, slippage_bps }
    }

    fn fill(&self, side: Side, quantity: Decimal, market_price: Decimal, opening: bool) -> Fill {
        let bps = if self.slippage_bps == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(rand::thread_rng().gen_range(0..=self.slippage_bps))
        };
        let slip = market_price * bps / Decimal::from(10_000);
        // Slippage is always adverse: paying up on the aggressive side
        let taker_side = if opening { side } else { side.opposite() };
        let price = match taker_side {
            Side::Long => market_price + slip,
            Side::Short => market_price - slip,
        };
        let fee = price * quantity * self.fee_rate;
        Fill { price, fee }
    }
}

impl Default for PaperExecution {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderExecutionProvider for PaperExecution {
    async fn open(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        market_price: Decimal,
    ) -> Result<Fill, EngineError> {
        if market_price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            warn!(symbol, %market_price, %quantity, "rejecting paper open with non-positive inputs");
            return Err(EngineError::Transient("non-positive price or quantity".into()));
        }
        Ok(self.fill(side, quantity, market_price, true))
    }

    async fn close(
        &self,
        _symbol: &str,
        side: Side,
        quantity: Decimal,
        market_price: Decimal,
    ) -> Result<Fill, EngineError> {
        Ok(self.fill(side, quantity, market_price, false))
    }
}
