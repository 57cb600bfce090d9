//! Decision providers
//!
//! One trait, two implementations: the deterministic confluence engine and
//! an external HTTP advisor. The variant is chosen once at bot start from
//! `DecisionMode`; the orchestrator only ever sees the trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{BotConfig, DecisionMode};
use crate::confluence::SignalGenerator;
use crate::error::EngineError;
use crate::ledger::Side;
use crate::market::MarketSnapshot;
use crate::signal::{Signal, SignalKind};

/// Default timeout for advisory decision requests.
const DEFAULT_ADVISOR_TIMEOUT_SECS: u64 = 30;

/// What the decision layer knows about the bot's book when deciding.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioContext {
    pub bot_id: Uuid,
    pub cash: Decimal,
    pub equity: Decimal,
    pub open_positions: Vec<OpenPositionBrief>,
}

/// Compact open-position view shared with decision providers.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionBrief {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub unrealized_pnl: Decimal,
}

impl PortfolioContext {
    /// Side of the open position for `symbol`, if any.
    pub fn open_side(&self, symbol: &str) -> Option<Side> {
        self.open_positions.iter().find(|p| p.symbol == symbol).map(|p| p.side)
    }
}

/// Produces one signal per symbol for a cycle. Symbols absent from the
/// result are treated as Hold by the orchestrator.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(
        &self,
        snapshots: &[MarketSnapshot],
        context: &PortfolioContext,
        config: &BotConfig,
    ) -> Result<HashMap<String, Signal>, EngineError>;
}

/// Deterministic provider: runs the confluence generator per snapshot.
pub struct DeterministicConfluence {
    generator: SignalGenerator,
}

impl DeterministicConfluence {
    pub fn new(generator: SignalGenerator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl DecisionProvider for DeterministicConfluence {
    async fn decide(
        &self,
        snapshots: &[MarketSnapshot],
        context: &PortfolioContext,
        config: &BotConfig,
    ) -> Result<HashMap<String, Signal>, EngineError> {
        let mut decisions = HashMap::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let open_side = context.open_side(&snapshot.symbol);
            let signal = self.generator.generate(snapshot, open_side, config);
            decisions.insert(snapshot.symbol.clone(), signal);
        }
        Ok(decisions)
    }
}

/// Request body sent to the external advisor.
#[derive(Debug, Serialize)]
struct AdvisoryRequest<'a> {
    context: &'a PortfolioContext,
    markets: Vec<MarketView>,
}

/// Serializable per-symbol market view for the advisory payload.
#[derive(Debug, Serialize)]
struct MarketView {
    symbol: String,
    price: Decimal,
    indicators: std::collections::BTreeMap<&'static str, f64>,
}

impl MarketView {
    fn from_snapshot(snapshot: &MarketSnapshot) -> Self {
        Self {
            symbol: snapshot.symbol.clone(),
            price: snapshot.price,
            indicators: snapshot
                .indicators
                .as_ref()
                .map(|i| i.to_map())
                .unwrap_or_default(),
        }
    }
}

/// Raw advisor response, parsed strictly before anything acts on it.
#[derive(Debug, Deserialize)]
struct AdvisoryResponse {
    decisions: Vec<AdvisoryDecision>,
}

#[derive(Debug, Deserialize)]
struct AdvisoryDecision {
    symbol: String,
    kind: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    entry_price: Option<Decimal>,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
    #[serde(default)]
    size_fraction: Option<Decimal>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// External advisor over HTTP.
///
/// The response crosses a strict parse boundary: any decision with an
/// unknown kind, a confidence outside [0, 1], or non-positive prices folds
/// to Hold for that symbol instead of reaching the validator. Transport
/// failures and timeouts surface as `Transient` so the cycle retries.
pub struct AdvisoryExternal {
    advisor_url: String,
    client: Client,
    timeout: Duration,
}

impl AdvisoryExternal {
    pub fn new(advisor_url: String, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| EngineError::Fatal(format!("http client init failed: {e}")))?;
        Ok(Self { advisor_url, client, timeout })
    }

    async fn request(
        &self,
        snapshots: &[MarketSnapshot],
        context: &PortfolioContext,
    ) -> Result<AdvisoryResponse, EngineError> {
        let url = format!("{}/v1/decide", self.advisor_url);
        let body = AdvisoryRequest {
            context,
            markets: snapshots.iter().map(MarketView::from_snapshot).collect(),
        };

        let response =
            self.client.post(&url).json(&body).send().await.map_err(|e| {
                if e.is_timeout() {
                    EngineError::Transient(format!(
                        "advisor timed out after {:?}",
                        self.timeout
                    ))
                } else if e.is_connect() {
                    EngineError::Transient(format!("advisor unreachable at {url}: {e}"))
                } else {
                    EngineError::Transient(format!("advisor request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Transient(format!(
                "advisor returned {status}: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("advisor response unreadable: {e}")))
    }

    /// Fold one raw decision into a signal; anything suspect becomes Hold.
    fn parse_decision(decision: AdvisoryDecision, config: &BotConfig) -> Signal {
        let symbol = decision.symbol.clone();
        let reason = decision.reasoning.clone().unwrap_or_else(|| "advisor".to_string());

        let kind = match decision.kind.as_str() {
            "enter_long" => SignalKind::EnterLong,
            "enter_short" => SignalKind::EnterShort,
            "close" => return Signal::close(&symbol, &reason),
            "hold" => return Signal::hold(&symbol, &reason),
            other => {
                warn!(%symbol, kind = other, "advisor sent unknown decision kind, holding");
                return Signal::hold(&symbol, "advisor decision rejected: unknown kind");
            }
        };
        let side = match kind {
            SignalKind::EnterLong => Side::Long,
            _ => Side::Short,
        };

        let confidence = match decision.confidence {
            Some(c) if (0.0..=1.0).contains(&c) => c,
            _ => {
                warn!(%symbol, "advisor confidence missing or out of range, holding");
                return Signal::hold(&symbol, "advisor decision rejected: bad confidence");
            }
        };

        let (entry, stop, target) = match (
            decision.entry_price,
            decision.stop_loss,
            decision.take_profit,
        ) {
            (Some(e), Some(s), Some(t))
                if e > Decimal::ZERO && s > Decimal::ZERO && t > Decimal::ZERO =>
            {
                (e, s, t)
            }
            _ => {
                warn!(%symbol, "advisor prices missing or non-positive, holding");
                return Signal::hold(&symbol, "advisor decision rejected: bad prices");
            }
        };

        let size_fraction = match decision.size_fraction {
            Some(f) if f > Decimal::ZERO => f,
            _ => {
                warn!(%symbol, "advisor size fraction missing or non-positive, holding");
                return Signal::hold(&symbol, "advisor decision rejected: bad size");
            }
        };

        Signal::entry(&symbol, side, confidence, &reason)
            .with_prices(entry, stop, target)
            .with_size(size_fraction, config.leverage)
    }
}

#[async_trait]
impl DecisionProvider for AdvisoryExternal {
    async fn decide(
        &self,
        snapshots: &[MarketSnapshot],
        context: &PortfolioContext,
        config: &BotConfig,
    ) -> Result<HashMap<String, Signal>, EngineError> {
        let response = self.request(snapshots, context).await?;
        debug!(decisions = response.decisions.len(), "advisor responded");

        let requested: std::collections::HashSet<&str> =
            snapshots.iter().map(|s| s.symbol.as_str()).collect();

        let mut decisions = HashMap::with_capacity(snapshots.len());
        for raw in response.decisions {
            if !requested.contains(raw.symbol.as_str()) {
                warn!(symbol = %raw.symbol, "advisor decided on a symbol we never asked about");
                continue;
            }
            decisions.insert(raw.symbol.clone(), Self::parse_decision(raw, config));
        }
        // Symbols the advisor skipped hold by default.
        for snapshot in snapshots {
            decisions
                .entry(snapshot.symbol.clone())
                .or_insert_with(|| Signal::hold(&snapshot.symbol, "advisor gave no decision"));
        }
        Ok(decisions)
    }
}

/// Build the provider a bot's config asks for.
pub fn build_provider(
    config: &BotConfig,
    generator: SignalGenerator,
    advisor_url: Option<String>,
) -> Result<Arc<dyn DecisionProvider>, EngineError> {
    match config.decision_mode {
        DecisionMode::Deterministic => Ok(Arc::new(DeterministicConfluence::new(generator))),
        DecisionMode::Advisory => {
            let url = advisor_url.ok_or_else(|| {
                EngineError::Fatal("advisory mode requires an advisor url".into())
            })?;
            Ok(Arc::new(AdvisoryExternal::new(
                url,
                Duration::from_secs(DEFAULT_ADVISOR_TIMEOUT_SECS),
            )?))
        }
    }
}
