//! Process-level settings
//!
//! Layered: built-in defaults, then an optional `perpbot` config file in the
//! working directory, then `PERPBOT_*` environment variables. Per-bot
//! trading config lives in [`crate::config`]; this is only what the process
//! itself needs to come up.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::config::BotConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL of the market data service.
    pub market_base_url: String,
    /// Advisory decision endpoint; required only for bots in advisory mode.
    #[serde(default)]
    pub advisor_url: Option<String>,
    /// Cap on concurrent outbound market data requests across all bots.
    pub max_concurrent_requests: usize,
    pub reconcile_interval_secs: u64,
    /// Bots seeded into the store at startup.
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("market_base_url", "http://localhost:8080")?
            .set_default("max_concurrent_requests", 8)?
            .set_default("reconcile_interval_secs", 5)?
            .add_source(File::with_name("perpbot").required(false))
            .add_source(Environment::with_prefix("PERPBOT"))
            .build()?
            .try_deserialize()
    }
}
