use serde::Deserialize;

use crate::core::constraints::ConstraintConfig;

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub app: AppConfig,
    pub exchange: ExchangeConfig,
    pub llm: LlmConfig,
    pub trading: TradingConfig,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// Root for stores, logs and signal records.
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub file_prefix: String,
}

// ---------------------------------------------------------------------------
// exchange.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub rest_base_url: String,
    /// Aggregate all-tickers stream URL.
    pub ws_url: String,
    pub sentiment_url: String,
    pub http_timeout_seconds: u64,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub requests_per_second: f64,
}

// ---------------------------------------------------------------------------
// llm.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable carrying the key.
    pub api_key_env: String,
    pub temperature: f64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    /// Resolved at load time from `api_key_env`; never serialized.
    #[serde(skip)]
    pub api_key: String,
}

// ---------------------------------------------------------------------------
// trading.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Simulated account only; live adapters plug in behind the port.
    pub simulated: bool,
    pub initial_balance: f64,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub cycle_interval_seconds: u64,
    pub scan_interval_seconds: u64,
    pub max_candidates_per_cycle: usize,
    pub fanout_limit: usize,
    pub top_n: usize,
    pub rank_interval_seconds: u64,
    pub exclude_symbols: Vec<String>,
    pub constraints: ConstraintConfig,
}
