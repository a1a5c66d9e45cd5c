pub mod types;

pub use types::*;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Load all config JSON files from `config_dir`, apply environment variable
/// overrides, resolve secrets, and validate.
///
/// Expected layout:
/// ```text
/// config/
///   app.json
///   exchange.json
///   llm.json
///   trading.json
/// ```
///
/// # Environment variable overrides
///
/// | Env var                  | Config field                       |
/// |--------------------------|------------------------------------|
/// | `SIMULATED`              | `trading.simulated`                |
/// | `INITIAL_BALANCE`        | `trading.initial_balance`          |
/// | `CYCLE_INTERVAL_SECONDS` | `trading.cycle_interval_seconds`   |
/// | `LLM_BASE_URL`           | `llm.base_url`                     |
/// | `LLM_MODEL`              | `llm.model`                        |
///
/// The LLM API key is read from the env var named by `llm.api_key_env`.
pub fn load_config(config_dir: &Path) -> Result<BotConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;
    let exchange: ExchangeConfig =
        serde_json::from_str(&read("exchange.json")?).context("parsing exchange.json")?;
    let llm: LlmConfig = serde_json::from_str(&read("llm.json")?).context("parsing llm.json")?;
    let trading: TradingConfig =
        serde_json::from_str(&read("trading.json")?).context("parsing trading.json")?;

    let mut config = BotConfig {
        app,
        exchange,
        llm,
        trading,
    };

    apply_env_overrides(&mut config);
    config.llm.api_key = env_string(&config.llm.api_key_env).unwrap_or_default();

    validate_config(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut BotConfig) {
    if let Some(val) = env_bool("SIMULATED") {
        info!(simulated = val, "env override: SIMULATED");
        config.trading.simulated = val;
    }
    if let Some(val) = env_parse::<f64>("INITIAL_BALANCE") {
        info!(val, "env override: INITIAL_BALANCE");
        config.trading.initial_balance = val;
    }
    if let Some(val) = env_parse::<u64>("CYCLE_INTERVAL_SECONDS") {
        info!(val, "env override: CYCLE_INTERVAL_SECONDS");
        config.trading.cycle_interval_seconds = val;
    }
    if let Some(val) = env_string("LLM_BASE_URL") {
        info!("env override: LLM_BASE_URL");
        config.llm.base_url = val;
    }
    if let Some(val) = env_string("LLM_MODEL") {
        info!("env override: LLM_MODEL");
        config.llm.model = val;
    }
}

fn validate_config(config: &BotConfig) -> Result<()> {
    if config.trading.initial_balance <= 0.0 {
        anyhow::bail!("trading.initial_balance must be positive");
    }
    if config.trading.btc_eth_leverage == 0 || config.trading.altcoin_leverage == 0 {
        anyhow::bail!("leverage settings must be at least 1");
    }
    if config.trading.top_n == 0 {
        anyhow::bail!("trading.top_n must be positive");
    }
    if config.exchange.rest_base_url.is_empty() || config.exchange.ws_url.is_empty() {
        anyhow::bail!("exchange endpoints must be set");
    }
    if config.llm.base_url.is_empty() || config.llm.model.is_empty() {
        anyhow::bail!("llm endpoint and model must be set");
    }
    if config.llm.api_key.is_empty() {
        anyhow::bail!(
            "LLM API key missing — set the {} environment variable",
            config.llm.api_key_env
        );
    }
    if !config.trading.simulated {
        anyhow::bail!("live trading adapters are wired separately; set trading.simulated=true");
    }
    Ok(())
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var as a bool (`true`, `1`, `yes` → true).
fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
