use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use perp_bot::config;
use perp_bot::core::anomaly_scanner::{AnomalyScanner, AnomalyThresholds};
use perp_bot::core::constraints::TradingConstraints;
use perp_bot::core::cycle::{CandidateQueue, CycleConfig, DecisionCycle};
use perp_bot::core::extended_data::ExtendedDataFetcher;
use perp_bot::core::intelligence_agent::IntelligenceAgent;
use perp_bot::core::market_data::{ExchangeRest, MarketDataFetcher};
use perp_bot::core::mock_trader::MockTrader;
use perp_bot::core::position_agent::PositionAgent;
use perp_bot::core::prediction_agent::PredictionAgent;
use perp_bot::core::prediction_store::PredictionStore;
use perp_bot::core::rate_limiter::RateLimiter;
use perp_bot::core::regime_agent::RegimeAgent;
use perp_bot::core::risk_agent::RiskAgent;
use perp_bot::core::signal_agent::SignalAgent;
use perp_bot::core::ticker_tracker::{DarkHorseEvent, TickerTracker};
use perp_bot::core::trade_memory::TradeMemory;
use perp_bot::core::trader::TraderPort;
use perp_bot::llm_client::LlmClient;
use perp_bot::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    // Determine config directory — default to `./config`.
    let config_dir = std::env::var("BOT_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let config = config::load_config(&config_dir)?;

    // Initialize tracing — hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&config.app.logging)?;

    log_startup_banner(&config);

    // -----------------------------------------------------------------------
    // Component construction (dependency injection order)
    // -----------------------------------------------------------------------

    // 1. Shared rate limiter and REST client.
    let limiter = Arc::new(RateLimiter::new(
        config.exchange.rate_limit.burst,
        config.exchange.rate_limit.requests_per_second,
    ));
    let rest = Arc::new(ExchangeRest::new(&config.exchange, limiter.clone())?);

    // 2. Data fetchers.
    let fetcher = Arc::new(MarketDataFetcher::new(rest.clone()));
    let extended = Arc::new(ExtendedDataFetcher::new(
        rest.clone(),
        config.exchange.sentiment_url.clone(),
        limiter.clone(),
    )?);

    // 3. LLM client and the staged agents.
    let llm = Arc::new(LlmClient::new(&config.llm)?);
    let regime_agent = Arc::new(RegimeAgent::new(llm.clone()));
    let intelligence_agent = Arc::new(IntelligenceAgent::new(llm.clone()));
    let signal_agent = Arc::new(SignalAgent::new(llm.clone()));
    let prediction_agent = Arc::new(PredictionAgent::new(llm.clone()));
    let risk_agent = Arc::new(RiskAgent::new(
        llm.clone(),
        config.trading.btc_eth_leverage,
        config.trading.altcoin_leverage,
    ));
    let position_agent = Arc::new(PositionAgent::new(llm.clone()));

    // 4. Constraint enforcer.
    let constraints = Arc::new(TradingConstraints::new(config.trading.constraints.clone()));

    // 5. Trader port — the simulator books PnL against real prices.
    let trader: Arc<dyn TraderPort> = Arc::new(MockTrader::new(
        config.trading.initial_balance,
        rest.clone(),
    ));

    // 6. Persistence consumed by the core.
    let data_dir = PathBuf::from(&config.app.data_dir);
    let store = Arc::new(PredictionStore::new(data_dir.join("predictions"))?);
    let memory = Arc::new(TradeMemory::new(&data_dir)?);

    // -----------------------------------------------------------------------
    // Runtime actors
    // -----------------------------------------------------------------------

    let shutdown = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel::<DarkHorseEvent>(64);

    let tracker = Arc::new(TickerTracker::new(
        config.exchange.ws_url.clone(),
        config.trading.top_n,
        config.trading.rank_interval_seconds,
        config.trading.exclude_symbols.clone(),
        event_tx,
        shutdown.clone(),
    ));

    let scanner = Arc::new(AnomalyScanner::new(rest.clone(), AnomalyThresholds::default()));
    let candidates = Arc::new(CandidateQueue::new());

    let cycle = DecisionCycle::new(
        fetcher,
        extended,
        regime_agent,
        intelligence_agent,
        signal_agent,
        prediction_agent,
        risk_agent,
        position_agent,
        constraints,
        trader,
        store,
        memory,
        tracker.clone(),
        candidates.clone(),
        CycleConfig {
            interval_seconds: config.trading.cycle_interval_seconds,
            max_candidates: config.trading.max_candidates_per_cycle,
            fanout_limit: config.trading.fanout_limit,
        },
        shutdown.clone(),
    );

    info!("all components initialized, spawning runtime tasks");

    // WebSocket consumer + periodic re-ranker.
    let tracker_handle = {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.run().await })
    };

    // Dark-horse events feed the next cycle's candidate set.
    let forwarder_handle = {
        let candidates = candidates.clone();
        let forward_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_shutdown.cancelled() => break,
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => {
                                info!(
                                    symbol = %event.symbol,
                                    rank_jump = event.rank_jump,
                                    confidence = event.confidence,
                                    "dark horse queued as candidate"
                                );
                                candidates.push(&event.symbol);
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    };

    // Periodic anomaly scan over the current volume board.
    let scanner_handle = {
        let scanner = scanner.clone();
        let tracker = tracker.clone();
        let candidates = candidates.clone();
        let scan_shutdown = shutdown.clone();
        let scan_interval = Duration::from_secs(config.trading.scan_interval_seconds.max(60));
        let top_n = config.trading.top_n;
        let exclude = config.trading.exclude_symbols.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            interval.tick().await; // skip the immediate tick; let data arrive
            loop {
                tokio::select! {
                    _ = scan_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        // Prefer the streaming board; fall back to a
                        // volume-sorted snapshot while it warms up.
                        let mut board = tracker.top_symbols().await;
                        if board.is_empty() {
                            board = match scanner.top_by_volume(top_n, &exclude).await {
                                Ok(snapshot) => snapshot,
                                Err(e) => {
                                    warn!(error = %e, "volume snapshot unavailable");
                                    continue;
                                }
                            };
                        }
                        for signal in scanner.scan(&board).await {
                            info!(
                                symbol = %signal.symbol,
                                tier = ?signal.tier,
                                confidence = signal.confidence,
                                triggered = ?signal.triggered,
                                "anomaly queued as candidate"
                            );
                            candidates.push(&signal.symbol);
                        }
                    }
                }
            }
        })
    };

    // The decision cycle itself.
    let cycle_handle = tokio::spawn(async move { cycle.run().await });

    info!("all tasks running — press Ctrl+C to shut down");

    // -----------------------------------------------------------------------
    // Wait for shutdown signal
    // -----------------------------------------------------------------------

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown signal received, stopping gracefully...");
    shutdown.cancel();

    let (tracker_res, forwarder_res, scanner_res, cycle_res) =
        tokio::join!(tracker_handle, forwarder_handle, scanner_handle, cycle_handle);
    for (name, result) in [
        ("ticker tracker", tracker_res),
        ("event forwarder", forwarder_res),
        ("anomaly scanner", scanner_res),
        ("decision cycle", cycle_res),
    ] {
        if let Err(e) = result {
            error!(task = name, error = %e, "task panicked");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn log_startup_banner(config: &config::BotConfig) {
    let version = env!("CARGO_PKG_VERSION");
    let mode = if config.trading.simulated {
        "SIMULATED"
    } else {
        "LIVE"
    };

    info!("═══════════════════════════════════════════════════════════════");
    info!("  perp-bot {version} — perpetual futures decision engine [{mode}]");
    info!("═══════════════════════════════════════════════════════════════");
    info!(
        rest = %config.exchange.rest_base_url,
        ws = %config.exchange.ws_url,
        "exchange endpoints"
    );
    info!(
        model = %config.llm.model,
        temperature = config.llm.temperature,
        max_retries = config.llm.max_retries,
        "llm endpoint"
    );
    info!(
        initial_balance = config.trading.initial_balance,
        btc_eth_leverage = config.trading.btc_eth_leverage,
        altcoin_leverage = config.trading.altcoin_leverage,
        cycle_interval_s = config.trading.cycle_interval_seconds,
        top_n = config.trading.top_n,
        max_candidates = config.trading.max_candidates_per_cycle,
        "trading parameters"
    );
    info!(
        cooldown_m = config.trading.constraints.cooldown_minutes,
        hourly_cap = config.trading.constraints.max_hourly_trades,
        daily_cap = config.trading.constraints.max_daily_trades,
        min_hold_m = config.trading.constraints.min_holding_minutes,
        max_positions = config.trading.constraints.max_positions,
        "constraints"
    );
    if config.trading.scan_interval_seconds < 60 {
        warn!("scan interval below 60s is clamped to 60s");
    }
    info!("───────────────────────────────────────────────────────────────");
}
