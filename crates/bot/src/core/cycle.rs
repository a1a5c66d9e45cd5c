//! The decision cycle: one pass of the staged pipeline over the current
//! candidate set and the held positions.
//!
//! Per cycle: BTC context → Regime → MarketIntelligence → per-candidate
//! fan-out (fetch → Signal → Prediction) → Risk for survivors → constraint
//! filter → Position agent per held position → operations on the trader
//! port. Per-symbol failures drop only that symbol; each drop logs the
//! stage, the symbol and the reason category.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::constraints::TradingConstraints;
use crate::core::extended_data::ExtendedDataFetcher;
use crate::core::intelligence_agent::IntelligenceAgent;
use crate::core::market_data::MarketDataFetcher;
use crate::core::position_agent::PositionAgent;
use crate::core::prediction_agent::{PredictionAgent, PredictionContext};
use crate::core::prediction_store::{PredictionRecord, PredictionSnapshot, PredictionStore};
use crate::core::regime_agent::RegimeAgent;
use crate::core::risk_agent::RiskAgent;
use crate::core::signal_agent::SignalAgent;
use crate::core::ticker_tracker::TickerTracker;
use crate::core::trade_memory::TradeMemory;
use crate::core::trader::TraderPort;
use crate::errors::EngineError;
use crate::types::{
    AccountSnapshot, CloseAction, MarketData, Position, PositionSide, Prediction,
    PredictionDirection, RegimeResult, SignalDirection, SignalResult, Strategy,
};

const BTC_SYMBOL: &str = "BTCUSDT";

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub interval_seconds: u64,
    /// Candidates evaluated per cycle.
    pub max_candidates: usize,
    /// Per-cycle fan-out bound.
    pub fanout_limit: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 180,
            max_candidates: 6,
            fanout_limit: 20,
        }
    }
}

/// Deduplicating candidate feed. The tracker's dark-horse forwarder and the
/// anomaly task push; the cycle drains.
pub struct CandidateQueue {
    inner: std::sync::Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    pub fn push(&self, symbol: &str) {
        let mut guard = self.inner.lock().expect("candidate lock poisoned");
        if guard.1.insert(symbol.to_string()) {
            guard.0.push_back(symbol.to_string());
        }
    }

    pub fn drain(&self) -> Vec<String> {
        let mut guard = self.inner.lock().expect("candidate lock poisoned");
        guard.1.clear();
        guard.0.drain(..).collect()
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A candidate that survived signal and prediction.
struct CandidateDecision {
    symbol: String,
    market: MarketData,
    signal: SignalResult,
    prediction: Prediction,
}

/// Signal and prediction must point the same way before money moves.
fn directions_agree(signal: SignalDirection, prediction: PredictionDirection) -> bool {
    matches!(
        (signal, prediction),
        (SignalDirection::Long, PredictionDirection::Up)
            | (SignalDirection::Short, PredictionDirection::Down)
    )
}

pub struct DecisionCycle {
    fetcher: Arc<MarketDataFetcher>,
    extended: Arc<ExtendedDataFetcher>,
    regime_agent: Arc<RegimeAgent>,
    intelligence_agent: Arc<IntelligenceAgent>,
    signal_agent: Arc<SignalAgent>,
    prediction_agent: Arc<PredictionAgent>,
    risk_agent: Arc<RiskAgent>,
    position_agent: Arc<PositionAgent>,
    constraints: Arc<TradingConstraints>,
    trader: Arc<dyn TraderPort>,
    store: Arc<PredictionStore>,
    memory: Arc<TradeMemory>,
    tracker: Arc<TickerTracker>,
    candidates: Arc<CandidateQueue>,
    config: CycleConfig,
    shutdown: CancellationToken,
}

impl DecisionCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<MarketDataFetcher>,
        extended: Arc<ExtendedDataFetcher>,
        regime_agent: Arc<RegimeAgent>,
        intelligence_agent: Arc<IntelligenceAgent>,
        signal_agent: Arc<SignalAgent>,
        prediction_agent: Arc<PredictionAgent>,
        risk_agent: Arc<RiskAgent>,
        position_agent: Arc<PositionAgent>,
        constraints: Arc<TradingConstraints>,
        trader: Arc<dyn TraderPort>,
        store: Arc<PredictionStore>,
        memory: Arc<TradeMemory>,
        tracker: Arc<TickerTracker>,
        candidates: Arc<CandidateQueue>,
        config: CycleConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
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
            tracker,
            candidates,
            config,
            shutdown,
        }
    }

    /// Cycle loop until cancellation.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "cycle aborted");
                    }
                }
            }
        }
        info!("decision cycle stopped");
    }

    async fn run_cycle(&self) -> Result<(), EngineError> {
        // 1–3: BTC context, regime, market intelligence.
        let btc = self.fetcher.get_market_data(BTC_SYMBOL).await?;
        let regime = self.regime_agent.analyze(&btc).await?;
        let btc_extended = self.extended.get(BTC_SYMBOL).await;
        let intelligence = self
            .intelligence_agent
            .collect(&btc, Some(&btc_extended))
            .await?;

        info!(
            regime = %regime.regime,
            strategy = %regime.strategy,
            atr_pct = format!("{:.2}", regime.atr_pct),
            phase = ?intelligence.market_phase,
            constraints = %self.constraints.status(),
            "cycle context ready"
        );

        // Account state feeds both the prediction context and sizing.
        let balance = self.trader.get_balance().await?;
        let positions = self.trader.get_positions().await?;
        let equity = balance.total_equity().to_f64().unwrap_or(0.0);
        let available = balance.available.to_f64().unwrap_or(0.0);
        let account = AccountSnapshot {
            total_equity: equity,
            available_balance: available,
            margin_used_pct: if equity > 0.0 {
                ((equity - available) / equity * 100.0).max(0.0)
            } else {
                0.0
            },
            position_count: positions.len(),
        };

        // 4: candidate fan-out (skipped entirely in a wait regime).
        let survivors = if regime.strategy == Strategy::Wait {
            debug!("wait regime — skipping candidate evaluation");
            Vec::new()
        } else {
            let candidates = self.collect_candidates(&positions).await;
            self.evaluate_candidates(candidates, &regime, &intelligence, &account, &positions)
                .await
        };

        // 5–6: risk, constraints, open.
        let mut open_count = positions.len();
        for candidate in survivors {
            match self
                .try_open(&candidate, &regime, equity, available, open_count)
                .await
            {
                Ok(true) => open_count += 1,
                Ok(false) => {}
                Err(e) if e.is_rejection() => {
                    info!(symbol = %candidate.symbol, reason = %e, "open rejected");
                }
                Err(e) => {
                    warn!(stage = "risk", symbol = %candidate.symbol, error = %e, "open failed");
                }
            }
        }

        // 7–8: manage held positions.
        for position in &positions {
            if let Err(e) = self.manage_position(position, &regime).await {
                if e.is_rejection() {
                    info!(symbol = %position.symbol, reason = %e, "close rejected");
                } else {
                    warn!(stage = "position", symbol = %position.symbol, error = %e, "position management failed");
                }
            }
        }

        Ok(())
    }

    /// Queue-fed symbols first, then the head of the volume board, minus
    /// anything already held.
    async fn collect_candidates(&self, positions: &[Position]) -> Vec<String> {
        let held: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();

        let mut out: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for symbol in self
            .candidates
            .drain()
            .into_iter()
            .chain(self.tracker.top_symbols().await)
        {
            if held.contains(symbol.as_str()) || symbol == BTC_SYMBOL {
                continue;
            }
            if seen.insert(symbol.clone()) {
                out.push(symbol);
            }
            if out.len() >= self.config.max_candidates {
                break;
            }
        }
        out
    }

    async fn evaluate_candidates(
        &self,
        candidates: Vec<String>,
        regime: &RegimeResult,
        intelligence: &crate::types::MarketIntelligence,
        account: &AccountSnapshot,
        positions: &[Position],
    ) -> Vec<CandidateDecision> {
        let performance = self.store.performance();
        let sharpe = self.memory.rolling_sharpe();
        let digest = self.memory.load_digest();

        stream::iter(candidates)
            .map(|symbol| {
                let performance = performance;
                let digest = digest.as_deref();
                async move {
                    match self
                        .evaluate_symbol(
                            &symbol,
                            regime,
                            intelligence,
                            account,
                            positions,
                            performance.as_ref(),
                            sharpe,
                            digest,
                        )
                        .await
                    {
                        Ok(decision) => decision,
                        Err(e) if e.is_rejection() => {
                            info!(symbol = %symbol, reason = %e, "candidate rejected");
                            None
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "candidate dropped");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.fanout_limit)
            .filter_map(|decision| async move { decision })
            .collect()
            .await
    }

    /// Per-symbol chain: fetch → signal → prediction. Stages are serialized
    /// for one symbol, parallel across symbols.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_symbol(
        &self,
        symbol: &str,
        regime: &RegimeResult,
        intelligence: &crate::types::MarketIntelligence,
        account: &AccountSnapshot,
        positions: &[Position],
        performance: Option<&crate::types::HistoricalPerformance>,
        sharpe: f64,
        digest: Option<&str>,
    ) -> Result<Option<CandidateDecision>, EngineError> {
        let market = self.fetcher.get_market_data(symbol).await?;
        let extended = self.extended.get(symbol).await;

        let signal = self.signal_agent.detect(symbol, &market, regime).await?;
        if !signal.valid {
            debug!(symbol, score = signal.score, "signal invalid, dropping");
            return Ok(None);
        }

        let feedback = self.store.recent_feedback(symbol, 10);
        let context = PredictionContext {
            intelligence,
            market: &market,
            extended: Some(&extended),
            account: Some(account),
            positions,
            performance,
            sharpe_ratio: sharpe,
            memory_digest: digest,
            recent_feedback: feedback.as_deref(),
        };
        let prediction = self.prediction_agent.predict(&context).await?;

        if !directions_agree(signal.direction, prediction.direction) {
            info!(
                symbol,
                signal = %signal.direction,
                prediction = %prediction.direction,
                "signal and prediction disagree, dropping"
            );
            return Ok(None);
        }

        Ok(Some(CandidateDecision {
            symbol: symbol.to_string(),
            market,
            signal,
            prediction,
        }))
    }

    /// Risk, constraint gate, then the order operations.
    async fn try_open(
        &self,
        candidate: &CandidateDecision,
        regime: &RegimeResult,
        equity: f64,
        available: f64,
        open_count: usize,
    ) -> Result<bool, EngineError> {
        let risk = self
            .risk_agent
            .calculate(
                &candidate.symbol,
                candidate.signal.direction,
                candidate.signal.scenario,
                candidate.signal.score,
                &candidate.market,
                regime,
                equity,
                available,
            )
            .await?;

        self.constraints.can_open(&candidate.symbol, open_count)?;

        let side = match candidate.signal.direction {
            SignalDirection::Long => PositionSide::Long,
            SignalDirection::Short => PositionSide::Short,
            SignalDirection::None => return Ok(false),
        };

        let quantity = risk.position_size / candidate.market.current_price;
        let rendered = self
            .trader
            .format_quantity(&candidate.symbol, quantity)
            .await?;

        self.trader
            .set_leverage(&candidate.symbol, risk.leverage)
            .await?;
        let ack = match side {
            PositionSide::Long => {
                self.trader
                    .open_long(&candidate.symbol, quantity, risk.leverage)
                    .await?
            }
            PositionSide::Short => {
                self.trader
                    .open_short(&candidate.symbol, quantity, risk.leverage)
                    .await?
            }
        };
        self.trader
            .set_stop_loss(&candidate.symbol, side, quantity, risk.stop_loss)
            .await?;
        self.trader
            .set_take_profit(&candidate.symbol, side, quantity, risk.take_profit)
            .await?;

        self.constraints.record_open(&candidate.symbol, side);

        info!(
            symbol = %candidate.symbol,
            %side,
            quantity = %rendered,
            price = ack.price,
            leverage = risk.leverage,
            stop = risk.stop_loss,
            take_profit = risk.take_profit,
            risk_reward = format!("{:.2}", risk.risk_reward),
            "position opened"
        );
        self.memory.log_signal(&candidate.signal);
        self.memory.log_line(&format!(
            "open {} {side} qty={rendered} score={} scenario={}",
            candidate.symbol, candidate.signal.score, candidate.signal.scenario
        ));

        let record = PredictionRecord {
            timestamp: chrono::Utc::now(),
            symbol: candidate.symbol.clone(),
            prediction: candidate.prediction.clone(),
            snapshot: PredictionSnapshot {
                price: candidate.market.current_price,
                atr_pct: candidate.market.atr_pct(),
                regime: regime.regime,
                signal_score: candidate.signal.score,
            },
            evaluated: false,
            is_correct: None,
            accuracy: None,
        };
        if let Err(e) = self.store.append(&record) {
            warn!(symbol = %candidate.symbol, error = %e, "prediction record write failed");
        }

        Ok(true)
    }

    /// Position-agent pass for one held position.
    async fn manage_position(
        &self,
        position: &Position,
        regime: &RegimeResult,
    ) -> Result<(), EngineError> {
        let market = self.fetcher.get_market_data(&position.symbol).await?;
        let decision = self
            .position_agent
            .evaluate(position, &market, regime)
            .await?;

        if decision.action == CloseAction::Hold {
            debug!(symbol = %position.symbol, "holding");
            return Ok(());
        }

        self.constraints
            .can_close(&position.symbol, position.side, decision.forced_stop_loss)?;

        match decision.action {
            CloseAction::CloseLong => {
                self.trader.close_long(&position.symbol, 0.0).await?;
            }
            CloseAction::CloseShort => {
                self.trader.close_short(&position.symbol, 0.0).await?;
            }
            CloseAction::Hold => unreachable!(),
        }
        self.constraints.record_close(&position.symbol, position.side);
        self.memory
            .record_close(&position.symbol, position.side, position.unrealized_pnl_pct);

        info!(
            symbol = %position.symbol,
            side = %position.side,
            reason = ?decision.reason,
            forced = decision.forced_stop_loss,
            pnl_pct = format!("{:+.2}", position.unrealized_pnl_pct),
            "position closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_agreement_gate() {
        assert!(directions_agree(SignalDirection::Long, PredictionDirection::Up));
        assert!(directions_agree(SignalDirection::Short, PredictionDirection::Down));
        assert!(!directions_agree(SignalDirection::Long, PredictionDirection::Down));
        assert!(!directions_agree(SignalDirection::Long, PredictionDirection::Neutral));
        assert!(!directions_agree(SignalDirection::None, PredictionDirection::Up));
    }

    #[test]
    fn candidate_queue_deduplicates_and_drains() {
        let queue = CandidateQueue::new();
        queue.push("SOLUSDT");
        queue.push("OPUSDT");
        queue.push("SOLUSDT");
        assert_eq!(queue.drain(), vec!["SOLUSDT".to_string(), "OPUSDT".to_string()]);
        // Drained symbols may be queued again.
        queue.push("SOLUSDT");
        assert_eq!(queue.drain(), vec!["SOLUSDT".to_string()]);
        assert!(queue.drain().is_empty());
    }
}
