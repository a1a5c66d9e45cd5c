//! Risk stage: leverage, stops and sizing.
//!
//! The model chooses exactly two numbers — a stop multiple and a take-profit
//! multiple — and both are validated against the ATR-band tables. Every
//! price, ratio and size is computed in code. A stop that would cross the
//! liquidation price is repaired toward a safe fraction of the gap, with the
//! take-profit rescaled to preserve the chosen ratio; when the repair cannot
//! keep the minimum risk/reward, the trade is abandoned.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::constants::*;
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{
    MarketData, Regime, RegimeResult, RiskParameters, Scenario, SignalDirection,
};

const STAGE: &str = "risk";

#[derive(Debug, Deserialize)]
struct RawRiskChoice {
    stop_multiple: f64,
    take_profit_multiple: f64,
    #[serde(default)]
    reasoning: String,
}

/// Expected multiples for an ATR% band and regime:
/// `(stop, min take-profit, max take-profit)`.
pub(crate) fn expected_multiples(
    atr_pct: f64,
    regime: Regime,
    scenario: Scenario,
) -> (f64, f64, f64) {
    if scenario == Scenario::Countertrend {
        return (
            COUNTERTREND_STOP_MULTIPLE,
            COUNTERTREND_TP_MULTIPLE,
            COUNTERTREND_TP_MULTIPLE,
        );
    }

    let (stop, base_tp) = if atr_pct < ATR_PCT_LOW {
        (4.0, 8.0)
    } else if atr_pct < ATR_PCT_MID {
        (5.0, 10.0)
    } else {
        (6.0, 12.0)
    };

    let (min_tp, max_tp) = if matches!(regime, Regime::A1 | Regime::A2) {
        // Trend regimes get room to run.
        if atr_pct < ATR_PCT_LOW {
            (12.0, 15.0)
        } else if atr_pct < ATR_PCT_MID {
            (12.0, 16.0)
        } else {
            (14.0, 18.0)
        }
    } else {
        (base_tp, base_tp)
    };

    (stop, min_tp, max_tp)
}

/// Scenario adjustment applied after validation of the raw choice.
pub(crate) fn apply_scenario(
    stop: f64,
    take_profit: f64,
    regime: Regime,
    scenario: Scenario,
) -> (f64, f64) {
    if !matches!(regime, Regime::A1 | Regime::A2) {
        return (stop, take_profit);
    }
    match scenario {
        Scenario::Breakout => (
            stop,
            (take_profit * 1.2).clamp(MIN_TP_MULTIPLE, MAX_TP_MULTIPLE),
        ),
        Scenario::Pullback => (
            (stop * 1.5).clamp(MIN_STOP_MULTIPLE, MAX_STOP_MULTIPLE),
            (take_profit * 1.5).clamp(MIN_TP_MULTIPLE, MAX_TP_MULTIPLE),
        ),
        Scenario::Countertrend => (COUNTERTREND_STOP_MULTIPLE, COUNTERTREND_TP_MULTIPLE),
        _ => (stop, take_profit),
    }
}

/// Leverage from the asset class and the volatility band; countertrend is
/// hard-capped.
pub(crate) fn calculate_leverage(
    symbol: &str,
    atr_pct: f64,
    scenario: Scenario,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
) -> u32 {
    if scenario == Scenario::Countertrend {
        return COUNTERTREND_MAX_LEVERAGE;
    }

    let base = if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
        btc_eth_leverage
    } else {
        altcoin_leverage
    };

    let coefficient = if atr_pct < ATR_PCT_LOW {
        1.0
    } else if atr_pct < ATR_PCT_MID {
        0.8
    } else {
        0.6
    };

    ((base as f64 * coefficient) as u32).max(1)
}

/// Liquidation price approximation on the entry side.
pub(crate) fn liquidation_price(direction: SignalDirection, price: f64, leverage: u32) -> f64 {
    let margin_rate = LIQUIDATION_MARGIN_RATE / leverage.max(1) as f64;
    match direction {
        SignalDirection::Long => price * (1.0 - margin_rate),
        _ => price * (1.0 + margin_rate),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StopResolution {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_multiple: f64,
    pub tp_multiple: f64,
    pub liquidation_price: f64,
    /// True when the liquidation repair moved the stop.
    pub adjusted: bool,
}

/// Turn multiples into prices, repairing a stop that crosses liquidation.
///
/// `choice_ratio` is the model's original TP/stop ratio, preserved through
/// the repair so the trade keeps the risk/reward it was sized for.
pub(crate) fn resolve_stops(
    direction: SignalDirection,
    price: f64,
    atr: f64,
    leverage: u32,
    stop_multiple: f64,
    tp_multiple: f64,
    choice_ratio: f64,
) -> Result<StopResolution, String> {
    if atr <= 0.0 || price <= 0.0 {
        return Err("price or ATR not positive".into());
    }

    let liq = liquidation_price(direction, price, leverage);
    let mut stop_m = stop_multiple;
    let mut tp_m = tp_multiple;
    let mut adjusted = false;

    let (stop_loss, crosses) = match direction {
        SignalDirection::Long => {
            let stop = price - atr * stop_m;
            (stop, stop <= liq)
        }
        _ => {
            let stop = price + atr * stop_m;
            (stop, stop >= liq)
        }
    };

    let stop_loss = if crosses {
        adjusted = true;
        let safe = match direction {
            SignalDirection::Long => liq + (price - liq) * LIQUIDATION_SAFETY_RATIO,
            _ => liq - (liq - price) * LIQUIDATION_SAFETY_RATIO,
        };
        let actual_m = (price - safe).abs() / atr;
        if !(MIN_STOP_MULTIPLE..=MAX_STOP_MULTIPLE).contains(&actual_m) {
            return Err(format!(
                "repaired stop multiple {actual_m:.2} leaves [{MIN_STOP_MULTIPLE}, {MAX_STOP_MULTIPLE}]"
            ));
        }
        stop_m = actual_m;
        tp_m = actual_m * choice_ratio;
        if !(MIN_TP_MULTIPLE..=MAX_TP_MULTIPLE).contains(&tp_m) {
            // Last resort: the floor take-profit, if it still clears the bar.
            tp_m = MIN_TP_MULTIPLE;
            let rr = tp_m / stop_m;
            if rr < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
                return Err(format!(
                    "repair cannot hold R/R ≥ {MIN_RISK_REWARD:.1} (got {rr:.2})"
                ));
            }
        }
        safe
    } else {
        stop_loss
    };

    let take_profit = match direction {
        SignalDirection::Long => price + atr * tp_m,
        _ => price - atr * tp_m,
    };

    Ok(StopResolution {
        stop_loss,
        take_profit,
        stop_multiple: stop_m,
        tp_multiple: tp_m,
        liquidation_price: liq,
        adjusted,
    })
}

/// Notional size from the risk budget, confidence and scenario, capped by
/// usable margin.
pub(crate) fn position_size(
    equity: f64,
    available: f64,
    leverage: u32,
    price: f64,
    stop_loss: f64,
    scenario: Scenario,
    signal_score: i32,
) -> Result<f64, String> {
    let move_pct = (price - stop_loss).abs() / price;
    if move_pct <= 0.0 {
        return Err("stop distance too small to size against".into());
    }

    let scenario_factor = match scenario {
        Scenario::Pullback => PULLBACK_RISK_FACTOR,
        Scenario::Countertrend => COUNTERTREND_RISK_FACTOR,
        _ => 1.0,
    };
    let confidence_factor = if signal_score >= 90 {
        CONFIDENCE_HIGH_MULTIPLIER
    } else if signal_score < 85 {
        CONFIDENCE_LOW_MULTIPLIER
    } else {
        CONFIDENCE_MEDIUM_MULTIPLIER
    };

    let risk_budget = equity * RISK_BUDGET_PER_TRADE * scenario_factor * confidence_factor;
    let mut size = risk_budget / move_pct;

    let leverage = leverage.max(1) as f64;
    let max_notional = available * MARGIN_USAGE_LIMIT * leverage;
    if max_notional > 0.0 && size > max_notional {
        size = max_notional;
    }
    if size / leverage > available * MARGIN_USAGE_LIMIT {
        size = available * MARGIN_USAGE_LIMIT * leverage;
    }

    if size <= 0.0 {
        return Err("margin limits reduce the position to zero".into());
    }
    Ok(size)
}

pub struct RiskAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
}

impl RiskAgent {
    pub fn new(llm: Arc<LlmClient>, btc_eth_leverage: u32, altcoin_leverage: u32) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(),
            btc_eth_leverage,
            altcoin_leverage,
        }
    }

    /// Compute the full risk parameter set for an approved signal.
    ///
    /// Contract violations by the model surface as `ModelContract`; guard
    /// failures (irreparable stop, zero size) as `RiskRejected`.
    #[allow(clippy::too_many_arguments)]
    pub async fn calculate(
        &self,
        symbol: &str,
        direction: SignalDirection,
        scenario: Scenario,
        signal_score: i32,
        market: &MarketData,
        regime: &RegimeResult,
        account_equity: f64,
        available_balance: f64,
    ) -> Result<RiskParameters, EngineError> {
        let price = market.current_price;
        let atr = market.longer_term.atr14;
        if atr <= 0.0 {
            return Err(EngineError::DataUnavailable {
                name: format!("{symbol} ATR"),
            });
        }
        let atr_pct = market.atr_pct();

        let choice = self.get_choice(symbol, direction, price, atr, atr_pct, regime, scenario).await?;

        // Hard range first, then the band table.
        if !(MIN_STOP_MULTIPLE..=MAX_STOP_MULTIPLE).contains(&choice.stop_multiple) {
            return Err(EngineError::contract(
                STAGE,
                format!("stop multiple {:.1} outside [2.0, 8.0]", choice.stop_multiple),
            ));
        }
        if !(MIN_TP_MULTIPLE..=MAX_TP_MULTIPLE).contains(&choice.take_profit_multiple) {
            return Err(EngineError::contract(
                STAGE,
                format!(
                    "take-profit multiple {:.1} outside [6.0, 20.0]",
                    choice.take_profit_multiple
                ),
            ));
        }

        if scenario != Scenario::Countertrend {
            let (expected_stop, min_tp, max_tp) = expected_multiples(atr_pct, regime.regime, scenario);
            if (choice.stop_multiple - expected_stop).abs() > STOP_MULTIPLE_TOLERANCE {
                return Err(EngineError::contract(
                    STAGE,
                    format!(
                        "ATR% {atr_pct:.2} expects stop {expected_stop:.1}±{STOP_MULTIPLE_TOLERANCE}, model chose {:.1}",
                        choice.stop_multiple
                    ),
                ));
            }
            if choice.take_profit_multiple < min_tp || choice.take_profit_multiple > max_tp {
                return Err(EngineError::contract(
                    STAGE,
                    format!(
                        "ATR% {atr_pct:.2} + regime {} expects TP in [{min_tp:.1}, {max_tp:.1}], model chose {:.1}",
                        regime.regime, choice.take_profit_multiple
                    ),
                ));
            }
        }

        let choice_ratio = choice.take_profit_multiple / choice.stop_multiple;
        let (stop_m, tp_m) = apply_scenario(
            choice.stop_multiple,
            choice.take_profit_multiple,
            regime.regime,
            scenario,
        );

        let leverage = calculate_leverage(
            symbol,
            atr_pct,
            scenario,
            self.btc_eth_leverage,
            self.altcoin_leverage,
        );

        let resolution = resolve_stops(direction, price, atr, leverage, stop_m, tp_m, choice_ratio)
            .map_err(|reason| EngineError::RiskRejected { reason })?;

        // R/R re-derived from prices and cross-checked against the multiples.
        let (risk_percent, reward_percent) = match direction {
            SignalDirection::Long => (
                (price - resolution.stop_loss) / price * 100.0,
                (resolution.take_profit - price) / price * 100.0,
            ),
            _ => (
                (resolution.stop_loss - price) / price * 100.0,
                (price - resolution.take_profit) / price * 100.0,
            ),
        };
        if risk_percent <= 0.0 {
            return Err(EngineError::RiskRejected {
                reason: format!("degenerate risk percent {risk_percent:.4}"),
            });
        }
        let risk_reward = reward_percent / risk_percent;

        let theoretical = resolution.tp_multiple / resolution.stop_multiple;
        let tolerance = if resolution.adjusted {
            RR_FLOAT_TOLERANCE
        } else {
            RR_STRICT_TOLERANCE
        };
        if (risk_reward - theoretical).abs() > tolerance * theoretical {
            return Err(EngineError::RiskRejected {
                reason: format!(
                    "risk/reward drift: prices give {risk_reward:.2}, multiples give {theoretical:.2}"
                ),
            });
        }
        if risk_reward < MIN_RISK_REWARD * (1.0 - RR_FLOAT_TOLERANCE) {
            return Err(EngineError::RiskRejected {
                reason: format!("risk/reward {risk_reward:.2} below {MIN_RISK_REWARD:.1}"),
            });
        }

        let size = position_size(
            account_equity,
            available_balance,
            leverage,
            price,
            resolution.stop_loss,
            scenario,
            signal_score,
        )
        .map_err(|reason| EngineError::RiskRejected { reason })?;

        let mut reasoning = format!(
            "ATR%={atr_pct:.2} | scenario={scenario} | stop {:.1}x→{:.4} | tp {:.1}x→{:.4} | R/R={risk_reward:.2} | liq={:.4} | lev={leverage}x",
            resolution.stop_multiple,
            resolution.stop_loss,
            resolution.tp_multiple,
            resolution.take_profit,
            resolution.liquidation_price,
        );
        if resolution.adjusted {
            reasoning.push_str(" | stop repaired clear of liquidation");
        }
        if !choice.reasoning.is_empty() {
            reasoning.push_str(" | model: ");
            reasoning.push_str(&choice.reasoning);
        }

        let result = RiskParameters {
            leverage,
            position_size: size,
            stop_loss: resolution.stop_loss,
            take_profit: resolution.take_profit,
            risk_reward,
            liquidation_price: resolution.liquidation_price,
            risk_percent,
            reward_percent,
            valid: true,
            reasoning,
        };

        validate_result(&result, direction, price).map_err(|reason| EngineError::RiskRejected { reason })?;

        debug!(symbol, %direction, leverage, size, "risk parameters resolved");
        Ok(result)
    }

    async fn get_choice(
        &self,
        symbol: &str,
        direction: SignalDirection,
        price: f64,
        atr: f64,
        atr_pct: f64,
        regime: &RegimeResult,
        scenario: Scenario,
    ) -> Result<RawRiskChoice, EngineError> {
        let user_prompt = format!(
            "# Trade\n\
             symbol: {symbol} {direction} | price: {price:.4} | 4h ATR14: {atr:.4} | ATR% (precomputed): {atr_pct:.2}%\n\
             regime: {} ({}) | scenario: {scenario}\n\n\
             Choose the stop and take-profit multiples and output the JSON.",
            regime.regime, regime.strategy
        );

        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;
        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))
    }
}

/// Final direction-consistent ordering and guard re-check.
fn validate_result(
    result: &RiskParameters,
    direction: SignalDirection,
    price: f64,
) -> Result<(), String> {
    match direction {
        SignalDirection::Long => {
            if result.stop_loss >= price {
                return Err(format!("long stop {:.4} not below entry {price:.4}", result.stop_loss));
            }
            if result.take_profit <= price {
                return Err(format!(
                    "long take-profit {:.4} not above entry {price:.4}",
                    result.take_profit
                ));
            }
            if result.stop_loss <= result.liquidation_price {
                return Err(format!(
                    "long stop {:.4} at or below liquidation {:.4}",
                    result.stop_loss, result.liquidation_price
                ));
            }
        }
        _ => {
            if result.stop_loss <= price {
                return Err(format!("short stop {:.4} not above entry {price:.4}", result.stop_loss));
            }
            if result.take_profit >= price {
                return Err(format!(
                    "short take-profit {:.4} not below entry {price:.4}",
                    result.take_profit
                ));
            }
            if result.stop_loss >= result.liquidation_price {
                return Err(format!(
                    "short stop {:.4} at or above liquidation {:.4}",
                    result.stop_loss, result.liquidation_price
                ));
            }
        }
    }

    if result.position_size <= 0.0 {
        return Err("position size not positive".into());
    }
    Ok(())
}

fn build_system_prompt() -> String {
    let mut p = String::new();
    p.push_str("You are a risk manager. Choose ONLY the stop and take-profit multiples — no other arithmetic.\n\n");
    p.push_str("# Base multiples by ATR%\n");
    p.push_str("```\n");
    p.push_str("low  (ATR% < 2):        stop 4.0×ATR | base TP  8.0×ATR\n");
    p.push_str("mid  (2 ≤ ATR% < 4):    stop 5.0×ATR | base TP 10.0×ATR\n");
    p.push_str("high (ATR% ≥ 4):        stop 6.0×ATR | base TP 12.0×ATR\n");
    p.push_str("```\n\n");
    p.push_str("# Take-profit by regime\n");
    p.push_str("```\n");
    p.push_str("trend (A1/A2): raise TP → low 12–15x, mid 12–16x, high 14–18x\n");
    p.push_str("range (B):     base TP  → low 8x, mid 10x, high 12x\n");
    p.push_str("```\n\n");
    p.push_str("Scenario adjustments (breakout/pullback/countertrend) are applied in code afterwards.\n\n");
    p.push_str("Output pure JSON:\n");
    p.push_str("{\"stop_multiple\":4.0,\"take_profit_multiple\":12.0,\"reasoning\":\"ATR%=1.8 low band + A2 trend\"}\n");
    p
}
