//! Regime stage: label the BTC 4h backdrop.
//!
//! The model only labels. The label rule is also applied in code as ground
//! truth, and the model must echo the code-computed ATR% — a disagreement on
//! either rejects the result.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::constants::{ATR_PCT_ECHO_TOLERANCE, ATR_PCT_QUIET};
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{MarketData, Regime, RegimeResult, Strategy};

const STAGE: &str = "regime";

/// Deterministic regime rule — the single source of truth.
///
/// ATR% < 1.0 → C; else price > EMA50 > EMA200 → A1; price < EMA50 < EMA200
/// → A2; anything else → B. ATR% exactly at 1.0 is not C.
pub fn classify(atr_pct: f64, price: f64, ema50: f64, ema200: f64) -> Regime {
    if atr_pct < ATR_PCT_QUIET {
        Regime::C
    } else if price > ema50 && ema50 > ema200 {
        Regime::A1
    } else if price < ema50 && ema50 < ema200 {
        Regime::A2
    } else {
        Regime::B
    }
}

#[derive(Debug, Deserialize)]
struct RawRegime {
    regime: String,
    atr_pct: f64,
    #[serde(default)]
    confidence: i64,
    strategy: String,
    #[serde(default)]
    reasoning: String,
}

pub struct RegimeAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
}

impl RegimeAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(),
        }
    }

    pub async fn analyze(&self, btc: &MarketData) -> Result<RegimeResult, EngineError> {
        let price = btc.current_price;
        let ema50 = btc.longer_term.ema50;
        let ema200 = btc.longer_term.ema200;
        let atr14 = btc.longer_term.atr14;
        let atr_pct = btc.atr_pct();

        let user_prompt = format!(
            "# BTC 4h inputs\n\
             - current price: {price:.2}\n\
             - 4h ATR14: {atr14:.3}\n\
             - 4h EMA50: {ema50:.3}\n\
             - 4h EMA200: {ema200:.3}\n\
             - ATR% (precomputed, echo exactly): {atr_pct:.2}\n\n\
             Label the regime and output the JSON."
        );

        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;
        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        let raw: RawRegime = serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))?;

        let labeled = parse_regime(&raw.regime)
            .ok_or_else(|| EngineError::contract(STAGE, format!("unknown regime {:?}", raw.regime)))?;

        // Echo check: the model must not recompute the volatility scalar.
        let echoed = (raw.atr_pct - round2(atr_pct)).abs();
        if echoed > ATR_PCT_ECHO_TOLERANCE + 1e-9 {
            return Err(EngineError::contract(
                STAGE,
                format!("atr_pct echo {:.4} deviates from {:.4}", raw.atr_pct, atr_pct),
            ));
        }

        // The label is a deterministic function of the inputs; disagreement
        // is a rejection, never a patch.
        let expected = classify(atr_pct, price, ema50, ema200);
        if labeled != expected {
            return Err(EngineError::contract(
                STAGE,
                format!("label {labeled} disagrees with rule ({expected})"),
            ));
        }

        let strategy = parse_strategy(&raw.strategy).ok_or_else(|| {
            EngineError::contract(STAGE, format!("unknown strategy {:?}", raw.strategy))
        })?;
        if strategy != expected.strategy() {
            return Err(EngineError::contract(
                STAGE,
                format!("strategy {strategy} does not match regime {expected}"),
            ));
        }

        debug!(regime = %expected, atr_pct, "regime labeled");

        Ok(RegimeResult {
            regime: expected,
            atr_pct,
            confidence: raw.confidence.clamp(0, 100) as u8,
            strategy,
            reasoning: raw.reasoning,
            price,
            ema50,
            ema200,
            atr14,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn parse_regime(value: &str) -> Option<Regime> {
    match value.trim().to_uppercase().as_str() {
        "A1" => Some(Regime::A1),
        "A2" => Some(Regime::A2),
        "B" => Some(Regime::B),
        "C" => Some(Regime::C),
        _ => None,
    }
}

fn parse_strategy(value: &str) -> Option<Strategy> {
    match value.trim().to_lowercase().as_str() {
        "long_only" => Some(Strategy::LongOnly),
        "short_only" => Some(Strategy::ShortOnly),
        "range" => Some(Strategy::Range),
        "wait" => Some(Strategy::Wait),
        _ => None,
    }
}

fn build_system_prompt() -> String {
    let mut p = String::new();
    p.push_str("You are a market regime analyst. Label the BTC 4h backdrop.\n\n");
    p.push_str("Mandatory three-step check:\n\n");
    p.push_str("STEP 1: the ATR% is precomputed in the input. Echo it exactly — do not recompute.\n\n");
    p.push_str("STEP 2: volatility gate.\n");
    p.push_str("```\n");
    p.push_str("IF ATR% < 1.0:\n");
    p.push_str("    regime = C (narrow range)\n");
    p.push_str("    strategy = wait (no entries)\n");
    p.push_str("    stop here and output the JSON\n");
    p.push_str("```\n\n");
    p.push_str("STEP 3: trend direction (only when ATR% >= 1.0).\n");
    p.push_str("```\n");
    p.push_str("IF price > EMA50 AND EMA50 > EMA200: regime = A1, strategy = long_only\n");
    p.push_str("ELSE IF price < EMA50 AND EMA50 < EMA200: regime = A2, strategy = short_only\n");
    p.push_str("ELSE: regime = B, strategy = range\n");
    p.push_str("```\n\n");
    p.push_str("Output pure JSON, no markdown fences:\n");
    p.push_str("{\"regime\":\"A2\",\"atr_pct\":1.04,\"confidence\":95,\"strategy\":\"short_only\",");
    p.push_str("\"reasoning\":\"ATR% = 1.04 >= 1.0 -> volatile. price < EMA50 < EMA200 -> A2 downtrend\"}\n");
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario: price 110500, EMA50 110200, EMA200 109000, ATR14 900 —
    // ATR% ≈ 0.814 < 1.0 gates everything to C/wait.
    #[test]
    fn quiet_market_classifies_c() {
        let atr_pct = 900.0 / 110_500.0 * 100.0;
        assert!(atr_pct < 1.0);
        let regime = classify(atr_pct, 110_500.0, 110_200.0, 109_000.0);
        assert_eq!(regime, Regime::C);
        assert_eq!(regime.strategy(), Strategy::Wait);
    }

    // Scenario: price 110540, EMA50 110821, EMA200 113297, ATR14 1150 —
    // ATR% ≈ 1.04 and the EMA stack points down.
    #[test]
    fn downtrend_classifies_a2() {
        let atr_pct = 1_150.0 / 110_540.0 * 100.0;
        assert!(atr_pct > 1.0);
        let regime = classify(atr_pct, 110_540.0, 110_821.0, 113_297.0);
        assert_eq!(regime, Regime::A2);
        assert_eq!(regime.strategy(), Strategy::ShortOnly);
    }

    #[test]
    fn uptrend_classifies_a1() {
        let regime = classify(2.0, 120_000.0, 115_000.0, 110_000.0);
        assert_eq!(regime, Regime::A1);
    }

    #[test]
    fn mixed_stack_classifies_b() {
        // Price above EMA50 but EMA50 below EMA200: neither trend holds.
        let regime = classify(1.5, 112_000.0, 111_000.0, 113_000.0);
        assert_eq!(regime, Regime::B);
    }

    #[test]
    fn atr_exactly_one_is_not_c() {
        let regime = classify(1.0, 100.0, 101.0, 102.0);
        assert_ne!(regime, Regime::C);
        assert_eq!(regime, Regime::A2);
    }

    #[test]
    fn regime_parsing_folds_case() {
        assert_eq!(parse_regime(" a1 "), Some(Regime::A1));
        assert_eq!(parse_regime("A2"), Some(Regime::A2));
        assert_eq!(parse_regime("D"), None);
        assert_eq!(parse_strategy("SHORT_ONLY"), Some(Strategy::ShortOnly));
        assert_eq!(parse_strategy("hold"), None);
    }
}
