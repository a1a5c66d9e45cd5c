//! Market-intelligence stage: a lightweight model call summarizing the
//! global backdrop into a phase, risks and opportunities.
//!
//! The BTC technical context is shaped deterministically in code; the model
//! only narrates and picks the phase from a closed set.

use std::sync::Arc;

use serde::Deserialize;

use crate::core::extended_data::format_extended;
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{
    BtcContext, ExtendedData, MarketData, MarketIntelligence, MarketPhase, TrendStrength,
    VolatilityLevel,
};

const STAGE: &str = "intelligence";

/// Deterministic BTC backdrop: volatility bucket and EMA-stack trend
/// strength, never delegated to the model.
pub fn build_btc_context(btc: &MarketData) -> BtcContext {
    let atr_percent = btc.atr_pct();

    let volatility = if atr_percent < 1.0 {
        VolatilityLevel::Low
    } else if atr_percent < 2.5 {
        VolatilityLevel::Medium
    } else {
        VolatilityLevel::High
    };

    let lt = &btc.longer_term;
    let price = btc.current_price;
    let trend_strength = if price > lt.ema20 && lt.ema20 > lt.ema50 && lt.ema50 > lt.ema200 {
        TrendStrength::StrongUp
    } else if price > lt.ema50 && lt.ema50 > lt.ema200 {
        TrendStrength::WeakUp
    } else if price < lt.ema20 && lt.ema20 < lt.ema50 && lt.ema50 < lt.ema200 {
        TrendStrength::StrongDown
    } else if price < lt.ema50 && lt.ema50 < lt.ema200 {
        TrendStrength::WeakDown
    } else {
        TrendStrength::Neutral
    };

    BtcContext {
        price,
        change_15m: btc.price_change_15m,
        change_30m: btc.price_change_30m,
        change_1h: btc.price_change_1h,
        change_4h: btc.price_change_4h,
        atr_percent,
        volatility,
        trend_strength,
    }
}

#[derive(Debug, Deserialize)]
struct RawIntelligence {
    market_phase: String,
    #[serde(default)]
    key_risks: Vec<String>,
    #[serde(default)]
    key_opportunities: Vec<String>,
    #[serde(default)]
    summary: String,
}

pub struct IntelligenceAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
}

impl IntelligenceAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        let system_prompt = concat!(
            "Role: summarise the global crypto context. Output JSON only:\n",
            "{\"market_phase\":\"\",\"key_risks\":[],\"key_opportunities\":[],\"summary\":\"\"}\n",
            "Rules: market_phase ∈ {accumulation,markup,distribution,markdown}. ",
            "key_risks/key_opportunities: up to 3 short phrases each. ",
            "summary: at most 3 sentences covering direction, sentiment and risk. ",
            "No extra text, no markdown fences."
        )
        .to_string();
        Self { llm, system_prompt }
    }

    pub async fn collect(
        &self,
        btc: &MarketData,
        extended: Option<&ExtendedData>,
    ) -> Result<MarketIntelligence, EngineError> {
        let context = build_btc_context(btc);
        let user_prompt = build_user_prompt(btc, &context, extended);

        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;
        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        let raw: RawIntelligence = serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))?;

        let market_phase = parse_phase(&raw.market_phase).ok_or_else(|| {
            EngineError::contract(STAGE, format!("unknown market phase {:?}", raw.market_phase))
        })?;

        Ok(MarketIntelligence {
            market_phase,
            key_risks: raw.key_risks,
            key_opportunities: raw.key_opportunities,
            summary: raw.summary,
            btc: context,
        })
    }
}

fn parse_phase(value: &str) -> Option<MarketPhase> {
    match value.trim().to_lowercase().as_str() {
        "accumulation" => Some(MarketPhase::Accumulation),
        "markup" => Some(MarketPhase::Markup),
        "distribution" => Some(MarketPhase::Distribution),
        "markdown" => Some(MarketPhase::Markdown),
        _ => None,
    }
}

fn build_user_prompt(
    btc: &MarketData,
    context: &BtcContext,
    extended: Option<&ExtendedData>,
) -> String {
    let mut p = String::from("Source: futures 3m aggregates + 4h indicators.\n");

    // Rapid-move call-outs sharpen the model's attention on fresh breaks.
    let mut alert = String::new();
    if context.change_15m <= -1.0 {
        alert.push_str(&format!(" [15m drop {:.1}%]", context.change_15m));
    } else if context.change_15m >= 1.0 {
        alert.push_str(&format!(" [15m spike {:+.1}%]", context.change_15m));
    }
    if context.change_30m <= -1.5 {
        alert.push_str(&format!(" [30m drop {:.1}%]", context.change_30m));
    } else if context.change_30m >= 1.5 {
        alert.push_str(&format!(" [30m spike {:+.1}%]", context.change_30m));
    }

    p.push_str(&format!(
        "BTC snapshot: price={:.2} | Δ15m={:+.2}% | Δ30m={:+.2}% | Δ1h={:+.2}% | Δ4h={:+.2}%{alert} | ATR%={:.2} ({:?}) | trend={:?}\n",
        context.price,
        context.change_15m,
        context.change_30m,
        context.change_1h,
        context.change_4h,
        context.atr_percent,
        context.volatility,
        context.trend_strength,
    ));

    let lt = &btc.longer_term;
    let vol_delta = if lt.average_volume > 0.0 {
        (lt.current_volume / lt.average_volume - 1.0) * 100.0
    } else {
        0.0
    };
    p.push_str(&format!(
        "BTC 4h: EMA20={:.2} | EMA50={:.2} | EMA200={:.2} | MACD={:.2} | RSI7={:.2} | vol={:.0}/{:.0} ({vol_delta:+.1}%)\n",
        lt.ema20, lt.ema50, lt.ema200, btc.macd, btc.rsi7, lt.current_volume, lt.average_volume,
    ));

    if let Some(ext) = extended {
        let formatted = format_extended(ext);
        if !formatted.is_empty() {
            p.push_str(&format!("Extended: {formatted}\n"));
        }
    }

    p.push_str("Output the JSON for this backdrop.");
    p
}
