//! Prediction stage: directional forecast per candidate symbol.
//!
//! The model forecasts; the validator enforces the closed enums, the
//! probability window, the sign rules and the cross-field bounds, and the
//! post-processor owns the probability→confidence mapping, the historical
//! calibration and the timeframe default. A disagreement is a rejection,
//! never a patch.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::constants::*;
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{
    AccountSnapshot, ConfidenceLevel, ExtendedData, HistoricalPerformance, MarketData,
    MarketIntelligence, Position, Prediction, PredictionDirection, RiskLevel, Timeframe,
};

const STAGE: &str = "prediction";

/// Everything the prediction prompt draws on.
pub struct PredictionContext<'a> {
    pub intelligence: &'a MarketIntelligence,
    pub market: &'a MarketData,
    pub extended: Option<&'a ExtendedData>,
    pub account: Option<&'a AccountSnapshot>,
    pub positions: &'a [Position],
    pub performance: Option<&'a HistoricalPerformance>,
    pub sharpe_ratio: f64,
    pub memory_digest: Option<&'a str>,
    pub recent_feedback: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RawPrediction {
    #[serde(default)]
    symbol: String,
    direction: String,
    probability: f64,
    expected_move: f64,
    #[serde(default)]
    timeframe: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    key_factors: Vec<String>,
    #[serde(default)]
    risk_level: String,
    worst_case: f64,
    best_case: f64,
}

pub struct PredictionAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
}

impl PredictionAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(),
        }
    }

    pub async fn predict(&self, ctx: &PredictionContext<'_>) -> Result<Prediction, EngineError> {
        let user_prompt = build_user_prompt(ctx);
        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;

        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        let raw: RawPrediction = serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))?;

        let mut prediction = normalize(raw, &ctx.market.symbol, ctx.market.atr_pct())?;

        // Historical calibration: shrink or stretch the claimed probability
        // toward the observed accuracy, inside a tight band.
        prediction.probability =
            calibrate_probability(prediction.probability, ctx.performance);

        // The confidence tier is exactly the probability mapping.
        prediction.confidence = confidence_for_probability(prediction.probability);

        validate(&prediction).map_err(|reason| EngineError::contract(STAGE, reason))?;

        // A struggling system argues for humility: one tier down.
        if ctx.sharpe_ratio < 0.0 {
            let demoted = prediction.confidence.demoted();
            if demoted != prediction.confidence {
                debug!(symbol = %prediction.symbol, "negative sharpe demotes confidence");
                prediction.confidence = demoted;
            }
        }

        Ok(prediction)
    }
}

/// Fold the raw model output onto the typed prediction. Unknown enum values
/// reject; an empty timeframe falls back to the volatility default.
fn normalize(
    raw: RawPrediction,
    symbol: &str,
    atr_pct_4h: f64,
) -> Result<Prediction, EngineError> {
    let direction = normalize_direction(&raw.direction).ok_or_else(|| {
        EngineError::contract(STAGE, format!("unknown direction {:?}", raw.direction))
    })?;

    let timeframe = if raw.timeframe.trim().is_empty() {
        default_timeframe(atr_pct_4h)
    } else {
        normalize_timeframe(&raw.timeframe).ok_or_else(|| {
            EngineError::contract(STAGE, format!("unknown timeframe {:?}", raw.timeframe))
        })?
    };

    let risk_level = normalize_risk_level(&raw.risk_level).ok_or_else(|| {
        EngineError::contract(STAGE, format!("unknown risk level {:?}", raw.risk_level))
    })?;

    // The model's confidence string is folded for the record but replaced by
    // the probability mapping right after.
    let confidence =
        normalize_confidence(&raw.confidence).unwrap_or(ConfidenceLevel::Medium);

    Ok(Prediction {
        symbol: if raw.symbol.trim().is_empty() {
            symbol.to_string()
        } else {
            raw.symbol.trim().to_uppercase()
        },
        direction,
        probability: raw.probability,
        expected_move: raw.expected_move,
        timeframe,
        confidence,
        reasoning: raw.reasoning,
        key_factors: raw.key_factors,
        risk_level,
        worst_case: raw.worst_case,
        best_case: raw.best_case,
    })
}

pub(crate) fn normalize_direction(value: &str) -> Option<PredictionDirection> {
    match value.trim().to_lowercase().as_str() {
        "up" | "long" | "bull" => Some(PredictionDirection::Up),
        "down" | "short" | "bear" => Some(PredictionDirection::Down),
        "neutral" => Some(PredictionDirection::Neutral),
        _ => None,
    }
}

pub(crate) fn normalize_timeframe(value: &str) -> Option<Timeframe> {
    match value.trim().to_lowercase().as_str() {
        "1h" | "1hr" => Some(Timeframe::H1),
        "4h" | "4hr" => Some(Timeframe::H4),
        "24h" | "1d" => Some(Timeframe::H24),
        _ => None,
    }
}

pub(crate) fn normalize_confidence(value: &str) -> Option<ConfidenceLevel> {
    let folded = value.trim().to_lowercase().replace([' ', '-'], "_");
    match folded.as_str() {
        "very_high" => Some(ConfidenceLevel::VeryHigh),
        "high" => Some(ConfidenceLevel::High),
        "medium" | "moderate" | "mid" => Some(ConfidenceLevel::Medium),
        "low" => Some(ConfidenceLevel::Low),
        "very_low" => Some(ConfidenceLevel::VeryLow),
        _ => None,
    }
}

pub(crate) fn normalize_risk_level(value: &str) -> Option<RiskLevel> {
    let folded = value.trim().to_lowercase().replace([' ', '-'], "_");
    match folded.as_str() {
        "very_low" => Some(RiskLevel::VeryLow),
        "low" => Some(RiskLevel::Low),
        "medium" | "moderate" => Some(RiskLevel::Medium),
        "high" => Some(RiskLevel::High),
        "very_high" => Some(RiskLevel::VeryHigh),
        _ => None,
    }
}

/// Probability → confidence tier; the invariant checked on every accepted
/// prediction.
pub fn confidence_for_probability(probability: f64) -> ConfidenceLevel {
    if probability >= 0.85 {
        ConfidenceLevel::VeryHigh
    } else if probability >= 0.75 {
        ConfidenceLevel::High
    } else if probability >= 0.65 {
        ConfidenceLevel::Medium
    } else if probability >= 0.55 {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::VeryLow
    }
}

/// Volatility-scaled horizon when the model leaves the timeframe blank:
/// fast markets get 1h, dead markets 24h, everything else 4h.
pub fn default_timeframe(atr_pct_4h: f64) -> Timeframe {
    if atr_pct_4h > TIMEFRAME_FAST_ATR_PCT {
        Timeframe::H1
    } else if atr_pct_4h < TIMEFRAME_SLOW_ATR_PCT {
        Timeframe::H24
    } else {
        Timeframe::H4
    }
}

/// Multiply the probability by `accuracy / 0.5`, clamped to [0.8, 1.2], once
/// the evaluated sample is large enough. The result stays inside [0.5, 1.0].
pub fn calibrate_probability(
    probability: f64,
    performance: Option<&HistoricalPerformance>,
) -> f64 {
    let Some(perf) = performance else {
        return probability;
    };
    if perf.evaluated_count < CALIBRATION_MIN_SAMPLES {
        return probability;
    }
    let multiplier = (perf.avg_accuracy / 0.5)
        .clamp(CALIBRATION_MIN_MULTIPLIER, CALIBRATION_MAX_MULTIPLIER);
    (probability * multiplier).clamp(0.5, 1.0)
}

/// Full cross-field validation. Returns the rejection reason.
pub fn validate(pred: &Prediction) -> Result<(), String> {
    if pred.symbol.is_empty() {
        return Err("symbol is empty".into());
    }
    if !(0.5..=1.0).contains(&pred.probability) {
        return Err(format!("probability {:.2} outside [0.5, 1.0]", pred.probability));
    }
    if pred.expected_move.abs() > MAX_EXPECTED_MOVE_PCT {
        return Err(format!(
            "expected_move {:.2} exceeds ±{MAX_EXPECTED_MOVE_PCT}",
            pred.expected_move
        ));
    }
    if pred.best_case.abs() > MAX_CASE_PCT || pred.worst_case.abs() > MAX_CASE_PCT {
        return Err(format!(
            "case bounds ({:.2}, {:.2}) exceed ±{MAX_CASE_PCT}",
            pred.worst_case, pred.best_case
        ));
    }
    if pred.best_case <= pred.worst_case {
        return Err(format!(
            "best_case {:.2} must exceed worst_case {:.2}",
            pred.best_case, pred.worst_case
        ));
    }

    match pred.direction {
        PredictionDirection::Up => {
            if pred.expected_move <= 0.0 {
                return Err(format!(
                    "direction up but expected_move {:.2} <= 0",
                    pred.expected_move
                ));
            }
            if pred.best_case <= 0.0 {
                return Err(format!("direction up but best_case {:.2} <= 0", pred.best_case));
            }
            if pred.worst_case > 0.0 {
                return Err(format!(
                    "direction up but worst_case {:.2} > 0 (drawdown must be allowed)",
                    pred.worst_case
                ));
            }
        }
        PredictionDirection::Down => {
            if pred.expected_move >= 0.0 {
                return Err(format!(
                    "direction down but expected_move {:.2} >= 0",
                    pred.expected_move
                ));
            }
            if pred.worst_case >= 0.0 {
                return Err(format!(
                    "direction down but worst_case {:.2} >= 0",
                    pred.worst_case
                ));
            }
        }
        PredictionDirection::Neutral => {
            if pred.probability > NEUTRAL_MAX_PROBABILITY {
                return Err(format!(
                    "neutral with probability {:.2} > {NEUTRAL_MAX_PROBABILITY}",
                    pred.probability
                ));
            }
        }
    }

    // Confidence must be exactly the probability mapping.
    let expected = confidence_for_probability(pred.probability);
    if pred.confidence != expected {
        return Err(format!(
            "confidence {:?} does not match probability {:.2} (expected {:?})",
            pred.confidence, pred.probability, expected
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn build_system_prompt() -> String {
    concat!(
        "Role: crypto price forecaster with risk awareness. Output ONLY compact JSON (no markdown) with fields:\n",
        "{\"symbol\":\"\",\"direction\":\"\",\"probability\":0.00,\"expected_move\":0.00,\"timeframe\":\"\",",
        "\"confidence\":\"\",\"reasoning\":\"\",\"key_factors\":[],\"risk_level\":\"\",\"worst_case\":0.00,\"best_case\":0.00}\n",
        "Rules: direction ∈ {up,down,neutral}. timeframe ∈ {1h,4h,24h}. probability ∈ [0.5,1]; below 0.70 consider \"neutral\". ",
        "Keep at most 2 decimals. Direction \"up\" ⇒ expected_move>0, best_case>0, worst_case≤0. ",
        "\"down\" ⇒ expected_move<0, worst_case<0, best_case>worst_case. ",
        "\"neutral\" ⇒ |expected_move|<0.5 and probability 0.50–0.65. ",
        "|expected_move| ≤ 10, |worst_case| and |best_case| ≤ 15, worst_case < best_case always.\n",
        "reasoning: 2–5 sentences: market read → account-aware risk view → probability justification. ",
        "key_factors: 3 short phrases naming the decisive inputs.\n",
        "Probability MUST reflect your true read of this setup; vary it with signal strength ",
        "(weak 0.65–0.72, moderate 0.73–0.78, strong 0.79–0.85, very strong above). ",
        "Your job is to PREDICT, not to abstain; neutral is for genuine uncertainty only. ",
        "If the system Sharpe is negative, shade probability down, do not stop predicting.\n",
        "Confidence mapping: ≥0.85 very_high; 0.75–0.85 high; 0.65–0.75 medium; 0.55–0.65 low; below very_low."
    )
    .to_string()
}

fn build_user_prompt(ctx: &PredictionContext<'_>) -> String {
    let mut p = String::from("Context: perpetual futures, 3m primary interval.\n");

    let intel = ctx.intelligence;
    p.push_str(&format!("GlobalPhase: {:?}\n", intel.market_phase));
    if !intel.key_risks.is_empty() {
        p.push_str(&format!("Risks: {}\n", intel.key_risks.join(" | ")));
    }
    if !intel.key_opportunities.is_empty() {
        p.push_str(&format!("Opportunities: {}\n", intel.key_opportunities.join(" | ")));
    }
    if !intel.summary.is_empty() {
        p.push_str(&format!("Summary: {}\n", intel.summary));
    }

    let md = ctx.market;
    p.push_str(&format!("\n=== {} ===\n", md.symbol));
    p.push_str(&format!("Price: {:.4}\n", md.current_price));

    let lt = &md.longer_term;
    let mark = |above: bool| if above { "✓" } else { "✗" };
    p.push_str(&format!(
        "vs EMAs (4h): {} EMA20({:.2}) | {} EMA50({:.2}) | {} EMA200({:.2})\n",
        mark(md.current_price > lt.ema20),
        lt.ema20,
        mark(md.current_price > lt.ema50),
        lt.ema50,
        mark(md.current_price > lt.ema200),
        lt.ema200,
    ));

    let atr_pct = md.atr_pct();
    let vol_label = if atr_pct > 5.0 {
        "very high"
    } else if atr_pct > 3.0 {
        "high"
    } else if atr_pct > 2.0 {
        "moderate"
    } else {
        "low"
    };
    p.push_str(&format!(
        "Volatility: ATR14={:.4} ({atr_pct:.2}% — {vol_label})\n",
        lt.atr14
    ));

    if lt.average_volume > 0.0 {
        p.push_str(&format!(
            "Volume: {:.0} ({:.1}x avg)\n",
            lt.current_volume,
            lt.current_volume / lt.average_volume
        ));
    }

    let rsi_label = if md.rsi7 > 70.0 {
        "overbought, reversal risk"
    } else if md.rsi7 > 55.0 {
        "bullish momentum"
    } else if md.rsi7 < 30.0 {
        "oversold, bounce risk"
    } else if md.rsi7 < 45.0 {
        "bearish momentum"
    } else {
        "neutral"
    };
    p.push_str(&format!("RSI7: {:.2} ({rsi_label})\n", md.rsi7));
    p.push_str(&format!(
        "MACD: {:.4} ({})\n",
        md.macd,
        if md.macd > 0.0 { "bullish" } else { "bearish" }
    ));
    p.push_str(&format!(
        "Changes: 1h {:+.2}% | 4h {:+.2}% | 24h {:+.2}%\n",
        md.price_change_1h, md.price_change_4h, md.price_change_24h
    ));
    p.push_str(&format!("FundingRate: {:.4}%\n", md.funding_rate * 100.0));

    // Account risk context only when it can actually bind.
    if let Some(account) = ctx.account {
        if !ctx.positions.is_empty() || account.margin_used_pct > 40.0 {
            p.push_str("\n=== Account ===\n");
            p.push_str(&format!(
                "Balance: {:.1} total | {:.1} available | margin used {:.1}% | positions {}/3\n",
                account.total_equity,
                account.available_balance,
                account.margin_used_pct,
                account.position_count
            ));
            if !ctx.positions.is_empty() {
                let holdings: Vec<String> = ctx
                    .positions
                    .iter()
                    .map(|pos| {
                        format!("{} {} {:+.1}%", pos.symbol, pos.side, pos.unrealized_pnl_pct)
                    })
                    .collect();
                p.push_str(&format!("Holdings: {}\n", holdings.join(" | ")));
            }
        }
    }

    if ctx.sharpe_ratio != 0.0 {
        p.push_str(&format!("\nSystem Sharpe: {:.2}\n", ctx.sharpe_ratio));
    }

    if let Some(ext) = ctx.extended {
        let formatted = crate::core::extended_data::format_extended(ext);
        if !formatted.is_empty() {
            p.push_str(&format!("Extended: {formatted}\n"));
        }
    }

    if let Some(feedback) = ctx.recent_feedback {
        if !feedback.is_empty() {
            p.push_str("\n=== Your recent calls on this symbol ===\n");
            p.push_str(feedback);
            p.push('\n');
        }
    }
    if let Some(perf) = ctx.performance {
        if perf.overall_win_rate > 0.0 {
            p.push_str(&format!(
                "Overall: win_rate={:.1}% | avg_accuracy={:.1}%\n",
                perf.overall_win_rate * 100.0,
                perf.avg_accuracy * 100.0
            ));
        }
    }
    if let Some(digest) = ctx.memory_digest {
        if !digest.is_empty() {
            p.push_str("\n=== Trader memory ===\n");
            p.push_str(digest);
            p.push('\n');
        }
    }

    p.push_str("\nPredict the next move for this symbol. Return JSON only.\n");
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(direction: PredictionDirection, probability: f64) -> Prediction {
        Prediction {
            symbol: "SOLUSDT".into(),
            direction,
            probability,
            expected_move: match direction {
                PredictionDirection::Up => 2.0,
                PredictionDirection::Down => -2.0,
                PredictionDirection::Neutral => 0.2,
            },
            timeframe: Timeframe::H4,
            confidence: confidence_for_probability(probability),
            reasoning: String::new(),
            key_factors: vec![],
            risk_level: RiskLevel::Medium,
            worst_case: match direction {
                PredictionDirection::Down => -4.0,
                _ => -1.5,
            },
            best_case: match direction {
                PredictionDirection::Down => -0.5,
                _ => 4.0,
            },
        }
    }

    #[test]
    fn sign_conflict_is_rejected() {
        // direction up with a negative expected move.
        let mut pred = prediction(PredictionDirection::Up, 0.78);
        pred.expected_move = -1.2;
        let err = validate(&pred).unwrap_err();
        assert!(err.contains("expected_move"));
    }

    #[test]
    fn consistent_up_prediction_passes_with_high_confidence() {
        let mut pred = prediction(PredictionDirection::Up, 0.78);
        pred.expected_move = 2.0;
        pred.worst_case = -1.5;
        pred.best_case = 4.0;
        // 0.78 ≥ 0.75 maps to high.
        assert_eq!(pred.confidence, ConfidenceLevel::High);
        assert!(validate(&pred).is_ok());
    }

    #[test]
    fn down_allows_negative_best_case() {
        let mut pred = prediction(PredictionDirection::Down, 0.8);
        pred.worst_case = -6.0;
        pred.best_case = -1.0;
        assert!(validate(&pred).is_ok());

        pred.best_case = -7.0; // below worst case
        assert!(validate(&pred).is_err());
    }

    #[test]
    fn neutral_caps_probability() {
        let ok = prediction(PredictionDirection::Neutral, 0.6);
        assert!(validate(&ok).is_ok());
        let mut too_confident = prediction(PredictionDirection::Neutral, 0.7);
        too_confident.confidence = confidence_for_probability(0.7);
        assert!(validate(&too_confident).is_err());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut pred = prediction(PredictionDirection::Up, 0.8);
        pred.expected_move = 11.0;
        assert!(validate(&pred).is_err());

        let mut pred = prediction(PredictionDirection::Up, 0.8);
        pred.best_case = 16.0;
        assert!(validate(&pred).is_err());

        let mut pred = prediction(PredictionDirection::Up, 0.8);
        pred.probability = 0.4;
        pred.confidence = confidence_for_probability(0.4);
        assert!(validate(&pred).is_err());
    }

    #[test]
    fn confidence_must_match_probability_exactly() {
        let mut pred = prediction(PredictionDirection::Up, 0.9);
        pred.confidence = ConfidenceLevel::Medium;
        let err = validate(&pred).unwrap_err();
        assert!(err.contains("confidence"));
    }

    #[test]
    fn probability_mapping_boundaries() {
        assert_eq!(confidence_for_probability(0.85), ConfidenceLevel::VeryHigh);
        assert_eq!(confidence_for_probability(0.84), ConfidenceLevel::High);
        assert_eq!(confidence_for_probability(0.75), ConfidenceLevel::High);
        assert_eq!(confidence_for_probability(0.65), ConfidenceLevel::Medium);
        assert_eq!(confidence_for_probability(0.55), ConfidenceLevel::Low);
        assert_eq!(confidence_for_probability(0.54), ConfidenceLevel::VeryLow);
    }

    #[test]
    fn enum_normalization_is_idempotent() {
        for (alias, canonical) in [
            ("bull", "up"),
            ("Long", "up"),
            ("BEAR", "down"),
            ("neutral", "neutral"),
        ] {
            let first = normalize_direction(alias).unwrap();
            let canonical_parsed = normalize_direction(canonical).unwrap();
            assert_eq!(first, canonical_parsed);
            // Normalizing the canonical spelling again changes nothing.
            assert_eq!(normalize_direction(&first.to_string()), Some(first));
        }
        assert_eq!(normalize_confidence("moderate"), Some(ConfidenceLevel::Medium));
        assert_eq!(normalize_confidence("very high"), Some(ConfidenceLevel::VeryHigh));
        assert_eq!(normalize_confidence("Very-Low"), Some(ConfidenceLevel::VeryLow));
        assert_eq!(normalize_timeframe("1hr"), Some(Timeframe::H1));
        assert_eq!(normalize_timeframe("1d"), Some(Timeframe::H24));
        assert_eq!(normalize_risk_level("moderate"), Some(RiskLevel::Medium));
    }

    #[test]
    fn timeframe_defaulter() {
        assert_eq!(default_timeframe(4.5), Timeframe::H1);
        assert_eq!(default_timeframe(0.5), Timeframe::H24);
        assert_eq!(default_timeframe(2.0), Timeframe::H4);
        // Boundaries stay on the 4h default.
        assert_eq!(default_timeframe(4.0), Timeframe::H4);
        assert_eq!(default_timeframe(0.8), Timeframe::H4);
    }

    #[test]
    fn calibration_requires_sample_and_clamps() {
        let small = HistoricalPerformance {
            overall_win_rate: 0.9,
            avg_accuracy: 0.9,
            evaluated_count: 10,
        };
        assert_eq!(calibrate_probability(0.8, Some(&small)), 0.8);

        let strong = HistoricalPerformance {
            overall_win_rate: 0.7,
            avg_accuracy: 0.7, // multiplier 1.4 clamps to 1.2
            evaluated_count: 40,
        };
        assert!((calibrate_probability(0.7, Some(&strong)) - 0.84).abs() < 1e-9);

        let weak = HistoricalPerformance {
            overall_win_rate: 0.3,
            avg_accuracy: 0.3, // multiplier 0.6 clamps to 0.8
            evaluated_count: 40,
        };
        assert!((calibrate_probability(0.7, Some(&weak)) - 0.56).abs() < 1e-9);

        // Never leaves the probability window.
        assert_eq!(calibrate_probability(0.95, Some(&strong)), 1.0);
        assert_eq!(calibrate_probability(0.5, Some(&weak)), 0.5);
    }
}
