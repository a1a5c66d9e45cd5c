//! Position-management stage: hold or close each open position.
//!
//! Three steps. The forced-close tier is recomputed in code and overrides
//! the model in both directions: a missed forced trigger becomes a close,
//! and a non-forced close inside the breathing-room window becomes a hold.
//! The mature evaluation is model-led but its action and reason tags are
//! validated against the position.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::constants::*;
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{
    CloseAction, CloseReason, MarketData, Position, PositionDecision, PositionSide, Regime,
    RegimeResult,
};

const STAGE: &str = "position";

/// A hard condition that closes regardless of hold time.
#[derive(Debug, Clone)]
pub(crate) struct ForcedTrigger {
    pub reason: CloseReason,
    pub description: String,
}

/// Code-side forced-close detection: extreme RSI against the position, deep
/// loss, or the regime flipping against it.
pub(crate) fn forced_close_trigger(
    position: &Position,
    data: &MarketData,
    regime: &RegimeResult,
) -> Option<ForcedTrigger> {
    match position.side {
        PositionSide::Short if data.rsi7 > FORCED_RSI_SHORT_EXIT => {
            return Some(ForcedTrigger {
                reason: CloseReason::ExtremeReversal,
                description: format!("short squeezed: RSI7 {:.1} > {FORCED_RSI_SHORT_EXIT}", data.rsi7),
            });
        }
        PositionSide::Long if data.rsi7 > 0.0 && data.rsi7 < FORCED_RSI_LONG_EXIT => {
            return Some(ForcedTrigger {
                reason: CloseReason::ExtremeReversal,
                description: format!("long flushed: RSI7 {:.1} < {FORCED_RSI_LONG_EXIT}", data.rsi7),
            });
        }
        _ => {}
    }

    if position.unrealized_pnl_pct < FORCED_LOSS_PCT {
        return Some(ForcedTrigger {
            reason: CloseReason::LossExpansion,
            description: format!(
                "unrealized {:.1}% below {FORCED_LOSS_PCT}%",
                position.unrealized_pnl_pct
            ),
        });
    }

    let flipped = matches!(
        (position.side, regime.regime),
        (PositionSide::Short, Regime::A1) | (PositionSide::Long, Regime::A2)
    );
    if flipped {
        return Some(ForcedTrigger {
            reason: CloseReason::RegimeReversal,
            description: format!("regime flipped to {} against the {}", regime.regime, position.side),
        });
    }

    None
}

pub(crate) fn held_minutes(position: &Position, now: DateTime<Utc>) -> i64 {
    (now - position.open_time).num_minutes()
}

fn close_action_for(side: PositionSide) -> CloseAction {
    match side {
        PositionSide::Long => CloseAction::CloseLong,
        PositionSide::Short => CloseAction::CloseShort,
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    symbol: String,
    action: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    forced_stop_loss: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: i64,
}

pub struct PositionAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
}

impl PositionAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(),
        }
    }

    pub async fn evaluate(
        &self,
        position: &Position,
        data: &MarketData,
        regime: &RegimeResult,
    ) -> Result<PositionDecision, EngineError> {
        let now = Utc::now();
        let forced = forced_close_trigger(position, data, regime);
        let minutes_held = held_minutes(position, now);

        let user_prompt = build_user_prompt(position, data, regime, minutes_held);
        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;

        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        let raw: RawDecision = serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))?;

        let action = parse_action(&raw.action)
            .ok_or_else(|| EngineError::contract(STAGE, format!("unknown action {:?}", raw.action)))?;
        let reason = if raw.reason.trim().is_empty() {
            None
        } else {
            Some(parse_reason(&raw.reason).ok_or_else(|| {
                EngineError::contract(STAGE, format!("unknown reason {:?}", raw.reason))
            })?)
        };

        // Action must match the side it claims to close.
        match (action, position.side) {
            (CloseAction::CloseLong, PositionSide::Short) => {
                return Err(EngineError::contract(STAGE, "close_long on a short position"));
            }
            (CloseAction::CloseShort, PositionSide::Long) => {
                return Err(EngineError::contract(STAGE, "close_short on a long position"));
            }
            _ => {}
        }

        let mut decision = PositionDecision {
            symbol: if raw.symbol.is_empty() {
                position.symbol.clone()
            } else {
                raw.symbol
            },
            action,
            reason,
            forced_stop_loss: raw.forced_stop_loss,
            confidence: raw.confidence.clamp(0, 100) as u8,
            reasoning: raw.reasoning,
        };

        // Overrides, code truth first.
        if let Some(trigger) = forced {
            if decision.action == CloseAction::Hold {
                debug!(symbol = %position.symbol, %trigger.description, "forcing close over model hold");
                decision.action = close_action_for(position.side);
                decision.confidence = 100;
            }
            decision.reason = Some(trigger.reason);
            decision.forced_stop_loss = true;
            if !decision.reasoning.is_empty() {
                decision.reasoning.push_str(" | ");
            }
            decision.reasoning.push_str("forced: ");
            decision.reasoning.push_str(&trigger.description);
        } else if minutes_held < BREATHING_ROOM_MINUTES && decision.action != CloseAction::Hold {
            debug!(symbol = %position.symbol, minutes_held, "breathing room holds the position");
            decision.action = CloseAction::Hold;
            decision.reason = Some(CloseReason::BreathingRoom);
            decision.forced_stop_loss = false;
            if !decision.reasoning.is_empty() {
                decision.reasoning.push_str(" | ");
            }
            decision
                .reasoning
                .push_str("held under 30 minutes with no forced trigger");
        }

        Ok(decision)
    }
}

fn parse_action(value: &str) -> Option<CloseAction> {
    match value.trim().to_lowercase().as_str() {
        "hold" => Some(CloseAction::Hold),
        "close_long" => Some(CloseAction::CloseLong),
        "close_short" => Some(CloseAction::CloseShort),
        _ => None,
    }
}

fn parse_reason(value: &str) -> Option<CloseReason> {
    match value.trim().to_lowercase().as_str() {
        "extreme_reversal" => Some(CloseReason::ExtremeReversal),
        "loss_expansion" => Some(CloseReason::LossExpansion),
        "regime_reversal" => Some(CloseReason::RegimeReversal),
        "target_reached" => Some(CloseReason::TargetReached),
        "signal_disappeared" => Some(CloseReason::SignalDisappeared),
        "breathing_room" => Some(CloseReason::BreathingRoom),
        _ => None,
    }
}

fn build_system_prompt() -> String {
    let mut p = String::new();
    p.push_str("You are a position manager deciding hold vs close.\n\n");
    p.push_str("# Step 1 — forced close (any hold time)\n");
    p.push_str("- short with RSI7 > 75: squeezed, close now\n");
    p.push_str("- long with RSI7 < 25: flushed, close now\n");
    p.push_str("- unrealized PnL below -10%: wrong entry, stop now\n");
    p.push_str("- regime flipped against the position (short in A1 / long in A2): close now\n\n");
    p.push_str("# Step 2 — breathing room\n");
    p.push_str("Held under 30 minutes with no forced trigger: HOLD. Small profits, small\n");
    p.push_str("wiggles and minor RSI drift are not close reasons inside this window.\n\n");
    p.push_str("# Step 3 — mature evaluation (held 30+ minutes)\n");
    p.push_str("- profit ≥ 20%: take it unconditionally\n");
    p.push_str("- profit ≥ 15% and the regime shifted to range or the outlook turned neutral: take it\n");
    p.push_str("- profit ≥ 10% and the entry signal decayed or reversed: take it\n");
    p.push_str("- loss below -8%: stop\n");
    p.push_str("- close on thesis death only: the original entry rationale must be fully gone\n\n");
    p.push_str("Output pure JSON:\n");
    p.push_str("{\"symbol\":\"SOLUSDT\",\"action\":\"hold|close_long|close_short\",");
    p.push_str("\"reason\":\"extreme_reversal|loss_expansion|regime_reversal|target_reached|signal_disappeared|breathing_room\",");
    p.push_str("\"forced_stop_loss\":false,\"reasoning\":\"...\",\"confidence\":0}\n");
    p
}

fn build_user_prompt(
    position: &Position,
    data: &MarketData,
    regime: &RegimeResult,
    minutes_held: i64,
) -> String {
    let mut p = String::from("# Position\n");
    p.push_str(&format!(
        "{} {} | entry {:.4} | mark {:.4} | {}x | unrealized {:+.2}% | held {}m\n",
        position.symbol,
        position.side,
        position.entry_price,
        position.mark_price,
        position.leverage,
        position.unrealized_pnl_pct,
        minutes_held
    ));
    p.push_str("\n# Market\n");
    p.push_str(&format!(
        "regime: {} ({}) | RSI7: {:.2} | MACD: {:.4} | Δ1h: {:+.2}%\n",
        regime.regime, regime.strategy, data.rsi7, data.macd, data.price_change_1h
    ));
    p.push_str("\nRun the three steps and output the JSON.\n");
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntradaySeries, LongerTermContext, OpenInterest};

    fn position(side: PositionSide, pnl_pct: f64) -> Position {
        Position {
            symbol: "SOLUSDT".into(),
            side,
            entry_price: 100.0,
            mark_price: 100.0 + pnl_pct / 10.0,
            quantity: 10.0,
            leverage: 10,
            unrealized_pnl: pnl_pct,
            unrealized_pnl_pct: pnl_pct,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            liquidation_price: 90.5,
            margin_used: 100.0,
        }
    }

    fn market(rsi7: f64) -> MarketData {
        MarketData {
            symbol: "SOLUSDT".into(),
            current_price: 100.0,
            price_change_15m: 0.0,
            price_change_30m: 0.0,
            price_change_1h: 0.0,
            price_change_4h: 0.0,
            price_change_24h: 0.0,
            ema20: 100.0,
            macd: 0.0,
            macd_signal: 0.0,
            rsi7,
            rsi14: 50.0,
            open_interest: OpenInterest::default(),
            funding_rate: 0.0,
            intraday: IntradaySeries::default(),
            longer_term: LongerTermContext::default(),
            fetched_at: Utc::now(),
        }
    }

    fn regime_of(regime: Regime) -> RegimeResult {
        RegimeResult {
            regime,
            atr_pct: 1.5,
            confidence: 90,
            strategy: regime.strategy(),
            reasoning: String::new(),
            price: 100.0,
            ema50: 100.0,
            ema200: 100.0,
            atr14: 1.5,
        }
    }

    #[test]
    fn short_squeeze_forces_close() {
        let trigger = forced_close_trigger(
            &position(PositionSide::Short, -2.0),
            &market(80.2),
            &regime_of(Regime::A2),
        )
        .expect("forced");
        assert_eq!(trigger.reason, CloseReason::ExtremeReversal);
    }

    #[test]
    fn long_flush_forces_close() {
        let trigger = forced_close_trigger(
            &position(PositionSide::Long, -3.0),
            &market(22.0),
            &regime_of(Regime::A1),
        )
        .expect("forced");
        assert_eq!(trigger.reason, CloseReason::ExtremeReversal);
    }

    #[test]
    fn deep_loss_forces_close() {
        let trigger = forced_close_trigger(
            &position(PositionSide::Long, -12.0),
            &market(50.0),
            &regime_of(Regime::A1),
        )
        .expect("forced");
        assert_eq!(trigger.reason, CloseReason::LossExpansion);
    }

    #[test]
    fn regime_flip_forces_close() {
        // Short opened in A2; regime now reads A1.
        let trigger = forced_close_trigger(
            &position(PositionSide::Short, 1.0),
            &market(50.0),
            &regime_of(Regime::A1),
        )
        .expect("forced");
        assert_eq!(trigger.reason, CloseReason::RegimeReversal);

        // Long in A2 mirrors.
        let trigger = forced_close_trigger(
            &position(PositionSide::Long, 1.0),
            &market(50.0),
            &regime_of(Regime::A2),
        )
        .expect("forced");
        assert_eq!(trigger.reason, CloseReason::RegimeReversal);
    }

    #[test]
    fn healthy_position_has_no_trigger() {
        assert!(forced_close_trigger(
            &position(PositionSide::Long, 4.0),
            &market(55.0),
            &regime_of(Regime::A1),
        )
        .is_none());
        // Boundary: RSI exactly at the threshold does not fire.
        assert!(forced_close_trigger(
            &position(PositionSide::Short, 0.0),
            &market(75.0),
            &regime_of(Regime::A2),
        )
        .is_none());
        // Loss exactly at -10% does not fire either.
        assert!(forced_close_trigger(
            &position(PositionSide::Long, -10.0),
            &market(50.0),
            &regime_of(Regime::A1),
        )
        .is_none());
    }

    #[test]
    fn action_and_reason_parsing() {
        assert_eq!(parse_action("HOLD"), Some(CloseAction::Hold));
        assert_eq!(parse_action("close_short"), Some(CloseAction::CloseShort));
        assert_eq!(parse_action("exit"), None);
        assert_eq!(parse_reason("target_reached"), Some(CloseReason::TargetReached));
        assert_eq!(parse_reason("bored"), None);
    }

    #[test]
    fn held_minutes_from_open_time() {
        let mut pos = position(PositionSide::Long, 0.0);
        let now = Utc::now();
        pos.open_time = now - chrono::Duration::minutes(42);
        assert_eq!(held_minutes(&pos, now), 42);
    }
}
