//! Value types flowing through the staged decision pipeline.
//!
//! Each stage's output is a plain value; enums are closed sets and every
//! model-supplied field passes through normalization before it can become
//! one of these types.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Market regime label for the BTC 4h context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    /// Uptrend: price > EMA50 > EMA200.
    A1,
    /// Downtrend: price < EMA50 < EMA200.
    A2,
    /// Wide range.
    B,
    /// Narrow range, no trading.
    C,
}

impl Regime {
    /// The strategy each regime prescribes — the deterministic ground truth
    /// the model's answer is checked against.
    pub fn strategy(self) -> Strategy {
        match self {
            Regime::A1 => Strategy::LongOnly,
            Regime::A2 => Strategy::ShortOnly,
            Regime::B => Strategy::Range,
            Regime::C => Strategy::Wait,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::A1 => "A1",
            Regime::A2 => "A2",
            Regime::B => "B",
            Regime::C => "C",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LongOnly,
    ShortOnly,
    Range,
    Wait,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::LongOnly => "long_only",
            Strategy::ShortOnly => "short_only",
            Strategy::Range => "range",
            Strategy::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// Regime stage output, carrying the numeric inputs it depended on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeResult {
    pub regime: Regime,
    pub atr_pct: f64,
    /// 0–100.
    pub confidence: u8,
    pub strategy: Strategy,
    pub reasoning: String,
    pub price: f64,
    pub ema50: f64,
    pub ema200: f64,
    pub atr14: f64,
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Long,
    Short,
    None,
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalDirection::Long => "long",
            SignalDirection::Short => "short",
            SignalDirection::None => "none",
        };
        f.write_str(s)
    }
}

/// Trade scenario derived deterministically from (regime, direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Breakout,
    Pullback,
    Range,
    Countertrend,
    Trend,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scenario::Breakout => "breakout",
            Scenario::Pullback => "pullback",
            Scenario::Range => "range",
            Scenario::Countertrend => "countertrend",
            Scenario::Trend => "trend",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    High,
    Medium,
    Low,
}

/// Signal stage output. `score`, `confidence` and `valid` are always the
/// code-recomputed values, never the model's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResult {
    pub symbol: String,
    pub direction: SignalDirection,
    pub signal_list: Vec<String>,
    pub score: i32,
    pub confidence: SignalTier,
    pub scenario: Scenario,
    pub valid: bool,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionDirection {
    Up,
    Down,
    Neutral,
}

impl fmt::Display for PredictionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PredictionDirection::Up => "up",
            PredictionDirection::Down => "down",
            PredictionDirection::Neutral => "neutral",
        };
        f.write_str(s)
    }
}

/// Five-level confidence scale shared across the prediction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// One tier lower, saturating at the bottom.
    pub fn demoted(self) -> Self {
        match self {
            ConfidenceLevel::VeryHigh => ConfidenceLevel::High,
            ConfidenceLevel::High => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium => ConfidenceLevel::Low,
            ConfidenceLevel::Low | ConfidenceLevel::VeryLow => ConfidenceLevel::VeryLow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "24h")]
    H24,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H24 => "24h",
        };
        f.write_str(s)
    }
}

/// Prediction stage output, fully validated and post-processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub symbol: String,
    pub direction: PredictionDirection,
    /// [0.5, 1.0] after calibration.
    pub probability: f64,
    /// Expected move, percent, sign-consistent with `direction`.
    pub expected_move: f64,
    pub timeframe: Timeframe,
    pub confidence: ConfidenceLevel,
    pub reasoning: String,
    pub key_factors: Vec<String>,
    pub risk_level: RiskLevel,
    /// Percent; strictly below `best_case`.
    pub worst_case: f64,
    pub best_case: f64,
}

/// Aggregate of evaluated predictions, consumed for calibration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HistoricalPerformance {
    pub overall_win_rate: f64,
    pub avg_accuracy: f64,
    pub evaluated_count: usize,
}

// ---------------------------------------------------------------------------
// Market intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Accumulation,
    Markup,
    Distribution,
    Markdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStrength {
    StrongUp,
    WeakUp,
    Neutral,
    WeakDown,
    StrongDown,
}

/// Deterministic BTC technical backdrop handed to the intelligence model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcContext {
    pub price: f64,
    pub change_15m: f64,
    pub change_30m: f64,
    pub change_1h: f64,
    pub change_4h: f64,
    pub atr_percent: f64,
    pub volatility: VolatilityLevel,
    pub trend_strength: TrendStrength,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketIntelligence {
    pub market_phase: MarketPhase,
    pub key_risks: Vec<String>,
    pub key_opportunities: Vec<String>,
    pub summary: String,
    pub btc: BtcContext,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Risk stage output. All numerics are code-computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub leverage: u32,
    /// Notional position size in quote currency.
    pub position_size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    pub liquidation_price: f64,
    pub risk_percent: f64,
    pub reward_percent: f64,
    pub valid: bool,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Position management
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseAction {
    Hold,
    CloseLong,
    CloseShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ExtremeReversal,
    LossExpansion,
    RegimeReversal,
    TargetReached,
    SignalDisappeared,
    BreathingRoom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDecision {
    pub symbol: String,
    pub action: CloseAction,
    pub reason: Option<CloseReason>,
    pub forced_stop_loss: bool,
    /// 0–100.
    pub confidence: u8,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Account context
// ---------------------------------------------------------------------------

/// Account snapshot handed to the prediction stage for risk calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_strategy_table() {
        assert_eq!(Regime::A1.strategy(), Strategy::LongOnly);
        assert_eq!(Regime::A2.strategy(), Strategy::ShortOnly);
        assert_eq!(Regime::B.strategy(), Strategy::Range);
        assert_eq!(Regime::C.strategy(), Strategy::Wait);
    }

    #[test]
    fn confidence_demotion_saturates() {
        assert_eq!(ConfidenceLevel::VeryHigh.demoted(), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::VeryLow.demoted(), ConfidenceLevel::VeryLow);
    }

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&SignalDirection::Long).unwrap(),
            r#""long""#
        );
        assert_eq!(serde_json::to_string(&Timeframe::H24).unwrap(), r#""24h""#);
        assert_eq!(
            serde_json::to_string(&ConfidenceLevel::VeryHigh).unwrap(),
            r#""very_high""#
        );
        assert_eq!(serde_json::to_string(&Regime::A1).unwrap(), r#""A1""#);
    }
}
