//! Signal stage: five-dimension confluence detection per candidate symbol.
//!
//! The model proposes a direction and its reasoning; every dimension is then
//! re-verified in code against the market snapshot, and the score, tier and
//! validity flag are recomputed from the audited count. The pullback
//! scenario additionally requires its position-confirmation chain to hold,
//! otherwise the signal is forced invalid regardless of the model's answer.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::constants::*;
use crate::errors::EngineError;
use crate::llm_client::{extract_json, LlmClient};
use crate::types::{
    MarketData, Regime, RegimeResult, Scenario, SignalDirection, SignalResult, SignalTier,
};

const STAGE: &str = "signal";

/// Deterministic scenario selection from (regime, direction).
pub fn scenario_for(regime: Regime, direction: SignalDirection) -> Scenario {
    match (regime, direction) {
        (Regime::A1, SignalDirection::Long) => Scenario::Breakout,
        (Regime::A1, SignalDirection::Short) => Scenario::Countertrend,
        (Regime::A2, SignalDirection::Short) => Scenario::Pullback,
        (Regime::A2, SignalDirection::Long) => Scenario::Countertrend,
        (Regime::B, _) => Scenario::Range,
        _ => Scenario::Trend,
    }
}

/// Result of the code-side re-verification of the five dimensions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SignalAudit {
    pub dimensions: usize,
    pub scenario: Scenario,
    pub pullback_confirmed: bool,
}

/// Re-verify every dimension the model may have claimed.
pub(crate) fn audit_signals(
    data: &MarketData,
    regime: &RegimeResult,
    direction: SignalDirection,
) -> SignalAudit {
    let mut audit = SignalAudit {
        dimensions: 0,
        scenario: Scenario::Trend,
        pullback_confirmed: true,
    };

    if direction == SignalDirection::None {
        return audit;
    }
    audit.scenario = scenario_for(regime.regime, direction);

    // Dimension 1: regime match.
    let regime_match = match direction {
        SignalDirection::Long => matches!(regime.regime, Regime::A1 | Regime::B),
        SignalDirection::Short => matches!(regime.regime, Regime::A2 | Regime::B),
        SignalDirection::None => false,
    };
    if regime_match {
        audit.dimensions += 1;
    }

    match audit.scenario {
        Scenario::Pullback => {
            let rsi_confirmed = check_rsi_overbought_return(data);
            let position_confirmed = check_pullback_position(data);
            audit.pullback_confirmed = rsi_confirmed && position_confirmed;

            if audit.pullback_confirmed {
                // Momentum and position confirmed together.
                audit.dimensions += 2;
                if check_pullback_volume(data) {
                    audit.dimensions += 1;
                }
                if check_funding(direction, data) {
                    audit.dimensions += 1;
                }
            }
        }
        Scenario::Countertrend => {
            if direction == SignalDirection::Long && regime.regime == Regime::A2 {
                // Deep oversold is the core condition and counts double.
                if data.rsi7 > 0.0 && data.rsi7 <= COUNTERTREND_RSI_THRESHOLD {
                    audit.dimensions += 2;
                }
                if check_funding(direction, data) {
                    audit.dimensions += 1;
                }
                if check_volume_expansion(data) {
                    audit.dimensions += 1;
                }
            } else {
                // Shorting into an uptrend stays unsupported.
                audit.dimensions = 0;
            }
        }
        _ => {
            if check_momentum(direction, data) {
                audit.dimensions += 1;
            }
            if check_position(direction, data) {
                audit.dimensions += 1;
            }
            if check_volume_expansion(data) {
                audit.dimensions += 1;
            }
            if check_funding(direction, data) {
                audit.dimensions += 1;
            }
        }
    }

    audit
}

/// Score recomputed from the audited dimension count; the model's score is
/// discarded.
pub(crate) fn calculate_score(
    dimensions: usize,
    direction: SignalDirection,
    regime: &RegimeResult,
) -> i32 {
    let mut score = SIGNAL_BASE_SCORE + SIGNAL_PER_DIMENSION_SCORE * dimensions as i32;
    let primary_side = matches!(
        (direction, regime.regime),
        (SignalDirection::Long, Regime::A1) | (SignalDirection::Short, Regime::A2)
    );
    if primary_side {
        score += SIGNAL_PERFECT_BONUS;
    }
    score.clamp(0, 100)
}

pub(crate) fn tier_for_score(score: i32) -> SignalTier {
    if score >= 90 {
        SignalTier::High
    } else if score >= 80 {
        SignalTier::Medium
    } else {
        SignalTier::Low
    }
}

// ---------------------------------------------------------------------------
// Dimension checks
// ---------------------------------------------------------------------------

fn check_momentum(direction: SignalDirection, data: &MarketData) -> bool {
    match direction {
        SignalDirection::Long => data.macd > 0.0 || recovered_from_oversold(data),
        SignalDirection::Short => data.macd < 0.0 || cooled_from_overbought(data),
        SignalDirection::None => false,
    }
}

fn check_position(direction: SignalDirection, data: &MarketData) -> bool {
    let ema20 = data.ema20;
    if ema20 <= 0.0 {
        return false;
    }
    match direction {
        SignalDirection::Long => data.current_price >= ema20 * (1.0 - EMA20_TOLERANCE_PCT),
        SignalDirection::Short => data.current_price <= ema20 * (1.0 + EMA20_TOLERANCE_PCT),
        SignalDirection::None => false,
    }
}

/// Long reversal: dipped below 30 within the lookback and recovered above 35.
fn recovered_from_oversold(data: &MarketData) -> bool {
    if data.rsi7 <= RSI_OVERSOLD_RECOVERY {
        return false;
    }
    let series = &data.intraday.rsi7;
    let lookback = series.len().min(RSI_LOOKBACK_BARS);
    series[series.len() - lookback..]
        .iter()
        .any(|&v| v > 0.0 && v < RSI_OVERSOLD)
}

/// Short reversal: peaked above 70 within the lookback and cooled below 65.
fn cooled_from_overbought(data: &MarketData) -> bool {
    if data.rsi7 >= RSI_COOLED {
        return false;
    }
    let series = &data.intraday.rsi7;
    let lookback = series.len().min(RSI_LOOKBACK_BARS);
    series[series.len() - lookback..]
        .iter()
        .any(|&v| v > RSI_OVERBOUGHT)
}

/// Pullback momentum leg: a significant overbought peak, recent, now cooled.
fn check_rsi_overbought_return(data: &MarketData) -> bool {
    if data.rsi7 >= RSI_COOLED {
        return false;
    }
    let series = &data.intraday.rsi7;
    if series.is_empty() {
        return false;
    }

    let lookback = series.len().min(RSI_LOOKBACK_BARS);
    let window = &series[series.len() - lookback..];
    let (max_offset, max_rsi) = window
        .iter()
        .enumerate()
        .fold((0usize, f64::MIN), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });

    if max_rsi < RSI_PEAK_SIGNIFICANT {
        return false;
    }
    // The peak must be close enough to still describe this rebound.
    window.len() - 1 - max_offset <= RSI_PEAK_MAX_DISTANCE
}

/// Pullback position leg: rebound reached the 4h band, then confirmed back
/// below the short-timeframe EMA20.
fn check_pullback_position(data: &MarketData) -> bool {
    let ema20 = data.ema20;
    if ema20 <= 0.0 {
        return false;
    }

    // Condition 1: price already back below the short EMA20.
    if data.current_price > ema20 * (1.0 - EMA20_TOLERANCE_PCT) {
        return false;
    }
    // Condition 2: enough consecutive closes below it, after a real rebound.
    if !confirmed_below_short_ema(data, ema20) {
        return false;
    }
    // Condition 3: the rebound actually touched the 4h resistance band.
    touched_four_hour_band(data)
}

fn confirmed_below_short_ema(data: &MarketData, ema20: f64) -> bool {
    let prices = &data.intraday.mid_prices;
    if prices.is_empty() {
        return false;
    }

    let required = prices.len().min(PULLBACK_CONFIRM_BARS);
    let mut overshoot = ema20 * PULLBACK_MIN_OVERSHOOT_PCT;
    if data.longer_term.atr14 > 0.0 {
        overshoot = overshoot.max(data.longer_term.atr14 * PULLBACK_MIN_OVERSHOOT_ATR);
    }
    let upper_threshold = ema20 + overshoot;
    let lower_threshold = ema20 * (1.0 - EMA20_TOLERANCE_PCT);

    let confirm_start = prices.len() - required;
    let mut above_seen = false;
    for &price in &prices[confirm_start..] {
        if price >= upper_threshold {
            above_seen = true;
        }
        if price > lower_threshold {
            return false; // still rebounding, not confirmed
        }
    }

    if !above_seen {
        // The rebound peak usually precedes the confirmation window.
        let lookback = confirm_start.min(PULLBACK_REBOUND_LOOKBACK);
        above_seen = prices[confirm_start - lookback..confirm_start]
            .iter()
            .any(|&p| p >= upper_threshold);
    }

    above_seen
}

fn touched_four_hour_band(data: &MarketData) -> bool {
    let ema20_4h = data.longer_term.ema20;
    let ema50_4h = data.longer_term.ema50;
    let atr = data.longer_term.atr14;
    if ema20_4h <= 0.0 || ema50_4h <= 0.0 || atr <= 0.0 {
        return false;
    }

    let band_low = ema20_4h.min(ema50_4h);
    let required_overshoot = (band_low * PULLBACK_MIN_OVERSHOOT_PCT).max(atr * PULLBACK_MIN_OVERSHOOT_ATR);
    let resistance_floor = band_low + required_overshoot;

    let prices = &data.intraday.mid_prices;
    if prices.is_empty() {
        return false;
    }
    let lookback = prices.len().min(PULLBACK_BAND_LOOKBACK);
    let max_price = prices[prices.len() - lookback..]
        .iter()
        .fold(f64::MIN, |acc, &p| acc.max(p));

    max_price >= resistance_floor
}

fn check_volume_expansion(data: &MarketData) -> bool {
    matches!(data.volume_change_pct(), Some(change) if change >= VOLUME_EXPAND_THRESHOLD)
}

/// The confirmed pullback accepts either expansion or a dried-up rebound.
fn check_pullback_volume(data: &MarketData) -> bool {
    match data.volume_change_pct() {
        Some(change) => change >= VOLUME_EXPAND_THRESHOLD || change <= VOLUME_SHRINK_THRESHOLD,
        None => false,
    }
}

fn check_funding(direction: SignalDirection, data: &MarketData) -> bool {
    let funding_pct = data.funding_rate * 100.0;
    match direction {
        SignalDirection::Long => funding_pct < 0.0,
        SignalDirection::Short => funding_pct > FUNDING_RATE_SHORT_THRESHOLD,
        SignalDirection::None => false,
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(default)]
    symbol: String,
    direction: String,
    #[serde(default)]
    signal_list: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    score: i64,
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    reasoning: String,
}

pub struct SignalAgent {
    llm: Arc<LlmClient>,
    system_prompt: String,
}

impl SignalAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(),
        }
    }

    pub async fn detect(
        &self,
        symbol: &str,
        data: &MarketData,
        regime: &RegimeResult,
    ) -> Result<SignalResult, EngineError> {
        let user_prompt = build_user_prompt(symbol, data, regime);
        let response = self.llm.call(&self.system_prompt, &user_prompt).await?;

        let json = extract_json(&response)
            .ok_or_else(|| EngineError::contract(STAGE, "no JSON object in response"))?;
        let raw: RawSignal = serde_json::from_str(json)
            .map_err(|e| EngineError::contract(STAGE, format!("malformed JSON: {e}")))?;

        let direction = parse_direction(&raw.direction).ok_or_else(|| {
            EngineError::contract(STAGE, format!("unknown direction {:?}", raw.direction))
        })?;

        let audit = audit_signals(data, regime, direction);
        let score = calculate_score(audit.dimensions, direction, regime);

        let mut reasoning = raw.reasoning;
        let mut valid = audit.dimensions >= SIGNAL_MIN_DIMENSIONS && direction != SignalDirection::None;
        let _ = raw.valid; // the model's own verdict is never trusted

        if regime.regime == Regime::C && direction != SignalDirection::None {
            valid = false;
            push_note(&mut reasoning, "audit: regime C forbids entries");
        }
        if audit.scenario == Scenario::Pullback && !audit.pullback_confirmed {
            valid = false;
            push_note(&mut reasoning, "audit: pullback not confirmed, waiting for closes");
        }

        debug!(
            symbol,
            %direction,
            scenario = %audit.scenario,
            dimensions = audit.dimensions,
            score,
            valid,
            "signal audited"
        );

        Ok(SignalResult {
            symbol: if raw.symbol.is_empty() {
                symbol.to_string()
            } else {
                raw.symbol
            },
            direction: if regime.regime == Regime::C {
                SignalDirection::None
            } else {
                direction
            },
            signal_list: raw.signal_list,
            score,
            confidence: tier_for_score(score),
            scenario: audit.scenario,
            valid,
            reasoning,
        })
    }
}

fn parse_direction(value: &str) -> Option<SignalDirection> {
    match value.trim().to_lowercase().as_str() {
        "long" => Some(SignalDirection::Long),
        "short" => Some(SignalDirection::Short),
        "none" => Some(SignalDirection::None),
        _ => None,
    }
}

fn push_note(reasoning: &mut String, note: &str) {
    if !reasoning.is_empty() {
        reasoning.push_str(" | ");
    }
    reasoning.push_str(note);
}

fn build_system_prompt() -> String {
    let mut p = String::new();
    p.push_str("You are a trade-signal analyst checking multi-dimension confluence.\n\n");
    p.push_str("# Five dimensions\n\n");
    p.push_str("1. Regime match — long only in A1 uptrend or B range; short only in A2 downtrend or B range.\n");
    p.push_str("2. Momentum — long: MACD > 0, or RSI7 dipped below 30 recently and recovered above 35; ");
    p.push_str("short: MACD < 0, or RSI7 peaked above 70 and cooled below 65.\n");
    p.push_str("3. Position — long: price holding the short-timeframe EMA20 from above; ");
    p.push_str("A2 pullback short: the rebound high must have touched the 4h EMA20–EMA50 resistance band AND ");
    p.push_str("at least two consecutive hourly closes are back below the 1h EMA20.\n");
    p.push_str("4. Volume — trend/range entries need expansion of at least +20% vs average; ");
    p.push_str("a confirmed pullback short also accepts shrink below -50%.\n");
    p.push_str("5. Funding — long favored when funding < 0; short favored when funding > +0.01%.\n\n");
    p.push_str("# Rules\n");
    p.push_str("Walk each dimension with the numbers, list only the dimensions that truly hold, ");
    p.push_str("and require at least 3 for a valid signal. Regime C means direction \"none\".\n\n");
    p.push_str("Output pure JSON:\n");
    p.push_str("{\"symbol\":\"XXX\",\"direction\":\"short|long|none\",\"signal_list\":[],\"score\":0,");
    p.push_str("\"valid\":true,\"reasoning\":\"dim1(...) | dim2(...) | dim3(...) | dim4(...) | dim5(...)\"}\n");
    p
}

fn build_user_prompt(symbol: &str, data: &MarketData, regime: &RegimeResult) -> String {
    let mut p = format!("# Symbol: {symbol}\n\n");
    p.push_str(&format!(
        "price: {:.4} | RSI7: {:.2} | MACD: {:.4} | EMA20(short tf): {:.4}\n",
        data.current_price, data.rsi7, data.macd, data.ema20
    ));
    p.push_str(&format!(
        "4h: EMA20={:.4} EMA50={:.4} EMA200={:.4} | ATR14={:.4}\n",
        data.longer_term.ema20, data.longer_term.ema50, data.longer_term.ema200, data.longer_term.atr14
    ));
    p.push_str(&format!(
        "price change: 1h={:+.2}% 4h={:+.2}%\n",
        data.price_change_1h, data.price_change_4h
    ));
    if let Some(change) = data.volume_change_pct() {
        p.push_str(&format!("volume change: {change:+.2}%\n"));
    }
    p.push_str(&format!(
        "OI: {:.0} | funding: {:.4}%\n",
        data.open_interest.latest,
        data.funding_rate * 100.0
    ));
    p.push_str(&format!("\nregime: {} ({})\n", regime.regime, regime.strategy));
    p.push_str("\nAudit the five dimensions and output the JSON.\n");
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntradaySeries, LongerTermContext, OpenInterest};
    use chrono::Utc;

    fn base_data(symbol: &str) -> MarketData {
        MarketData {
            symbol: symbol.into(),
            current_price: 100.0,
            price_change_15m: 0.0,
            price_change_30m: 0.0,
            price_change_1h: 0.0,
            price_change_4h: 0.0,
            price_change_24h: 0.0,
            ema20: 100.0,
            macd: 0.0,
            macd_signal: 0.0,
            rsi7: 50.0,
            rsi14: 50.0,
            open_interest: OpenInterest { latest: 1_000_000.0 },
            funding_rate: 0.0,
            intraday: IntradaySeries::default(),
            longer_term: LongerTermContext::default(),
            fetched_at: Utc::now(),
        }
    }

    fn a2_regime() -> RegimeResult {
        RegimeResult {
            regime: Regime::A2,
            atr_pct: 1.04,
            confidence: 95,
            strategy: Regime::A2.strategy(),
            reasoning: String::new(),
            price: 110_540.0,
            ema50: 110_821.0,
            ema200: 113_297.0,
            atr14: 1_150.0,
        }
    }

    fn regime_of(regime: Regime) -> RegimeResult {
        RegimeResult {
            regime,
            atr_pct: 2.0,
            confidence: 90,
            strategy: regime.strategy(),
            reasoning: String::new(),
            price: 100.0,
            ema50: 100.0,
            ema200: 100.0,
            atr14: 2.0,
        }
    }

    /// An A2 short where the rebound touched the 4h band and price has
    /// confirmed back below the short EMA20.
    fn confirmed_pullback_data() -> MarketData {
        let mut data = base_data("OPUSDT");
        data.ema20 = 100.0;
        data.current_price = 99.0;
        data.macd = -0.5;
        data.rsi7 = 58.0;
        data.funding_rate = 0.0002; // 0.02%

        data.longer_term = LongerTermContext {
            ema20: 104.0,
            ema50: 106.0,
            ema200: 112.0,
            atr3: 1.5,
            atr14: 2.0,
            current_volume: 450.0,
            average_volume: 1_000.0, // -55%: dried-up rebound
            macd_series: vec![],
            rsi14_series: vec![],
        };

        // 60 intraday bars: drift, a rebound peaking at 106, then 20
        // confirmation closes at 99.
        let mut mids = vec![101.0; 30];
        mids.extend([103.0, 105.0, 106.0, 105.5, 104.0, 102.0, 101.0, 100.5, 99.4, 99.2]);
        mids.extend(vec![99.0; 20]);
        assert_eq!(mids.len(), 60);

        // RSI7: climbs through the rebound, peaks at 78 on the bar before the
        // confirmation window (20 bars back, right at the recency bound), and
        // cools below 65 since.
        let mut rsi = vec![55.0; 30];
        rsi.extend([60.0, 64.0, 68.0, 70.0, 72.0, 74.0, 75.0, 76.0, 77.0, 78.0]);
        rsi.extend([74.0, 70.0, 66.0, 63.0, 61.0, 60.0, 59.0, 58.5, 58.0, 58.0]);
        rsi.extend(vec![58.0; 10]);

        data.intraday = IntradaySeries {
            mid_prices: mids,
            ema20: vec![100.0; 60],
            macd: vec![-0.5; 60],
            rsi7: rsi,
            rsi14: vec![55.0; 60],
        };
        data
    }

    #[test]
    fn scenario_table() {
        assert_eq!(scenario_for(Regime::A1, SignalDirection::Long), Scenario::Breakout);
        assert_eq!(scenario_for(Regime::A1, SignalDirection::Short), Scenario::Countertrend);
        assert_eq!(scenario_for(Regime::A2, SignalDirection::Short), Scenario::Pullback);
        assert_eq!(scenario_for(Regime::A2, SignalDirection::Long), Scenario::Countertrend);
        assert_eq!(scenario_for(Regime::B, SignalDirection::Long), Scenario::Range);
        assert_eq!(scenario_for(Regime::C, SignalDirection::Short), Scenario::Trend);
    }

    #[test]
    fn score_recomputation() {
        let regime = a2_regime();
        // 3 dims + primary-side bonus: 60 + 30 + 20, clamped to 100.
        assert_eq!(calculate_score(3, SignalDirection::Short, &regime), 100);
        assert_eq!(calculate_score(1, SignalDirection::Short, &regime), 90);
        // No bonus off the primary side.
        assert_eq!(calculate_score(2, SignalDirection::Long, &regime), 80);
        assert_eq!(tier_for_score(100), SignalTier::High);
        assert_eq!(tier_for_score(80), SignalTier::Medium);
        assert_eq!(tier_for_score(70), SignalTier::Low);
    }

    #[test]
    fn unconfirmed_pullback_is_rejected() {
        // Same setup but price still riding above the short EMA20: the
        // rebound has not failed yet, shorting here would be front-running.
        let mut data = confirmed_pullback_data();
        data.current_price = 101.0;
        let last = data.intraday.mid_prices.len() - 1;
        data.intraday.mid_prices[last] = 101.0;

        let audit = audit_signals(&data, &a2_regime(), SignalDirection::Short);
        assert_eq!(audit.scenario, Scenario::Pullback);
        assert!(!audit.pullback_confirmed);
        // Only the regime-match dimension counts.
        assert_eq!(audit.dimensions, 1);
    }

    #[test]
    fn confirmed_pullback_accepts_with_enough_dimensions() {
        let data = confirmed_pullback_data();
        let audit = audit_signals(&data, &a2_regime(), SignalDirection::Short);
        assert_eq!(audit.scenario, Scenario::Pullback);
        assert!(audit.pullback_confirmed);
        // regime + (momentum+position) + volume shrink + funding.
        assert!(audit.dimensions >= 3, "got {} dimensions", audit.dimensions);
        assert_eq!(audit.dimensions, 5);
    }

    #[test]
    fn pullback_without_band_touch_fails_position_leg() {
        let mut data = confirmed_pullback_data();
        // Flatten the rebound: never reaches the 4h band at 105.
        for p in data.intraday.mid_prices.iter_mut() {
            if *p > 101.0 {
                *p = 101.0;
            }
        }
        let audit = audit_signals(&data, &a2_regime(), SignalDirection::Short);
        assert!(!audit.pullback_confirmed);
    }

    #[test]
    fn countertrend_long_needs_deep_oversold() {
        let mut data = base_data("SOLUSDT");
        data.rsi7 = 24.0;
        data.funding_rate = -0.0002;
        data.longer_term.current_volume = 1_500.0;
        data.longer_term.average_volume = 1_000.0; // +50%

        let audit = audit_signals(&data, &a2_regime(), SignalDirection::Long);
        assert_eq!(audit.scenario, Scenario::Countertrend);
        assert_eq!(audit.dimensions, 4); // 2 (oversold) + funding + volume

        data.rsi7 = 40.0;
        let audit = audit_signals(&data, &a2_regime(), SignalDirection::Long);
        assert_eq!(audit.dimensions, 2); // funding + volume only
    }

    #[test]
    fn countertrend_short_in_uptrend_is_rejected() {
        let mut data = base_data("SOLUSDT");
        data.macd = -1.0;
        data.funding_rate = 0.0005;
        let audit = audit_signals(&data, &regime_of(Regime::A1), SignalDirection::Short);
        assert_eq!(audit.dimensions, 0);
    }

    #[test]
    fn range_long_counts_flat_dimensions() {
        let mut data = base_data("ETHUSDT");
        data.macd = 0.8;
        data.ema20 = 100.0;
        data.current_price = 100.2; // holding the EMA from above
        data.funding_rate = -0.0001;
        data.longer_term.current_volume = 1_300.0;
        data.longer_term.average_volume = 1_000.0; // +30%

        let audit = audit_signals(&data, &regime_of(Regime::B), SignalDirection::Long);
        assert_eq!(audit.scenario, Scenario::Range);
        // regime + momentum + position + volume + funding.
        assert_eq!(audit.dimensions, 5);
    }

    #[test]
    fn direction_parsing_folds_case() {
        assert_eq!(parse_direction("LONG"), Some(SignalDirection::Long));
        assert_eq!(parse_direction(" short "), Some(SignalDirection::Short));
        assert_eq!(parse_direction("flat"), None);
        // Idempotent through the enum's own serialization.
        let v = serde_json::to_string(&SignalDirection::Short).unwrap();
        assert_eq!(parse_direction(v.trim_matches('"')), Some(SignalDirection::Short));
    }
}
