//! Hard trading constraints: the single authority on "may I open/close?".
//!
//! One mutex-guarded record; all operations are synchronous and constant
//! time. Counters reset relative to their own anchors — the hourly window
//! rolls exactly 3600 s after it was anchored, not on the wall-clock hour.
//! Rejections are normal negative decisions carrying a structured reason,
//! not faults.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::errors::EngineError;
use crate::types::PositionSide;

#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintConfig {
    /// Per-symbol cooldown after a close, minutes.
    pub cooldown_minutes: u64,
    /// Max opens per rolling hour.
    pub max_hourly_trades: u32,
    /// Max opens per rolling day. The default effectively disables it.
    pub max_daily_trades: u32,
    /// Minimum hold before a non-stop-loss close, minutes.
    pub min_holding_minutes: u64,
    /// Max concurrently held symbols.
    pub max_positions: usize,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 20,
            max_hourly_trades: 3,
            max_daily_trades: 999,
            min_holding_minutes: 15,
            max_positions: 3,
        }
    }
}

struct ConstraintState {
    /// symbol → last close time.
    cooldowns: HashMap<String, Instant>,
    hourly_count: u32,
    hourly_anchor: Instant,
    daily_count: u32,
    daily_anchor: Instant,
    /// "symbol_side" → open time.
    open_times: HashMap<String, Instant>,
}

pub struct TradingConstraints {
    config: ConstraintConfig,
    state: Mutex<ConstraintState>,
}

const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{side}")
}

impl TradingConstraints {
    pub fn new(config: ConstraintConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(ConstraintState {
                cooldowns: HashMap::new(),
                hourly_count: 0,
                hourly_anchor: now,
                daily_count: 0,
                daily_anchor: now,
                open_times: HashMap::new(),
            }),
        }
    }

    /// May a new position on `symbol` be opened right now?
    pub fn can_open(&self, symbol: &str, current_position_count: usize) -> Result<(), EngineError> {
        self.can_open_at(symbol, current_position_count, Instant::now())
    }

    pub(crate) fn can_open_at(
        &self,
        symbol: &str,
        current_position_count: usize,
        now: Instant,
    ) -> Result<(), EngineError> {
        let state = self.state.lock().expect("constraint lock poisoned");

        if current_position_count >= self.config.max_positions {
            return Err(reject(format!(
                "position cap: {current_position_count} held, max {}",
                self.config.max_positions
            )));
        }

        if let Some(&closed_at) = state.cooldowns.get(symbol) {
            let cooldown = Duration::from_secs(self.config.cooldown_minutes * 60);
            let elapsed = now.saturating_duration_since(closed_at);
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).as_secs_f64() / 60.0;
                return Err(reject(format!(
                    "cooldown: {symbol} closed {:.1}m ago, {remaining:.1}m remaining",
                    elapsed.as_secs_f64() / 60.0
                )));
            }
        }

        // Counters are read as zero once their anchor has aged out.
        let hourly = if now.saturating_duration_since(state.hourly_anchor) >= HOUR {
            0
        } else {
            state.hourly_count
        };
        if hourly >= self.config.max_hourly_trades {
            let remaining =
                (HOUR - now.saturating_duration_since(state.hourly_anchor)).as_secs_f64() / 60.0;
            return Err(reject(format!(
                "hourly cap: {hourly} opens this window, max {} — resets in {remaining:.0}m",
                self.config.max_hourly_trades
            )));
        }

        let daily = if now.saturating_duration_since(state.daily_anchor) >= DAY {
            0
        } else {
            state.daily_count
        };
        if daily >= self.config.max_daily_trades {
            return Err(reject(format!(
                "daily cap: {daily} opens today, max {}",
                self.config.max_daily_trades
            )));
        }

        Ok(())
    }

    /// Record an accepted open: roll aged anchors, bump counters, stamp the
    /// open time.
    pub fn record_open(&self, symbol: &str, side: PositionSide) {
        self.record_open_at(symbol, side, Instant::now());
    }

    pub(crate) fn record_open_at(&self, symbol: &str, side: PositionSide, now: Instant) {
        let mut state = self.state.lock().expect("constraint lock poisoned");

        if now.saturating_duration_since(state.hourly_anchor) >= HOUR {
            state.hourly_count = 0;
            state.hourly_anchor = now;
        }
        if now.saturating_duration_since(state.daily_anchor) >= DAY {
            state.daily_count = 0;
            state.daily_anchor = now;
        }

        state.hourly_count += 1;
        state.daily_count += 1;
        state.open_times.insert(position_key(symbol, side), now);
    }

    /// May this position be closed? Stop-loss closes pass unconditionally;
    /// anything else respects the minimum hold. An unknown position (e.g.
    /// held across a restart) is allowed to close.
    pub fn can_close(
        &self,
        symbol: &str,
        side: PositionSide,
        is_stop_loss: bool,
    ) -> Result<(), EngineError> {
        self.can_close_at(symbol, side, is_stop_loss, Instant::now())
    }

    pub(crate) fn can_close_at(
        &self,
        symbol: &str,
        side: PositionSide,
        is_stop_loss: bool,
        now: Instant,
    ) -> Result<(), EngineError> {
        if is_stop_loss {
            return Ok(());
        }

        let state = self.state.lock().expect("constraint lock poisoned");
        let Some(&opened_at) = state.open_times.get(&position_key(symbol, side)) else {
            return Ok(());
        };

        let held = now.saturating_duration_since(opened_at);
        let min_hold = Duration::from_secs(self.config.min_holding_minutes * 60);
        if held < min_hold {
            let remaining = (min_hold - held).as_secs_f64() / 60.0;
            return Err(reject(format!(
                "min hold: {symbol} {side} held {:.1}m of {}m — {remaining:.1}m remaining",
                held.as_secs_f64() / 60.0,
                self.config.min_holding_minutes
            )));
        }
        Ok(())
    }

    /// Record a close: start the cooldown, clear the open stamp.
    pub fn record_close(&self, symbol: &str, side: PositionSide) {
        self.record_close_at(symbol, side, Instant::now());
    }

    pub(crate) fn record_close_at(&self, symbol: &str, side: PositionSide, now: Instant) {
        let mut state = self.state.lock().expect("constraint lock poisoned");
        state.cooldowns.insert(symbol.to_string(), now);
        state.open_times.remove(&position_key(symbol, side));
    }

    /// Snapshot for the status log line.
    pub fn status(&self) -> String {
        let state = self.state.lock().expect("constraint lock poisoned");
        format!(
            "hourly {}/{} | daily {}/{} | {} symbols cooling down",
            state.hourly_count,
            self.config.max_hourly_trades,
            state.daily_count,
            self.config.max_daily_trades,
            state.cooldowns.len()
        )
    }
}

fn reject(reason: String) -> EngineError {
    EngineError::ConstraintRejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn constraints() -> TradingConstraints {
        TradingConstraints::new(ConstraintConfig::default())
    }

    // Open SOL long at t=0; a non-stop close at t=5m fails min-hold, a
    // stop-loss close passes; after closing, reopening at t=20m is still
    // cooling down and at t=26m is allowed.
    #[test]
    fn constraint_cascade() {
        let tc = constraints();
        let t0 = Instant::now();

        assert!(tc.can_open_at("SOLUSDT", 0, t0).is_ok());
        tc.record_open_at("SOLUSDT", PositionSide::Long, t0);

        let t5 = t0 + minutes(5);
        let err = tc
            .can_close_at("SOLUSDT", PositionSide::Long, false, t5)
            .unwrap_err();
        assert!(err.to_string().contains("min hold"));
        assert!(tc.can_close_at("SOLUSDT", PositionSide::Long, true, t5).is_ok());

        tc.record_close_at("SOLUSDT", PositionSide::Long, t5);

        // Cooldown of 20m runs from the close at t=5m.
        let err = tc.can_open_at("SOLUSDT", 0, t0 + minutes(20)).unwrap_err();
        assert!(err.to_string().contains("cooldown"));
        assert!(tc.can_open_at("SOLUSDT", 0, t0 + minutes(26)).is_ok());
    }

    #[test]
    fn cooldown_expires_just_after_the_window() {
        let tc = constraints();
        let t0 = Instant::now();
        tc.record_close_at("OPUSDT", PositionSide::Short, t0);

        let just_before = t0 + minutes(20) - Duration::from_secs(1);
        assert!(tc.can_open_at("OPUSDT", 0, just_before).is_err());
        // 20m + ε, not 19:59.
        let just_after = t0 + minutes(20) + Duration::from_secs(1);
        assert!(tc.can_open_at("OPUSDT", 0, just_after).is_ok());
    }

    #[test]
    fn position_cap() {
        let tc = constraints();
        let now = Instant::now();
        assert!(tc.can_open_at("SOLUSDT", 2, now).is_ok());
        let err = tc.can_open_at("SOLUSDT", 3, now).unwrap_err();
        assert!(err.to_string().contains("position cap"));
    }

    #[test]
    fn hourly_cap_resets_exactly_on_anchor_age() {
        let tc = constraints();
        let t0 = Instant::now();

        for symbol in ["AUSDT", "BUSDT", "CUSDT"] {
            assert!(tc.can_open_at(symbol, 0, t0).is_ok());
            tc.record_open_at(symbol, PositionSide::Long, t0);
        }

        let err = tc.can_open_at("DUSDT", 0, t0 + minutes(59)).unwrap_err();
        assert!(err.to_string().contains("hourly cap"));

        // Exactly 3600 s after the anchor the counter reads zero.
        assert!(tc.can_open_at("DUSDT", 0, t0 + Duration::from_secs(3_600)).is_ok());
    }

    #[test]
    fn daily_cap_binds_when_configured() {
        let tc = TradingConstraints::new(ConstraintConfig {
            max_daily_trades: 2,
            max_hourly_trades: 10,
            ..ConstraintConfig::default()
        });
        let t0 = Instant::now();

        tc.record_open_at("AUSDT", PositionSide::Long, t0);
        tc.record_open_at("BUSDT", PositionSide::Long, t0 + minutes(90));

        let err = tc.can_open_at("CUSDT", 0, t0 + minutes(120)).unwrap_err();
        assert!(err.to_string().contains("daily cap"));
        // 24h after the anchor it opens again.
        assert!(tc.can_open_at("CUSDT", 0, t0 + DAY).is_ok());
    }

    #[test]
    fn min_hold_expires() {
        let tc = constraints();
        let t0 = Instant::now();
        tc.record_open_at("ETHUSDT", PositionSide::Short, t0);

        assert!(tc
            .can_close_at("ETHUSDT", PositionSide::Short, false, t0 + minutes(14))
            .is_err());
        assert!(tc
            .can_close_at("ETHUSDT", PositionSide::Short, false, t0 + minutes(15))
            .is_ok());
    }

    #[test]
    fn unknown_position_may_close() {
        let tc = constraints();
        // No open record (e.g. held across a restart): closing is allowed.
        assert!(tc
            .can_close_at("GHOSTUSDT", PositionSide::Long, false, Instant::now())
            .is_ok());
    }

    #[test]
    fn sides_are_tracked_independently() {
        let tc = constraints();
        let t0 = Instant::now();
        tc.record_open_at("SOLUSDT", PositionSide::Long, t0);
        // The short side has no open stamp and may close freely.
        assert!(tc
            .can_close_at("SOLUSDT", PositionSide::Short, false, t0 + minutes(1))
            .is_ok());
        assert!(tc
            .can_close_at("SOLUSDT", PositionSide::Long, false, t0 + minutes(1))
            .is_err());
    }

    #[test]
    fn rejections_are_not_faults() {
        let tc = constraints();
        let t0 = Instant::now();
        tc.record_close_at("SOLUSDT", PositionSide::Long, t0);
        let err = tc.can_open_at("SOLUSDT", 0, t0 + minutes(1)).unwrap_err();
        assert!(err.is_rejection());
    }
}
