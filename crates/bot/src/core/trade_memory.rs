//! Trade memory: the digest file, the append-only trade log, the
//! JSON-per-signal directory, and the rolling return window behind the
//! Sharpe demotion.
//!
//! Everything here is best-effort bookkeeping — a failed write warns and
//! moves on; it never blocks a trading decision.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::errors::EngineError;
use crate::types::{PositionSide, SignalResult};

/// Returns kept for the rolling Sharpe.
const RETURN_WINDOW: usize = 50;

pub struct TradeMemory {
    log_path: PathBuf,
    signal_dir: PathBuf,
    digest_path: PathBuf,
    returns: Mutex<VecDeque<f64>>,
}

impl TradeMemory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let data_dir = data_dir.into();
        let signal_dir = data_dir.join("signals");
        fs::create_dir_all(&signal_dir)?;

        Ok(Self {
            log_path: data_dir.join("trades.log"),
            signal_dir,
            digest_path: data_dir.join("memory.txt"),
            returns: Mutex::new(VecDeque::new()),
        })
    }

    /// Free-form trader memory, if someone wrote one.
    pub fn load_digest(&self) -> Option<String> {
        match fs::read_to_string(&self.digest_path) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }

    /// Append one line to the trade log.
    pub fn log_line(&self, line: &str) {
        let stamped = format!("{} {line}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| f.write_all(stamped.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.log_path.display(), error = %e, "trade log write failed");
        }
    }

    /// Persist an accepted signal as its own JSON file.
    pub fn log_signal(&self, signal: &SignalResult) {
        let path = self.signal_dir.join(format!(
            "{}_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S"),
            signal.symbol
        ));
        match serde_json::to_string_pretty(signal) {
            Ok(body) => {
                if let Err(e) = fs::write(&path, body) {
                    warn!(path = %path.display(), error = %e, "signal record write failed");
                }
            }
            Err(e) => warn!(error = %e, "signal record serialization failed"),
        }
    }

    /// Record a closed trade: feeds the rolling Sharpe and the log.
    pub fn record_close(&self, symbol: &str, side: PositionSide, return_pct: f64) {
        {
            let mut returns = self.returns.lock().expect("returns lock poisoned");
            returns.push_back(return_pct);
            while returns.len() > RETURN_WINDOW {
                returns.pop_front();
            }
        }
        self.log_line(&format!("close {symbol} {side} {return_pct:+.2}%"));
    }

    /// Rolling Sharpe over the recent closed-trade returns; 0 with fewer
    /// than two samples.
    pub fn rolling_sharpe(&self) -> f64 {
        let returns = self.returns.lock().expect("returns lock poisoned");
        if returns.len() < 2 {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return 0.0;
        }
        mean / std_dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Scenario, SignalDirection, SignalTier};

    fn signal() -> SignalResult {
        SignalResult {
            symbol: "SOLUSDT".into(),
            direction: SignalDirection::Short,
            signal_list: vec!["momentum".into()],
            score: 90,
            confidence: SignalTier::High,
            scenario: Scenario::Pullback,
            valid: true,
            reasoning: "test".into(),
        }
    }

    #[test]
    fn digest_is_optional() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = TradeMemory::new(tmp.path()).unwrap();
        assert!(memory.load_digest().is_none());

        fs::write(tmp.path().join("memory.txt"), "prefer fewer, larger entries\n").unwrap();
        assert!(memory.load_digest().unwrap().contains("larger entries"));
    }

    #[test]
    fn log_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = TradeMemory::new(tmp.path()).unwrap();
        memory.log_line("open SOLUSDT long");
        memory.log_line("close SOLUSDT long +2.10%");

        let body = fs::read_to_string(tmp.path().join("trades.log")).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains("open SOLUSDT long"));
    }

    #[test]
    fn signal_records_are_json_files() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = TradeMemory::new(tmp.path()).unwrap();
        memory.log_signal(&signal());

        let entries: Vec<_> = fs::read_dir(tmp.path().join("signals"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let body = fs::read_to_string(entries[0].path()).unwrap();
        assert!(body.contains("\"pullback\""));
    }

    #[test]
    fn sharpe_tracks_return_sign() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = TradeMemory::new(tmp.path()).unwrap();
        assert_eq!(memory.rolling_sharpe(), 0.0);

        for r in [2.0, 1.0, 3.0, 2.5] {
            memory.record_close("SOLUSDT", PositionSide::Long, r);
        }
        assert!(memory.rolling_sharpe() > 0.0);

        for r in [-4.0, -6.0, -3.0, -5.0, -4.5, -5.5] {
            memory.record_close("SOLUSDT", PositionSide::Long, r);
        }
        assert!(memory.rolling_sharpe() < 0.0);
    }

    #[test]
    fn return_window_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = TradeMemory::new(tmp.path()).unwrap();
        for i in 0..80 {
            memory.record_close("SOLUSDT", PositionSide::Long, i as f64);
        }
        assert_eq!(memory.returns.lock().unwrap().len(), RETURN_WINDOW);
    }
}
