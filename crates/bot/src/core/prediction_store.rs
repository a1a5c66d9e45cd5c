//! Prediction record store: a directory of immutable JSON records keyed by
//! `{timestamp}_{symbol}`.
//!
//! The core appends records and reads them back for calibration; the
//! post-hoc `evaluated`/`is_correct`/`accuracy` fields are filled in by an
//! external evaluator and only consumed here.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineError;
use crate::types::{HistoricalPerformance, Prediction, Regime};

/// The market inputs the prediction was made on, kept with the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub price: f64,
    pub atr_pct: f64,
    pub regime: Regime,
    pub signal_score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub prediction: Prediction,
    pub snapshot: PredictionSnapshot,
    /// Filled in post-hoc by the evaluator.
    #[serde(default)]
    pub evaluated: bool,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

pub struct PredictionStore {
    dir: PathBuf,
}

impl PredictionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, record: &PredictionRecord) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            record.timestamp.format("%Y%m%d_%H%M%S"),
            record.symbol
        ))
    }

    pub fn append(&self, record: &PredictionRecord) -> Result<(), EngineError> {
        let path = self.record_path(record);
        let body = serde_json::to_string_pretty(record)?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Most recent records first. Undecodable files are skipped with a
    /// warning, never fatal.
    pub fn load_recent(&self, limit: usize) -> Vec<PredictionRecord> {
        let mut names: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "prediction store unreadable");
                return Vec::new();
            }
        };
        // Timestamped names sort chronologically.
        names.sort();
        names.reverse();

        names
            .iter()
            .take(limit)
            .filter_map(|path| read_record(path))
            .collect()
    }

    /// Aggregate of evaluated records, for the calibration multiplier.
    pub fn performance(&self) -> Option<HistoricalPerformance> {
        let evaluated: Vec<PredictionRecord> = self
            .load_recent(500)
            .into_iter()
            .filter(|r| r.evaluated)
            .collect();
        if evaluated.is_empty() {
            return None;
        }

        let wins = evaluated
            .iter()
            .filter(|r| r.is_correct.unwrap_or(false))
            .count();
        let accuracy_sum: f64 = evaluated.iter().filter_map(|r| r.accuracy).sum();

        Some(HistoricalPerformance {
            overall_win_rate: wins as f64 / evaluated.len() as f64,
            avg_accuracy: accuracy_sum / evaluated.len() as f64,
            evaluated_count: evaluated.len(),
        })
    }

    /// Short textual digest of recent evaluated calls on one symbol, for the
    /// prediction prompt.
    pub fn recent_feedback(&self, symbol: &str, limit: usize) -> Option<String> {
        let lines: Vec<String> = self
            .load_recent(200)
            .into_iter()
            .filter(|r| r.symbol == symbol && r.evaluated)
            .take(limit)
            .map(|r| {
                format!(
                    "{} {} p={:.2} → {}",
                    r.timestamp.format("%m-%d %H:%M"),
                    r.prediction.direction,
                    r.prediction.probability,
                    match r.is_correct {
                        Some(true) => "correct",
                        Some(false) => "wrong",
                        None => "unresolved",
                    }
                )
            })
            .collect();

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

fn read_record(path: &Path) -> Option<PredictionRecord> {
    match fs::read_to_string(path) {
        Ok(body) => match serde_json::from_str(&body) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping undecodable prediction record");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable prediction record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceLevel, PredictionDirection, RiskLevel, Timeframe};
    use chrono::TimeZone;

    fn record(symbol: &str, minute: u32, evaluated: bool, correct: bool) -> PredictionRecord {
        PredictionRecord {
            timestamp: Utc.with_ymd_and_hms(2026, 7, 1, 12, minute, 0).unwrap(),
            symbol: symbol.into(),
            prediction: Prediction {
                symbol: symbol.into(),
                direction: PredictionDirection::Up,
                probability: 0.76,
                expected_move: 2.0,
                timeframe: Timeframe::H4,
                confidence: ConfidenceLevel::High,
                reasoning: "test".into(),
                key_factors: vec![],
                risk_level: RiskLevel::Medium,
                worst_case: -1.0,
                best_case: 3.0,
            },
            snapshot: PredictionSnapshot {
                price: 100.0,
                atr_pct: 1.5,
                regime: Regime::A1,
                signal_score: 90,
            },
            evaluated,
            is_correct: evaluated.then_some(correct),
            accuracy: evaluated.then_some(if correct { 0.8 } else { 0.2 }),
        }
    }

    #[test]
    fn append_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path()).unwrap();

        store.append(&record("SOLUSDT", 0, false, false)).unwrap();
        store.append(&record("OPUSDT", 1, true, true)).unwrap();

        let recent = store.load_recent(10);
        assert_eq!(recent.len(), 2);
        // Most recent first.
        assert_eq!(recent[0].symbol, "OPUSDT");
        assert_eq!(recent[1].symbol, "SOLUSDT");
    }

    #[test]
    fn performance_aggregates_evaluated_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path()).unwrap();

        store.append(&record("SOLUSDT", 0, true, true)).unwrap();
        store.append(&record("SOLUSDT", 1, true, false)).unwrap();
        store.append(&record("SOLUSDT", 2, false, false)).unwrap();

        let perf = store.performance().unwrap();
        assert_eq!(perf.evaluated_count, 2);
        assert!((perf.overall_win_rate - 0.5).abs() < 1e-9);
        assert!((perf.avg_accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_store_has_no_performance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path()).unwrap();
        assert!(store.performance().is_none());
        assert!(store.recent_feedback("SOLUSDT", 5).is_none());
    }

    #[test]
    fn feedback_filters_by_symbol() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path()).unwrap();
        store.append(&record("SOLUSDT", 0, true, true)).unwrap();
        store.append(&record("OPUSDT", 1, true, false)).unwrap();

        let feedback = store.recent_feedback("SOLUSDT", 5).unwrap();
        assert!(feedback.contains("correct"));
        assert!(!feedback.contains("wrong"));
    }

    #[test]
    fn undecodable_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PredictionStore::new(tmp.path()).unwrap();
        store.append(&record("SOLUSDT", 0, true, true)).unwrap();
        fs::write(tmp.path().join("zz_garbage.json"), "not json").unwrap();

        assert_eq!(store.load_recent(10).len(), 1);
    }
}
