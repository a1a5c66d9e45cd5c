//! Periodic multi-factor anomaly scanner over a candidate symbol set.
//!
//! Fans out with bounded concurrency, applies hard liquidity gates, scores
//! six weighted factors with saturating sub-scores, and classifies firing
//! symbols into an early/mid/late tier. The OI and volume deltas come from
//! real history — never from placeholder constants.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::market_data::ExchangeRest;
use crate::errors::EngineError;
use crate::types::PredictionDirection;

/// Symbols scanned concurrently.
const SCAN_CONCURRENCY: usize = 20;

/// Coarse stage of a developing move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyTier {
    Early,
    Mid,
    Late,
}

#[derive(Debug, Clone)]
pub struct AnomalySignal {
    pub symbol: String,
    pub direction: PredictionDirection,
    /// 1–5, the rounded weighted composite.
    pub confidence: u8,
    pub tier: AnomalyTier,
    pub current_price: f64,
    pub oi_change_1h: f64,
    pub price_change_15m: f64,
    pub volume_change_1h: f64,
    pub funding_rate: f64,
    pub oi_value_usd: f64,
    pub volume_24h: f64,
    pub order_book_depth_usd: f64,
    pub triggered: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Raw per-symbol metrics the evaluation runs on.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyMetrics {
    pub current_price: f64,
    pub oi_change_1h: f64,
    pub price_change_15m: f64,
    pub volume_change_1h: f64,
    pub funding_rate: f64,
    pub oi_value_usd: f64,
    pub volume_24h: f64,
    pub order_book_depth_usd: f64,
}

/// Scanner thresholds. The `mid_*` set marks a developing move, the `late_*`
/// set a move likely already under way.
#[derive(Debug, Clone)]
pub struct AnomalyThresholds {
    pub mid_oi_change: f64,
    pub mid_price_change: f64,
    pub mid_volume_change: f64,
    pub mid_funding_rate: f64,
    pub late_oi_change: f64,
    pub late_price_change: f64,
    pub late_volume_change: f64,
    pub late_funding_rate: f64,
    pub min_oi_value_usd: f64,
    pub min_volume_24h_usd: f64,
    pub min_depth_usd: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            mid_oi_change: 25.0,
            mid_price_change: 5.0,
            mid_volume_change: 150.0,
            mid_funding_rate: 0.20,
            late_oi_change: 50.0,
            late_price_change: 10.0,
            late_volume_change: 300.0,
            late_funding_rate: 0.30,
            min_oi_value_usd: 15_000_000.0,
            min_volume_24h_usd: 50_000_000.0,
            min_depth_usd: 1_000_000.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub scans: u64,
    pub signals: u64,
    pub last_scanned: usize,
}

pub struct AnomalyScanner {
    rest: Arc<ExchangeRest>,
    thresholds: AnomalyThresholds,
    stats: Mutex<ScanStats>,
}

impl AnomalyScanner {
    pub fn new(rest: Arc<ExchangeRest>, thresholds: AnomalyThresholds) -> Self {
        Self {
            rest,
            thresholds,
            stats: Mutex::new(ScanStats::default()),
        }
    }

    /// Scan the candidate set; individual symbol failures are dropped.
    pub async fn scan(&self, symbols: &[String]) -> Vec<AnomalySignal> {
        let scan_id = {
            let mut stats = self.stats.lock().await;
            stats.scans += 1;
            stats.last_scanned = symbols.len();
            stats.scans
        };
        debug!(scan_id, candidates = symbols.len(), "anomaly scan started");

        let signals: Vec<AnomalySignal> = stream::iter(symbols.iter().cloned())
            .map(|symbol| async move { self.scan_symbol(&symbol).await.ok().flatten() })
            .buffer_unordered(SCAN_CONCURRENCY)
            .filter_map(|signal| async move { signal })
            .collect()
            .await;

        {
            let mut stats = self.stats.lock().await;
            stats.signals += signals.len() as u64;
        }

        info!(scan_id, signals = signals.len(), "anomaly scan finished");
        signals
    }

    async fn scan_symbol(&self, symbol: &str) -> Result<Option<AnomalySignal>, EngineError> {
        let current_price = self.rest.ticker_price(symbol).await?;
        if current_price <= 0.0 {
            return Ok(None);
        }

        // OI Δ1h from real history: thirteen 5m points span the hour.
        let oi_amount = self.rest.open_interest(symbol).await?;
        let oi_value_usd = oi_amount * current_price;
        let oi_history = self.rest.open_interest_hist(symbol, "5m", 13).await?;
        let oi_change_1h = match oi_history.first() {
            Some(first) if first.open_interest > 0.0 => {
                (oi_amount - first.open_interest) / first.open_interest * 100.0
            }
            _ => 0.0,
        };

        // Price Δ15m from the last two 15m bars.
        let klines_15m = self.rest.klines(symbol, "15m", 2).await?;
        let price_change_15m = match klines_15m.first() {
            Some(prev) if klines_15m.len() == 2 && prev.close > 0.0 => {
                (klines_15m[1].close - prev.close) / prev.close * 100.0
            }
            _ => 0.0,
        };

        // Volume Δ1h: last closed hour vs the trailing 24-hour average.
        let klines_1h = self.rest.klines(symbol, "1h", 25).await?;
        let volume_change_1h = volume_change_from_hourly(&klines_1h);

        let ticker = self.rest.ticker_24h(symbol).await?;
        let funding_rate = self
            .rest
            .funding_rate_history(symbol, 1)
            .await?
            .last()
            .copied()
            .unwrap_or(0.0);

        let depth = self.rest.depth(symbol, 100).await?;
        let band = current_price * 0.02;
        let order_book_depth_usd: f64 = depth
            .bids
            .iter()
            .filter(|(p, _)| *p >= current_price - band)
            .chain(depth.asks.iter().filter(|(p, _)| *p <= current_price + band))
            .map(|(p, q)| p * q)
            .sum();

        let metrics = AnomalyMetrics {
            current_price,
            oi_change_1h,
            price_change_15m,
            volume_change_1h,
            funding_rate,
            oi_value_usd,
            volume_24h: ticker.quote_volume,
            order_book_depth_usd,
        };

        Ok(evaluate(symbol, &metrics, &self.thresholds))
    }

    pub async fn stats(&self) -> ScanStats {
        *self.stats.lock().await
    }

    /// Volume-sorted candidate snapshot for when the streaming board is not
    /// warm yet: USDT perpetuals by 24h quote volume, minus the exclusions.
    pub async fn top_by_volume(
        &self,
        top_n: usize,
        exclude: &[String],
    ) -> Result<Vec<String>, EngineError> {
        let perpetuals: std::collections::HashSet<String> = self
            .rest
            .exchange_info()
            .await?
            .into_iter()
            .filter(|s| s.contract_type == "PERPETUAL")
            .map(|s| s.symbol)
            .collect();

        let mut ranked: Vec<(String, f64)> = self
            .rest
            .all_tickers_24h()
            .await?
            .into_iter()
            .filter(|t| {
                t.symbol.ends_with("USDT")
                    && perpetuals.contains(&t.symbol)
                    && !exclude.iter().any(|e| e == &t.symbol)
            })
            .map(|t| (t.symbol, t.quote_volume))
            .collect();

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_n);
        Ok(ranked.into_iter().map(|(symbol, _)| symbol).collect())
    }
}

/// Volume change of the last closed hour vs the trailing average, percent.
pub(crate) fn volume_change_from_hourly(klines: &[crate::types::Kline]) -> f64 {
    if klines.len() < 2 {
        return 0.0;
    }
    let last = klines[klines.len() - 1].volume;
    let trailing = &klines[..klines.len() - 1];
    let avg = trailing.iter().map(|k| k.volume).sum::<f64>() / trailing.len() as f64;
    if avg > 0.0 {
        (last - avg) / avg * 100.0
    } else {
        0.0
    }
}

/// Score the metrics; `None` when the liquidity gates or the firing rule
/// are not met.
pub(crate) fn evaluate(
    symbol: &str,
    m: &AnomalyMetrics,
    th: &AnomalyThresholds,
) -> Option<AnomalySignal> {
    // Hard liquidity pre-filters.
    if m.oi_value_usd < th.min_oi_value_usd
        || m.volume_24h < th.min_volume_24h_usd
        || m.order_book_depth_usd < th.min_depth_usd
    {
        return None;
    }

    let mut triggered: Vec<String> = Vec::new();

    let abs_oi = m.oi_change_1h.abs();
    let oi_score = if abs_oi >= 300.0 {
        triggered.push(format!("OI surge {:+.1}%", m.oi_change_1h));
        4.0
    } else if abs_oi >= 100.0 {
        triggered.push(format!("OI spike {:+.1}%", m.oi_change_1h));
        3.0
    } else if abs_oi >= th.mid_oi_change {
        triggered.push(format!("OI growth {:+.1}%", m.oi_change_1h));
        2.0
    } else {
        0.0
    };

    let abs_volume = m.volume_change_1h.abs();
    let volume_score = if abs_volume >= 800.0 {
        triggered.push(format!("volume explosion {:+.1}%", m.volume_change_1h));
        4.0
    } else if abs_volume >= 500.0 {
        triggered.push(format!("volume spike {:+.1}%", m.volume_change_1h));
        3.0
    } else if abs_volume >= th.mid_volume_change {
        triggered.push(format!("volume rise {:+.1}%", m.volume_change_1h));
        2.0
    } else {
        0.0
    };

    let abs_funding = (m.funding_rate * 100.0).abs();
    let funding_score = if abs_funding >= 0.50 {
        triggered.push(format!("funding extreme {:.3}%", m.funding_rate * 100.0));
        3.0
    } else if abs_funding >= th.mid_funding_rate {
        triggered.push(format!("funding anomaly {:.3}%", m.funding_rate * 100.0));
        2.0
    } else {
        0.0
    };

    let abs_price = m.price_change_15m.abs();
    let price_score = if abs_price >= 30.0 {
        triggered.push(format!("price dislocation {:+.1}%", m.price_change_15m));
        4.0
    } else if abs_price >= 20.0 {
        triggered.push(format!("price breakout {:+.1}%", m.price_change_15m));
        3.0
    } else if abs_price >= th.mid_price_change {
        triggered.push(format!("price move {:+.1}%", m.price_change_15m));
        2.0
    } else {
        0.0
    };

    let depth_score = if m.order_book_depth_usd >= 5_000_000.0 {
        3.0
    } else if m.order_book_depth_usd >= 2_000_000.0 {
        2.0
    } else {
        1.0 // at or above the gate
    };

    let liquidity_score = if m.oi_value_usd >= 50_000_000.0 && m.volume_24h >= 200_000_000.0 {
        3.0
    } else if m.oi_value_usd >= 30_000_000.0 && m.volume_24h >= 100_000_000.0 {
        2.0
    } else {
        1.0
    };

    let weighted: f64 = oi_score * 0.25
        + volume_score * 0.20
        + funding_score * 0.20
        + price_score * 0.15
        + depth_score * 0.10
        + liquidity_score * 0.10;

    // Firing rule: at least two triggered factors and a composite ≥ 2.5.
    if triggered.len() < 2 || weighted < 2.5 {
        return None;
    }

    let tier = classify_tier(m, th);

    let direction = if m.price_change_15m > 0.0 || m.oi_change_1h > 0.0 {
        PredictionDirection::Up
    } else if m.price_change_15m < 0.0 || m.oi_change_1h < 0.0 {
        PredictionDirection::Down
    } else {
        PredictionDirection::Neutral
    };

    Some(AnomalySignal {
        symbol: symbol.to_string(),
        direction,
        confidence: (weighted.round() as i64).clamp(1, 5) as u8,
        tier,
        current_price: m.current_price,
        oi_change_1h: m.oi_change_1h,
        price_change_15m: m.price_change_15m,
        volume_change_1h: m.volume_change_1h,
        funding_rate: m.funding_rate,
        oi_value_usd: m.oi_value_usd,
        volume_24h: m.volume_24h,
        order_book_depth_usd: m.order_book_depth_usd,
        triggered,
        detected_at: Utc::now(),
    })
}

/// Stage classification: late when any late threshold is crossed, mid when
/// only mid thresholds are, early otherwise.
pub(crate) fn classify_tier(m: &AnomalyMetrics, th: &AnomalyThresholds) -> AnomalyTier {
    let abs_oi = m.oi_change_1h.abs();
    let abs_volume = m.volume_change_1h.abs();
    let abs_price = m.price_change_15m.abs();
    let abs_funding = (m.funding_rate * 100.0).abs();

    let meets_late = abs_oi >= th.late_oi_change
        || abs_volume >= th.late_volume_change
        || abs_price >= th.late_price_change
        || abs_funding >= th.late_funding_rate;
    let meets_mid = abs_oi >= th.mid_oi_change
        || abs_volume >= th.mid_volume_change
        || abs_price >= th.mid_price_change
        || abs_funding >= th.mid_funding_rate;

    if meets_late {
        AnomalyTier::Late
    } else if meets_mid {
        AnomalyTier::Mid
    } else {
        AnomalyTier::Early
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Kline;

    fn liquid_metrics() -> AnomalyMetrics {
        AnomalyMetrics {
            current_price: 2.5,
            oi_change_1h: 0.0,
            price_change_15m: 0.0,
            volume_change_1h: 0.0,
            funding_rate: 0.0,
            oi_value_usd: 20_000_000.0,
            volume_24h: 60_000_000.0,
            order_book_depth_usd: 1_500_000.0,
        }
    }

    #[test]
    fn liquidity_gates_are_hard_prefilters() {
        let th = AnomalyThresholds::default();
        let mut m = liquid_metrics();
        m.oi_change_1h = 400.0;
        m.volume_change_1h = 900.0;
        m.price_change_15m = 35.0;

        m.oi_value_usd = 10_000_000.0;
        assert!(evaluate("XUSDT", &m, &th).is_none());

        m.oi_value_usd = 20_000_000.0;
        m.volume_24h = 10_000_000.0;
        assert!(evaluate("XUSDT", &m, &th).is_none());

        m.volume_24h = 60_000_000.0;
        m.order_book_depth_usd = 500_000.0;
        assert!(evaluate("XUSDT", &m, &th).is_none());
    }

    #[test]
    fn quiet_symbol_does_not_fire() {
        let th = AnomalyThresholds::default();
        let m = liquid_metrics();
        assert!(evaluate("XUSDT", &m, &th).is_none());
    }

    #[test]
    fn single_factor_is_not_enough() {
        let th = AnomalyThresholds::default();
        let mut m = liquid_metrics();
        m.oi_change_1h = 350.0; // one triggered factor only
        assert!(evaluate("XUSDT", &m, &th).is_none());
    }

    #[test]
    fn strong_composite_fires_late_tier() {
        let th = AnomalyThresholds::default();
        let mut m = liquid_metrics();
        m.oi_change_1h = 320.0;
        m.volume_change_1h = 850.0;
        m.price_change_15m = 22.0;
        m.funding_rate = -0.0066;

        let signal = evaluate("ZECUSDT", &m, &th).expect("should fire");
        assert_eq!(signal.tier, AnomalyTier::Late);
        assert_eq!(signal.direction, PredictionDirection::Up);
        assert!(signal.confidence >= 3);
        assert!(signal.triggered.len() >= 3);
    }

    #[test]
    fn tier_boundaries() {
        let th = AnomalyThresholds::default();
        let mut m = liquid_metrics();
        assert_eq!(classify_tier(&m, &th), AnomalyTier::Early);

        // Mid thresholds only.
        m.oi_change_1h = 45.0;
        m.volume_change_1h = 250.0;
        m.price_change_15m = 8.0;
        m.funding_rate = 0.0025;
        assert_eq!(classify_tier(&m, &th), AnomalyTier::Mid);

        // Exactly at a mid boundary classifies as mid.
        let mut edge = liquid_metrics();
        edge.oi_change_1h = th.mid_oi_change;
        assert_eq!(classify_tier(&edge, &th), AnomalyTier::Mid);

        // Any late threshold lifts the tier.
        m.price_change_15m = th.late_price_change;
        assert_eq!(classify_tier(&m, &th), AnomalyTier::Late);
    }

    #[test]
    fn down_moves_classify_down() {
        let th = AnomalyThresholds::default();
        let mut m = liquid_metrics();
        m.oi_change_1h = -120.0;
        m.volume_change_1h = 850.0;
        m.price_change_15m = -21.0;
        m.oi_value_usd = 60_000_000.0;
        m.volume_24h = 250_000_000.0;
        m.order_book_depth_usd = 6_000_000.0;

        let signal = evaluate("XUSDT", &m, &th).expect("should fire");
        assert_eq!(signal.direction, PredictionDirection::Down);
    }

    #[test]
    fn hourly_volume_change_vs_trailing_average() {
        let mut klines: Vec<Kline> = (0..25)
            .map(|i| Kline {
                open_time: i * 3_600_000,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 100.0,
                close_time: (i + 1) * 3_600_000 - 1,
            })
            .collect();
        klines.last_mut().unwrap().volume = 350.0;
        let change = volume_change_from_hourly(&klines);
        assert!((change - 250.0).abs() < 1e-9);
        assert_eq!(volume_change_from_hourly(&klines[..1]), 0.0);
    }
}
