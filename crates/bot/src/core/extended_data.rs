//! Best-effort extended market data: derivatives, liquidation estimate,
//! sentiment.
//!
//! The three legs fan out in parallel and join per symbol. A failed leg
//! degrades to `None` with a warning; it never fails the whole call.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::core::market_data::{DepthSnapshot, ExchangeRest};
use crate::core::rate_limiter::RateLimiter;
use crate::errors::EngineError;
use crate::types::{
    DerivativesData, ExtendedData, FundingTrend, LiqZone, LiquidationData, LiquidationTilt,
    SentimentData, SocialSentiment,
};

/// Leverages retail commonly runs; the liquidation estimate assumes entry at
/// the current mid for each of them.
const COMMON_LEVERAGES: [f64; 3] = [5.0, 10.0, 20.0];
/// Resting orders within ±2% of a theoretical liquidation price count
/// toward that zone's volume.
const ZONE_TOLERANCE_PCT: f64 = 0.02;
/// Funding-trend threshold on the recent-vs-previous mean difference.
const FUNDING_TREND_EPSILON: f64 = 0.0001;
/// Order-book imbalance ratio that reads as a one-sided tilt.
const TILT_RATIO: f64 = 1.5;

pub struct ExtendedDataFetcher {
    rest: Arc<ExchangeRest>,
    http: reqwest::Client,
    sentiment_url: String,
    sentiment_host: String,
    limiter: Arc<RateLimiter>,
}

impl ExtendedDataFetcher {
    pub fn new(
        rest: Arc<ExchangeRest>,
        sentiment_url: String,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        let sentiment_host = sentiment_url
            .strip_prefix("https://")
            .or_else(|| sentiment_url.strip_prefix("http://"))
            .unwrap_or(&sentiment_url)
            .split('/')
            .next()
            .unwrap_or("sentiment")
            .to_string();
        Ok(Self {
            rest,
            http,
            sentiment_url,
            sentiment_host,
            limiter,
        })
    }

    /// Fetch all sub-records; each leg degrades independently.
    pub async fn get(&self, symbol: &str) -> ExtendedData {
        let symbol = crate::core::market_data::normalize_symbol(symbol);

        let (derivatives, liquidation, sentiment) = tokio::join!(
            self.derivatives(&symbol),
            self.liquidation(&symbol),
            self.sentiment(),
        );

        let log_leg = |name: &str, err: &EngineError| {
            warn!(symbol = %symbol, leg = name, error = %err, "extended data leg failed");
        };

        ExtendedData {
            symbol: symbol.clone(),
            derivatives: derivatives.map_err(|e| log_leg("derivatives", &e)).ok(),
            liquidation: liquidation.map_err(|e| log_leg("liquidation", &e)).ok(),
            sentiment: sentiment.map_err(|e| log_leg("sentiment", &e)).ok(),
        }
    }

    /// OI deltas from the real history endpoint plus the funding trend.
    async fn derivatives(&self, symbol: &str) -> Result<DerivativesData, EngineError> {
        let current = self.rest.open_interest(symbol).await?;
        // 5m points; 300 covers the 24h window plus slack.
        let history = self.rest.open_interest_hist(symbol, "5m", 300).await?;

        let change_vs = |points_back: usize| -> f64 {
            if history.len() > points_back {
                let past = history[history.len() - 1 - points_back].open_interest;
                if past > 0.0 {
                    return (current - past) / past * 100.0;
                }
            }
            0.0
        };

        let rates = self.rest.funding_rate_history(symbol, 6).await?;
        let current_funding = rates.last().copied().unwrap_or(0.0);

        Ok(DerivativesData {
            oi_change_4h: change_vs(48),
            oi_change_24h: change_vs(288),
            funding_rate_trend: funding_trend(&rates),
            current_funding,
        })
    }

    async fn liquidation(&self, symbol: &str) -> Result<LiquidationData, EngineError> {
        let depth = self.rest.depth(symbol, 500).await?;
        estimate_liquidation_zones(&depth).ok_or_else(|| EngineError::DataUnavailable {
            name: format!("{symbol} order book"),
        })
    }

    async fn sentiment(&self) -> Result<SentimentData, EngineError> {
        #[derive(Deserialize)]
        struct FngResponse {
            data: Vec<FngPoint>,
        }
        #[derive(Deserialize)]
        struct FngPoint {
            value: String,
            value_classification: String,
        }

        self.limiter.acquire(&self.sentiment_host).await;
        let response = self.http.get(&self.sentiment_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let fng: FngResponse = response.json().await?;
        let point = fng.data.first().ok_or_else(|| EngineError::DataUnavailable {
            name: "fear/greed index".into(),
        })?;

        let index: u8 = point.value.parse().unwrap_or(50);
        Ok(SentimentData {
            fear_greed_index: index.min(100),
            social_sentiment: classify_sentiment(&point.value_classification),
        })
    }
}

/// Fold the index classification onto the closed sentiment set.
fn classify_sentiment(classification: &str) -> SocialSentiment {
    match classification {
        "Extreme Fear" | "Fear" => SocialSentiment::Bearish,
        "Greed" | "Extreme Greed" => SocialSentiment::Bullish,
        _ => SocialSentiment::Neutral,
    }
}

/// Trend of the last funding settlements: mean of the newest three vs the
/// mean of the three before them.
pub(crate) fn funding_trend(rates: &[f64]) -> FundingTrend {
    if rates.len() < 6 {
        return FundingTrend::Stable;
    }
    let recent: f64 = rates[rates.len() - 3..].iter().sum::<f64>() / 3.0;
    let previous: f64 = rates[rates.len() - 6..rates.len() - 3].iter().sum::<f64>() / 3.0;

    let diff = recent - previous;
    if diff > FUNDING_TREND_EPSILON {
        FundingTrend::Increasing
    } else if diff < -FUNDING_TREND_EPSILON {
        FundingTrend::Decreasing
    } else {
        FundingTrend::Stable
    }
}

/// Estimate liquidation clusters from the order book.
///
/// For each common leverage the theoretical liquidation price is
/// `mid × (1 ∓ 1/L)`; the zone "volume" is the USD value of resting orders
/// within ±2% of that price. Tilt comes from the top-50-level imbalance.
pub(crate) fn estimate_liquidation_zones(depth: &DepthSnapshot) -> Option<LiquidationData> {
    let best_bid = depth.bids.first()?.0;
    let best_ask = depth.asks.first()?.0;
    let mid = (best_bid + best_ask) / 2.0;
    if mid <= 0.0 {
        return None;
    }

    let tolerance = mid * ZONE_TOLERANCE_PCT;

    let mut long_zones: Vec<LiqZone> = COMMON_LEVERAGES
        .iter()
        .filter_map(|leverage| {
            let price = mid * (1.0 - 1.0 / leverage);
            let volume_usd = volume_near_price(&depth.bids, price, tolerance);
            (volume_usd > 0.0).then_some(LiqZone { price, volume_usd })
        })
        .collect();

    let mut short_zones: Vec<LiqZone> = COMMON_LEVERAGES
        .iter()
        .filter_map(|leverage| {
            let price = mid * (1.0 + 1.0 / leverage);
            let volume_usd = volume_near_price(&depth.asks, price, tolerance);
            (volume_usd > 0.0).then_some(LiqZone { price, volume_usd })
        })
        .collect();

    long_zones.sort_by(|a, b| a.price.total_cmp(&b.price));
    short_zones.sort_by(|a, b| a.price.total_cmp(&b.price));

    let bid_usd: f64 = depth.bids.iter().take(50).map(|(p, q)| p * q).sum();
    let ask_usd: f64 = depth.asks.iter().take(50).map(|(p, q)| p * q).sum();

    Some(LiquidationData {
        long_zones,
        short_zones,
        tilt: classify_tilt(bid_usd, ask_usd),
    })
}

/// USD value of resting orders within ±tolerance of the target price.
pub(crate) fn volume_near_price(orders: &[(f64, f64)], target: f64, tolerance: f64) -> f64 {
    orders
        .iter()
        .filter(|(price, _)| *price >= target - tolerance && *price <= target + tolerance)
        .map(|(price, qty)| price * qty)
        .sum()
}

pub(crate) fn classify_tilt(bid_usd: f64, ask_usd: f64) -> LiquidationTilt {
    if ask_usd > bid_usd * TILT_RATIO {
        // Heavy offers overhead: longs are the likely fuel.
        LiquidationTilt::LongHeavy
    } else if bid_usd > ask_usd * TILT_RATIO {
        LiquidationTilt::ShortHeavy
    } else {
        LiquidationTilt::Balanced
    }
}

/// Compact one-line rendering for model prompts. Absent sub-records are
/// simply skipped.
pub fn format_extended(data: &ExtendedData) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(d) = &data.derivatives {
        let mut parts: Vec<String> = Vec::new();
        if d.oi_change_4h != 0.0 || d.oi_change_24h != 0.0 {
            parts.push(format!("oiΔ4h={:+.2}%", d.oi_change_4h));
            parts.push(format!("oiΔ24h={:+.2}%", d.oi_change_24h));
        }
        if d.funding_rate_trend != FundingTrend::Stable {
            parts.push(format!("funding_trend={:?}", d.funding_rate_trend).to_lowercase());
        }
        if !parts.is_empty() {
            sections.push(format!("deriv[{}]", parts.join(" | ")));
        }
    }

    if let Some(l) = &data.liquidation {
        let mut parts: Vec<String> = Vec::new();
        for zone in l.long_zones.iter().take(3) {
            parts.push(format!("long@${:.0}≈{:.1}M", zone.price, zone.volume_usd / 1e6));
        }
        for zone in l.short_zones.iter().take(3) {
            parts.push(format!("short@${:.0}≈{:.1}M", zone.price, zone.volume_usd / 1e6));
        }
        match l.tilt {
            LiquidationTilt::LongHeavy => parts.push("tilt=long_heavy".to_string()),
            LiquidationTilt::ShortHeavy => parts.push("tilt=short_heavy".to_string()),
            LiquidationTilt::Balanced => {}
        }
        if !parts.is_empty() {
            sections.push(format!("liq[{}]", parts.join(" | ")));
        }
    }

    if let Some(s) = &data.sentiment {
        let mut parts: Vec<String> = Vec::new();
        if s.fear_greed_index != 50 {
            parts.push(format!("fear_greed={}", s.fear_greed_index));
        }
        if s.social_sentiment != SocialSentiment::Neutral {
            parts.push(format!("social={:?}", s.social_sentiment).to_lowercase());
        }
        if !parts.is_empty() {
            sections.push(format!("sentiment[{}]", parts.join(" | ")));
        }
    }

    sections.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder(side_up: bool, mid: f64, levels: usize) -> Vec<(f64, f64)> {
        (0..levels)
            .map(|i| {
                let offset = mid * 0.0005 * (i as f64 + 1.0);
                let price = if side_up { mid + offset } else { mid - offset };
                (price, 10.0)
            })
            .collect()
    }

    #[test]
    fn funding_trend_classification() {
        assert_eq!(funding_trend(&[0.0001; 6]), FundingTrend::Stable);
        assert_eq!(
            funding_trend(&[0.0001, 0.0001, 0.0001, 0.0005, 0.0005, 0.0005]),
            FundingTrend::Increasing
        );
        assert_eq!(
            funding_trend(&[0.0005, 0.0005, 0.0005, 0.0001, 0.0001, 0.0001]),
            FundingTrend::Decreasing
        );
        // Short history reads as stable, not as an error.
        assert_eq!(funding_trend(&[0.0009, 0.0001]), FundingTrend::Stable);
    }

    #[test]
    fn volume_near_price_respects_band() {
        let orders = vec![(90.0, 1.0), (95.0, 2.0), (100.0, 3.0)];
        // ±2 around 95 catches only the middle level: 95 × 2.
        assert_eq!(volume_near_price(&orders, 95.0, 2.0), 190.0);
        assert_eq!(volume_near_price(&orders, 50.0, 2.0), 0.0);
    }

    #[test]
    fn tilt_requires_one_and_a_half_ratio() {
        assert_eq!(classify_tilt(100.0, 100.0), LiquidationTilt::Balanced);
        assert_eq!(classify_tilt(100.0, 151.0), LiquidationTilt::LongHeavy);
        assert_eq!(classify_tilt(151.0, 100.0), LiquidationTilt::ShortHeavy);
        assert_eq!(classify_tilt(100.0, 150.0), LiquidationTilt::Balanced);
    }

    #[test]
    fn liquidation_zones_from_deep_book() {
        // A wide book with liquidity down to −20% and up to +20% so that the
        // 5× zones (±20%) and 10×/20× zones all find resting volume.
        let mid = 100.0;
        let mut bids: Vec<(f64, f64)> = (1..=400)
            .map(|i| (mid - 0.05 * i as f64, 50.0))
            .collect();
        bids.insert(0, (99.95, 50.0));
        let asks: Vec<(f64, f64)> = (0..=400).map(|i| (mid + 0.05 * i as f64 + 0.05, 50.0)).collect();

        let data = estimate_liquidation_zones(&DepthSnapshot { bids, asks }).unwrap();
        assert_eq!(data.long_zones.len(), 3);
        assert_eq!(data.short_zones.len(), 3);
        // Sorted ascending by price; 5× long zone (~80) sits lowest.
        assert!(data.long_zones[0].price < data.long_zones[2].price);
        assert!((data.long_zones[0].price - 80.0).abs() < 0.5);
        assert!((data.short_zones[2].price - 120.0).abs() < 0.5);
        for zone in data.long_zones.iter().chain(data.short_zones.iter()) {
            assert!(zone.volume_usd > 0.0);
        }
    }

    #[test]
    fn empty_book_yields_none() {
        assert!(estimate_liquidation_zones(&DepthSnapshot {
            bids: vec![],
            asks: ladder(true, 100.0, 5),
        })
        .is_none());
    }

    #[test]
    fn format_extended_skips_absent_records() {
        let data = ExtendedData {
            symbol: "SOLUSDT".into(),
            derivatives: Some(DerivativesData {
                oi_change_4h: 12.5,
                oi_change_24h: 30.0,
                funding_rate_trend: FundingTrend::Increasing,
                current_funding: 0.0003,
            }),
            liquidation: None,
            sentiment: None,
        };
        let text = format_extended(&data);
        assert!(text.contains("oiΔ4h=+12.50%"));
        assert!(text.contains("funding_trend=increasing"));
        assert!(!text.contains("liq["));
    }
}
