use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single futures kline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Latest open-interest reading for a symbol.
///
/// Only the latest value is carried; averages come from the real history
/// endpoint, never from a synthetic discount of the latest print.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenInterest {
    pub latest: f64,
}

/// Trailing intraday series (3-minute interval, oldest → latest).
///
/// Long enough for the signal auditor's reversal lookback (40 bars) and the
/// pullback close-confirmation window (20 bars).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub ema20: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// 4-hour timeframe context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongerTermContext {
    pub ema20: f64,
    pub ema50: f64,
    pub ema200: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub current_volume: f64,
    pub average_volume: f64,
    pub macd_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,
}

/// Immutable per-symbol market snapshot.
///
/// Every field is derived from data strictly earlier than `fetched_at`.
/// Constructed by the market-data fetcher, consumed by the pipeline, and
/// discarded at the end of the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_15m: f64,
    pub price_change_30m: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub price_change_24h: f64,
    /// Latest short-timeframe scalars.
    pub ema20: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub rsi7: f64,
    pub rsi14: f64,
    pub open_interest: OpenInterest,
    pub funding_rate: f64,
    pub intraday: IntradaySeries,
    pub longer_term: LongerTermContext,
    pub fetched_at: DateTime<Utc>,
}

impl MarketData {
    /// ATR14 on the 4h timeframe as a percentage of the current price —
    /// the primary volatility scalar of the pipeline.
    pub fn atr_pct(&self) -> f64 {
        if self.current_price > 0.0 {
            self.longer_term.atr14 / self.current_price * 100.0
        } else {
            0.0
        }
    }

    /// 4h volume change vs the average, percent. `None` without an average.
    pub fn volume_change_pct(&self) -> Option<f64> {
        let avg = self.longer_term.average_volume;
        if avg > 0.0 {
            Some((self.longer_term.current_volume - avg) / avg * 100.0)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Extended data
// ---------------------------------------------------------------------------

/// Best-effort auxiliary data; any sub-record may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedData {
    pub symbol: String,
    pub derivatives: Option<DerivativesData>,
    pub liquidation: Option<LiquidationData>,
    pub sentiment: Option<SentimentData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativesData {
    /// Open-interest change over 4h, percent.
    pub oi_change_4h: f64,
    /// Open-interest change over 24h, percent.
    pub oi_change_24h: f64,
    pub funding_rate_trend: FundingTrend,
    pub current_funding: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationData {
    /// Long liquidation zones below price, sorted ascending by price.
    pub long_zones: Vec<LiqZone>,
    /// Short liquidation zones above price, sorted ascending by price.
    pub short_zones: Vec<LiqZone>,
    pub tilt: LiquidationTilt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LiqZone {
    pub price: f64,
    /// Estimated USD volume of resting orders near the zone.
    pub volume_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationTilt {
    LongHeavy,
    ShortHeavy,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentData {
    /// 0 = extreme fear, 100 = extreme greed.
    pub fear_greed_index: u8,
    pub social_sentiment: SocialSentiment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialSentiment {
    Bullish,
    Bearish,
    Neutral,
}

// ---------------------------------------------------------------------------
// Streaming tickers
// ---------------------------------------------------------------------------

/// Latest 24h ticker for one symbol, as maintained by the streaming tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    /// 24h quote volume — the ranking key.
    pub quote_volume: f64,
    pub price_change_pct: f64,
    pub event_time: i64,
}

/// Serde helper accepting string- or number-encoded floats, as the exchange
/// mixes both across REST and stream payloads.
pub mod flex {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;

    struct FlexF64;

    impl Visitor<'_> for FlexF64 {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a float or a string-encoded float")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            v.parse().map_err(|_| de::Error::custom(format!("invalid float: {v:?}")))
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        d.deserialize_any(FlexF64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, serde::Deserialize)]
    struct FlexProbe {
        #[serde(deserialize_with = "flex::f64")]
        value: f64,
    }

    #[test]
    fn flex_accepts_string_and_number() {
        let s: FlexProbe = serde_json::from_str(r#"{"value":"42.5"}"#).unwrap();
        assert_eq!(s.value, 42.5);
        let n: FlexProbe = serde_json::from_str(r#"{"value":42.5}"#).unwrap();
        assert_eq!(n.value, 42.5);
        let i: FlexProbe = serde_json::from_str(r#"{"value":7}"#).unwrap();
        assert_eq!(i.value, 7.0);
        assert!(serde_json::from_str::<FlexProbe>(r#"{"value":"abc"}"#).is_err());
    }

    #[test]
    fn atr_pct_guards_zero_price() {
        let mut data = MarketData {
            symbol: "BTCUSDT".into(),
            current_price: 0.0,
            price_change_15m: 0.0,
            price_change_30m: 0.0,
            price_change_1h: 0.0,
            price_change_4h: 0.0,
            price_change_24h: 0.0,
            ema20: 0.0,
            macd: 0.0,
            macd_signal: 0.0,
            rsi7: 50.0,
            rsi14: 50.0,
            open_interest: OpenInterest::default(),
            funding_rate: 0.0,
            intraday: IntradaySeries::default(),
            longer_term: LongerTermContext::default(),
            fetched_at: Utc::now(),
        };
        assert_eq!(data.atr_pct(), 0.0);
        data.current_price = 110_500.0;
        data.longer_term.atr14 = 900.0;
        assert!((data.atr_pct() - 0.8144).abs() < 0.001);
    }
}
