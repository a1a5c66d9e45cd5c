//! Exchange REST access and per-symbol market snapshot assembly.
//!
//! `ExchangeRest` is the only way HTTP leaves this process for market data:
//! every call waits on the shared host-keyed rate limiter, uses the bounded
//! client timeout, and surfaces non-2xx responses as typed errors — never as
//! silent zeros. `MarketDataFetcher` pulls the kline/OI/funding legs and
//! delegates all math to the indicator library.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::config::ExchangeConfig;
use crate::core::indicators;
use crate::core::rate_limiter::RateLimiter;
use crate::errors::EngineError;
use crate::types::market_data::flex;
use crate::types::{IntradaySeries, Kline, LongerTermContext, MarketData, OpenInterest};

/// Points kept in the intraday series.
const INTRADAY_KEEP: usize = 60;
/// 3m klines fetched per snapshot.
const INTRADAY_FETCH: u32 = 120;
/// 4h klines fetched per snapshot; enough for EMA200.
const LONG_TERM_FETCH: u32 = 220;

/// Normalize a symbol to its USDT perpetual form.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    /// (price, quantity), best bid first.
    pub bids: Vec<(f64, f64)>,
    /// (price, quantity), best ask first.
    pub asks: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    pub quote_volume: f64,
    pub price_change_pct: f64,
}

#[derive(Debug, Clone)]
pub struct OiHistPoint {
    pub timestamp: i64,
    pub open_interest: f64,
}

#[derive(Debug, Clone)]
pub struct SymbolFilter {
    pub symbol: String,
    pub contract_type: String,
    pub quantity_precision: u32,
}

pub struct ExchangeRest {
    http: reqwest::Client,
    base_url: String,
    host: String,
    limiter: Arc<RateLimiter>,
}

impl ExchangeRest {
    pub fn new(config: &ExchangeConfig, limiter: Arc<RateLimiter>) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_seconds))
            .build()?;

        let base_url = config.rest_base_url.trim_end_matches('/').to_string();
        let host = base_url
            .strip_prefix("https://")
            .or_else(|| base_url.strip_prefix("http://"))
            .unwrap_or(&base_url)
            .split('/')
            .next()
            .unwrap_or(&base_url)
            .to_string();

        Ok(Self {
            http,
            base_url,
            host,
            limiter,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        self.limiter.acquire(&self.host).await;

        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Exchange {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// Kline series, oldest first.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, EngineError> {
        let raw: Vec<Vec<serde_json::Value>> = self
            .get(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}"
            ))
            .await?;

        raw.iter().map(|row| parse_kline(row)).collect()
    }

    pub async fn open_interest(&self, symbol: &str) -> Result<f64, EngineError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "openInterest", deserialize_with = "flex::f64")]
            open_interest: f64,
        }
        let r: Response = self
            .get(&format!("/fapi/v1/openInterest?symbol={symbol}"))
            .await?;
        Ok(r.open_interest)
    }

    /// Latest funding rate from the premium index.
    pub async fn funding_rate(&self, symbol: &str) -> Result<f64, EngineError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "lastFundingRate", deserialize_with = "flex::f64")]
            last_funding_rate: f64,
        }
        let r: Response = self
            .get(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        Ok(r.last_funding_rate)
    }

    /// Recent funding settlements, oldest first.
    pub async fn funding_rate_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<f64>, EngineError> {
        #[derive(Deserialize)]
        struct Point {
            #[serde(rename = "fundingRate", deserialize_with = "flex::f64")]
            funding_rate: f64,
        }
        let points: Vec<Point> = self
            .get(&format!("/fapi/v1/fundingRate?symbol={symbol}&limit={limit}"))
            .await?;
        Ok(points.into_iter().map(|p| p.funding_rate).collect())
    }

    /// Open-interest history at the given period (e.g. `5m`), oldest first.
    pub async fn open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        limit: u32,
    ) -> Result<Vec<OiHistPoint>, EngineError> {
        #[derive(Deserialize)]
        struct Point {
            timestamp: i64,
            #[serde(rename = "sumOpenInterest", deserialize_with = "flex::f64")]
            sum_open_interest: f64,
        }
        let points: Vec<Point> = self
            .get(&format!(
                "/futures/data/openInterestHist?symbol={symbol}&period={period}&limit={limit}"
            ))
            .await?;
        Ok(points
            .into_iter()
            .map(|p| OiHistPoint {
                timestamp: p.timestamp,
                open_interest: p.sum_open_interest,
            })
            .collect())
    }

    pub async fn depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, EngineError> {
        #[derive(Deserialize)]
        struct Response {
            bids: Vec<Vec<String>>,
            asks: Vec<Vec<String>>,
        }
        let r: Response = self
            .get(&format!("/fapi/v1/depth?symbol={symbol}&limit={limit}"))
            .await?;
        Ok(DepthSnapshot {
            bids: parse_levels(&r.bids),
            asks: parse_levels(&r.asks),
        })
    }

    pub async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, EngineError> {
        let r: RawTicker24h = self
            .get(&format!("/fapi/v1/ticker/24hr?symbol={symbol}"))
            .await?;
        Ok(r.into())
    }

    /// 24h stats for every symbol — the volume-sorted snapshot fallback.
    pub async fn all_tickers_24h(&self) -> Result<Vec<Ticker24h>, EngineError> {
        let raw: Vec<RawTicker24h> = self.get("/fapi/v1/ticker/24hr").await?;
        Ok(raw.into_iter().map(Into::into).collect())
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, EngineError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(deserialize_with = "flex::f64")]
            price: f64,
        }
        let r: Response = self
            .get(&format!("/fapi/v1/ticker/price?symbol={symbol}"))
            .await?;
        Ok(r.price)
    }

    /// Listing filters for USDT perpetuals.
    pub async fn exchange_info(&self) -> Result<Vec<SymbolFilter>, EngineError> {
        #[derive(Deserialize)]
        struct Info {
            symbols: Vec<RawSymbol>,
        }
        #[derive(Deserialize)]
        struct RawSymbol {
            symbol: String,
            #[serde(rename = "contractType", default)]
            contract_type: String,
            #[serde(rename = "quantityPrecision", default)]
            quantity_precision: u32,
        }
        let info: Info = self.get("/fapi/v1/exchangeInfo").await?;
        Ok(info
            .symbols
            .into_iter()
            .map(|s| SymbolFilter {
                symbol: s.symbol,
                contract_type: s.contract_type,
                quantity_precision: s.quantity_precision,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct RawTicker24h {
    symbol: String,
    #[serde(rename = "lastPrice", deserialize_with = "flex::f64")]
    last_price: f64,
    #[serde(rename = "quoteVolume", deserialize_with = "flex::f64")]
    quote_volume: f64,
    #[serde(rename = "priceChangePercent", deserialize_with = "flex::f64")]
    price_change_percent: f64,
}

impl From<RawTicker24h> for Ticker24h {
    fn from(r: RawTicker24h) -> Self {
        Ticker24h {
            symbol: r.symbol,
            last_price: r.last_price,
            quote_volume: r.quote_volume,
            price_change_pct: r.price_change_percent,
        }
    }
}

fn parse_levels(levels: &[Vec<String>]) -> Vec<(f64, f64)> {
    levels
        .iter()
        .filter_map(|level| {
            let price = level.first()?.parse().ok()?;
            let qty = level.get(1)?.parse().ok()?;
            Some((price, qty))
        })
        .collect()
}

fn parse_kline(row: &[serde_json::Value]) -> Result<Kline, EngineError> {
    fn number(v: Option<&serde_json::Value>) -> Option<f64> {
        match v? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    let parse = |idx: usize| {
        number(row.get(idx)).ok_or_else(|| EngineError::DataUnavailable {
            name: format!("kline field {idx}"),
        })
    };

    Ok(Kline {
        open_time: parse(0)? as i64,
        open: parse(1)?,
        high: parse(2)?,
        low: parse(3)?,
        close: parse(4)?,
        volume: parse(5)?,
        close_time: parse(6)? as i64,
    })
}

// ---------------------------------------------------------------------------
// Snapshot assembly
// ---------------------------------------------------------------------------

pub struct MarketDataFetcher {
    rest: Arc<ExchangeRest>,
}

impl MarketDataFetcher {
    pub fn new(rest: Arc<ExchangeRest>) -> Self {
        Self { rest }
    }

    /// Build the immutable per-symbol snapshot for this cycle.
    pub async fn get_market_data(&self, symbol: &str) -> Result<MarketData, EngineError> {
        let symbol = normalize_symbol(symbol);

        let klines_3m = self.rest.klines(&symbol, "3m", INTRADAY_FETCH).await?;
        let klines_4h = self.rest.klines(&symbol, "4h", LONG_TERM_FETCH).await?;

        // OI and funding are best-effort; a gap must not sink the snapshot.
        let open_interest = match self.rest.open_interest(&symbol).await {
            Ok(latest) => OpenInterest { latest },
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "open interest fetch failed");
                OpenInterest::default()
            }
        };
        let funding_rate = match self.rest.funding_rate(&symbol).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "funding rate fetch failed");
                0.0
            }
        };

        assemble(
            &symbol,
            &klines_3m,
            &klines_4h,
            open_interest,
            funding_rate,
            Utc::now(),
        )
    }
}

/// Assemble a snapshot from already-fetched legs. Pure; all indicator math
/// goes through the indicator library.
pub(crate) fn assemble(
    symbol: &str,
    klines_3m: &[Kline],
    klines_4h: &[Kline],
    open_interest: OpenInterest,
    funding_rate: f64,
    fetched_at: DateTime<Utc>,
) -> Result<MarketData, EngineError> {
    let closes_3m: Vec<f64> = klines_3m.iter().map(|k| k.close).collect();
    let current_price = closes_3m.last().copied().unwrap_or(0.0);
    if current_price <= 0.0 {
        return Err(EngineError::DataUnavailable {
            name: format!("{symbol} price"),
        });
    }

    Ok(MarketData {
        symbol: symbol.to_string(),
        current_price,
        price_change_15m: change_over_bars(&closes_3m, 5),
        price_change_30m: change_over_bars(&closes_3m, 10),
        price_change_1h: change_over_bars(&closes_3m, 20),
        price_change_4h: change_from_kline(klines_4h, 1, current_price),
        price_change_24h: change_from_kline(klines_4h, 6, current_price),
        ema20: indicators::ema(&closes_3m, 20),
        macd: indicators::macd(&closes_3m),
        macd_signal: indicators::macd_signal(&closes_3m),
        rsi7: indicators::rsi(&closes_3m, 7),
        rsi14: indicators::rsi(&closes_3m, 14),
        open_interest,
        funding_rate,
        intraday: build_intraday(&closes_3m),
        longer_term: build_longer_term(klines_4h),
        fetched_at,
    })
}

/// Percent change vs the close `bars` bars ago.
fn change_over_bars(closes: &[f64], bars: usize) -> f64 {
    if closes.len() <= bars {
        return 0.0;
    }
    let current = closes[closes.len() - 1];
    let previous = closes[closes.len() - 1 - bars];
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

/// Percent change of `current` vs the close `bars_back` completed 4h bars ago.
fn change_from_kline(klines: &[Kline], bars_back: usize, current: f64) -> f64 {
    if klines.len() <= bars_back {
        return 0.0;
    }
    let previous = klines[klines.len() - 1 - bars_back].close;
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

/// Trailing intraday arrays. Full series are computed once, then only the
/// tail is kept — the per-bar recompute would be O(n²).
fn build_intraday(closes: &[f64]) -> IntradaySeries {
    let ema20 = indicators::ema_series(closes, 20);
    let macd = indicators::macd_series(closes);
    let rsi7 = indicators::rsi_series(closes, 7);
    let rsi14 = indicators::rsi_series(closes, 14);

    let start = closes.len().saturating_sub(INTRADAY_KEEP);
    let tail = |series: &[f64]| -> Vec<f64> {
        if series.is_empty() {
            Vec::new()
        } else {
            series[start..].to_vec()
        }
    };

    IntradaySeries {
        mid_prices: closes[start..].to_vec(),
        ema20: tail(&ema20),
        macd: tail(&macd),
        rsi7: tail(&rsi7),
        rsi14: tail(&rsi14),
    }
}

fn build_longer_term(klines: &[Kline]) -> LongerTermContext {
    let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();

    let current_volume = klines.last().map(|k| k.volume).unwrap_or(0.0);
    let average_volume = if klines.is_empty() {
        0.0
    } else {
        klines.iter().map(|k| k.volume).sum::<f64>() / klines.len() as f64
    };

    let trailing_nonzero = |series: Vec<f64>| -> Vec<f64> {
        series
            .into_iter()
            .rev()
            .filter(|v| *v != 0.0)
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    };

    LongerTermContext {
        ema20: indicators::ema(&closes, 20),
        ema50: indicators::ema(&closes, 50),
        ema200: indicators::ema(&closes, 200),
        atr3: indicators::atr(klines, 3),
        atr14: indicators::atr(klines, 14),
        current_volume,
        average_volume,
        macd_series: trailing_nonzero(indicators::macd_series(&closes)),
        rsi14_series: trailing_nonzero(indicators::rsi_series(&closes, 14)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_klines(count: usize, step_ms: i64, base: f64, amplitude: f64) -> Vec<Kline> {
        (0..count)
            .map(|i| {
                let close = base + (i as f64 * 0.37).sin() * amplitude + i as f64 * 0.05;
                Kline {
                    open_time: i as i64 * step_ms,
                    open: close - 0.1,
                    high: close + amplitude * 0.2 + 0.2,
                    low: close - amplitude * 0.2 - 0.2,
                    close,
                    volume: 1_000.0 + (i as f64 * 1.1).cos().abs() * 500.0,
                    close_time: (i as i64 + 1) * step_ms - 1,
                }
            })
            .collect()
    }

    #[test]
    fn normalize_appends_usdt() {
        assert_eq!(normalize_symbol("sol"), "SOLUSDT");
        assert_eq!(normalize_symbol("SOLUSDT"), "SOLUSDT");
        assert_eq!(normalize_symbol(" btc "), "BTCUSDT");
    }

    #[test]
    fn assemble_holds_snapshot_invariants() {
        let k3 = synthetic_klines(120, 180_000, 100.0, 2.0);
        let k4 = synthetic_klines(220, 14_400_000, 100.0, 4.0);
        let data = assemble(
            "SOLUSDT",
            &k3,
            &k4,
            OpenInterest { latest: 1_000_000.0 },
            0.0001,
            Utc::now(),
        )
        .unwrap();

        assert!(data.current_price > 0.0);
        for rsi in [data.rsi7, data.rsi14] {
            assert!((0.0..=100.0).contains(&rsi));
        }
        assert!(data.longer_term.atr3 >= 0.0);
        assert!(data.longer_term.atr14 >= 0.0);
        for delta in [
            data.price_change_15m,
            data.price_change_30m,
            data.price_change_1h,
            data.price_change_4h,
            data.price_change_24h,
        ] {
            assert!(delta.is_finite());
        }
        assert_eq!(data.intraday.mid_prices.len(), 60);
        assert_eq!(data.intraday.rsi7.len(), 60);
        // Scalars agree with the tail of the series forms.
        assert!((data.ema20 - data.intraday.ema20.last().unwrap()).abs() < 1e-9);
        assert!((data.rsi7 - data.intraday.rsi7.last().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn assemble_rejects_empty_series() {
        let err = assemble(
            "SOLUSDT",
            &[],
            &[],
            OpenInterest::default(),
            0.0,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn short_history_yields_zero_deltas() {
        let k3 = synthetic_klines(8, 180_000, 100.0, 1.0);
        let k4 = synthetic_klines(3, 14_400_000, 100.0, 1.0);
        let data = assemble(
            "SOLUSDT",
            &k3,
            &k4,
            OpenInterest::default(),
            0.0,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(data.price_change_1h, 0.0);
        assert_eq!(data.price_change_24h, 0.0);
        // Not enough bars for EMA20 either; zero means "not yet meaningful".
        assert_eq!(data.ema20, 0.0);
    }

    #[test]
    fn parse_kline_accepts_mixed_encodings() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"100.5","101.2","99.8","100.9","1234.5",1700000179999,"0",0,"0","0","0"]"#,
        )
        .unwrap();
        let k = parse_kline(&row).unwrap();
        assert_eq!(k.open_time, 1_700_000_000_000);
        assert_eq!(k.close, 100.9);
        assert_eq!(k.volume, 1234.5);
    }
}
