//! Pure computation module for technical indicators.
//!
//! No I/O, no side effects. Takes close/OHLC slices and returns indicator
//! values. This module is the single source of numeric truth: the regime and
//! signal stages must not re-derive indicators with different conventions.
//!
//! Conventions:
//! - EMA seeds with the SMA of the first `period` samples, multiplier
//!   `2 / (period + 1)`.
//! - RSI and ATR use Wilder smoothing `avg' = (avg * (p - 1) + x) / p`.
//! - Short inputs return zero; callers treat zero as "not yet meaningful".
//! - Full-series variants are O(n), full-length with zeros before the first
//!   defined index, and agree with the scalar forms at the final index.

use crate::types::Kline;

/// Exponential moving average of the final sample.
pub fn ema(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period {
        return 0.0;
    }

    let mut value: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    let k = 2.0 / (period as f64 + 1.0);
    for &close in &closes[period..] {
        value = (close - value) * k + value;
    }
    value
}

/// Full EMA series; zeros before index `period - 1`.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let mut result = vec![0.0; closes.len()];
    let mut value: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    result[period - 1] = value;

    let k = 2.0 / (period as f64 + 1.0);
    for i in period..closes.len() {
        value = (closes[i] - value) * k + value;
        result[i] = value;
    }
    result
}

/// MACD line at the final sample: EMA12 − EMA26.
pub fn macd(closes: &[f64]) -> f64 {
    if closes.len() < 26 {
        return 0.0;
    }
    ema(closes, 12) - ema(closes, 26)
}

/// Full MACD series; zeros before index 25.
pub fn macd_series(closes: &[f64]) -> Vec<f64> {
    if closes.len() < 26 {
        return Vec::new();
    }

    let fast = ema_series(closes, 12);
    let slow = ema_series(closes, 26);
    let mut result = vec![0.0; closes.len()];
    for i in 25..closes.len() {
        result[i] = fast[i] - slow[i];
    }
    result
}

/// Signal line at the final sample: EMA9 of the MACD series.
pub fn macd_signal(closes: &[f64]) -> f64 {
    let series = macd_series(closes);
    if series.len() < 26 + 8 {
        return 0.0;
    }
    ema(&series[25..], 9)
}

/// Relative strength index with Wilder smoothing. 100 when the average loss
/// is zero; 0 on insufficient data.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() <= period {
        return 0.0;
    }

    let (mut avg_gain, mut avg_loss) = initial_averages(closes, period);
    let p = period as f64;
    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) - change) / p;
        }
    }

    rsi_from_averages(avg_gain, avg_loss)
}

/// Full RSI series; zeros before index `period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut result = vec![0.0; closes.len()];
    let (mut avg_gain, mut avg_loss) = initial_averages(closes, period);
    result[period] = rsi_from_averages(avg_gain, avg_loss);

    let p = period as f64;
    for i in period + 1..closes.len() {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) - change) / p;
        }
        result[i] = rsi_from_averages(avg_gain, avg_loss);
    }
    result
}

fn initial_averages(closes: &[f64], period: usize) -> (f64, f64) {
    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in closes[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    (gains / period as f64, losses / period as f64)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Average true range with Wilder smoothing over OHLC klines.
///
/// `TR = max(H−L, |H−prevC|, |L−prevC|)`; zero on insufficient data.
pub fn atr(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() <= period {
        return 0.0;
    }

    let true_ranges: Vec<f64> = klines
        .windows(2)
        .map(|w| {
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - w[0].close).abs();
            let lc = (w[1].low - w[0].close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let p = period as f64;
    let mut value: f64 = true_ranges[..period].iter().sum::<f64>() / p;
    for &tr in &true_ranges[period..] {
        value = (value * (p - 1.0) + tr) / p;
    }
    value
}
