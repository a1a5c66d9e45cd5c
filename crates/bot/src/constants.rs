//! Named thresholds of the decision pipeline.
//!
//! Every number a validator re-derives lives here, so the agents, the
//! auditors and the tests agree on a single source.

// ---------------------------------------------------------------------------
// Regime classification
// ---------------------------------------------------------------------------

/// ATR% below this is regime C (narrow range, no trading).
pub const ATR_PCT_QUIET: f64 = 1.0;

/// Volatility band boundaries used by the risk tables and leverage scaling.
pub const ATR_PCT_LOW: f64 = 2.0;
pub const ATR_PCT_MID: f64 = 4.0;

/// The model must echo the code-computed ATR% within this tolerance.
pub const ATR_PCT_ECHO_TOLERANCE: f64 = 0.01;

// ---------------------------------------------------------------------------
// Signal scoring
// ---------------------------------------------------------------------------

pub const SIGNAL_BASE_SCORE: i32 = 60;
pub const SIGNAL_PER_DIMENSION_SCORE: i32 = 10;
pub const SIGNAL_PERFECT_BONUS: i32 = 20;
/// Minimum re-verified dimensions for a valid signal.
pub const SIGNAL_MIN_DIMENSIONS: usize = 3;

/// Tolerance around the short-timeframe EMA20 for position checks.
pub const EMA20_TOLERANCE_PCT: f64 = 0.005;

/// Volume confirmation thresholds, percent vs the 4h average.
pub const VOLUME_EXPAND_THRESHOLD: f64 = 20.0;
pub const VOLUME_SHRINK_THRESHOLD: f64 = -50.0;

/// Funding rate (percent) above which a short earns the funding dimension.
pub const FUNDING_RATE_SHORT_THRESHOLD: f64 = 0.01;

/// RSI7 levels for the momentum reversal patterns.
pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERSOLD_RECOVERY: f64 = 35.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const RSI_COOLED: f64 = 65.0;
/// The pullback pattern requires a peak at least this high...
pub const RSI_PEAK_SIGNIFICANT: f64 = 72.0;
/// ...no further back than this many intraday bars.
pub const RSI_PEAK_MAX_DISTANCE: usize = 20;
/// Reversal lookback window, intraday bars.
pub const RSI_LOOKBACK_BARS: usize = 40;

/// Pullback confirmation: bars that must close back below the short EMA20.
pub const PULLBACK_CONFIRM_BARS: usize = 20;
/// Rebound search window before the confirmation bars.
pub const PULLBACK_REBOUND_LOOKBACK: usize = 60;
/// Window scanned for the 4h-band touch.
pub const PULLBACK_BAND_LOOKBACK: usize = 80;
/// Minimum overshoot above the band, as a fraction of the band floor...
pub const PULLBACK_MIN_OVERSHOOT_PCT: f64 = 0.003;
/// ...or as a multiple of the 4h ATR14, whichever is larger.
pub const PULLBACK_MIN_OVERSHOOT_ATR: f64 = 0.5;

/// Countertrend entries require this depth of oversold.
pub const COUNTERTREND_RSI_THRESHOLD: f64 = 25.0;

// ---------------------------------------------------------------------------
// Risk parameters
// ---------------------------------------------------------------------------

pub const MIN_STOP_MULTIPLE: f64 = 2.0;
pub const MAX_STOP_MULTIPLE: f64 = 8.0;
pub const MIN_TP_MULTIPLE: f64 = 6.0;
pub const MAX_TP_MULTIPLE: f64 = 20.0;
/// Allowed deviation of the model's stop multiple from the band expectation.
pub const STOP_MULTIPLE_TOLERANCE: f64 = 0.5;

pub const MIN_RISK_REWARD: f64 = 2.0;
/// R/R cross-check tolerance before and after a liquidation repair.
pub const RR_STRICT_TOLERANCE: f64 = 0.02;
pub const RR_FLOAT_TOLERANCE: f64 = 0.05;

/// Maintenance-margin factor in the liquidation price approximation.
pub const LIQUIDATION_MARGIN_RATE: f64 = 0.95;
/// When a stop crosses liquidation, it is pulled to this fraction of the
/// entry→liquidation gap away from the liquidation price.
pub const LIQUIDATION_SAFETY_RATIO: f64 = 0.3;

pub const COUNTERTREND_STOP_MULTIPLE: f64 = 1.5;
pub const COUNTERTREND_TP_MULTIPLE: f64 = 3.0;
pub const COUNTERTREND_MAX_LEVERAGE: u32 = 3;

/// Per-trade risk budget as a fraction of account equity.
pub const RISK_BUDGET_PER_TRADE: f64 = 0.02;
/// Fraction of the available balance usable as margin.
pub const MARGIN_USAGE_LIMIT: f64 = 0.9;

pub const CONFIDENCE_HIGH_MULTIPLIER: f64 = 1.2;
pub const CONFIDENCE_MEDIUM_MULTIPLIER: f64 = 1.0;
pub const CONFIDENCE_LOW_MULTIPLIER: f64 = 0.8;
pub const PULLBACK_RISK_FACTOR: f64 = 0.75;
pub const COUNTERTREND_RISK_FACTOR: f64 = 0.5;

// ---------------------------------------------------------------------------
// Prediction validation
// ---------------------------------------------------------------------------

pub const MAX_EXPECTED_MOVE_PCT: f64 = 10.0;
pub const MAX_CASE_PCT: f64 = 15.0;
/// A neutral call may not claim more conviction than this.
pub const NEUTRAL_MAX_PROBABILITY: f64 = 0.65;

/// Calibration kicks in once this many predictions have been evaluated.
pub const CALIBRATION_MIN_SAMPLES: usize = 30;
pub const CALIBRATION_MIN_MULTIPLIER: f64 = 0.8;
pub const CALIBRATION_MAX_MULTIPLIER: f64 = 1.2;

/// Timeframe defaulter boundaries on the 4h ATR%.
pub const TIMEFRAME_FAST_ATR_PCT: f64 = 4.0;
pub const TIMEFRAME_SLOW_ATR_PCT: f64 = 0.8;

// ---------------------------------------------------------------------------
// Position management
// ---------------------------------------------------------------------------

/// Forced-close RSI extremes against the position.
pub const FORCED_RSI_SHORT_EXIT: f64 = 75.0;
pub const FORCED_RSI_LONG_EXIT: f64 = 25.0;
/// Forced stop when unrealized PnL (vs margin) drops below this.
pub const FORCED_LOSS_PCT: f64 = -10.0;

/// No non-forced close inside this window after opening.
pub const BREATHING_ROOM_MINUTES: i64 = 30;

pub const PROFIT_TAKE_UNCONDITIONAL_PCT: f64 = 20.0;
pub const PROFIT_TAKE_REGIME_SHIFT_PCT: f64 = 15.0;
pub const PROFIT_TAKE_DECAY_PCT: f64 = 10.0;
pub const MATURE_STOP_PCT: f64 = -8.0;
