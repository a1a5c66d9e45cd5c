use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        })
    }
}

/// One open perpetual position as reported by the trader port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    /// Unrealized PnL in quote currency.
    pub unrealized_pnl: f64,
    /// Unrealized PnL relative to the margin backing the position, percent.
    pub unrealized_pnl_pct: f64,
    pub open_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub liquidation_price: f64,
    pub margin_used: f64,
}

/// Account balances; money ledger fields stay decimal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    /// Wallet balance, excluding unrealized PnL.
    pub wallet: Decimal,
    pub available: Decimal,
    pub unrealized: Decimal,
}

impl Balance {
    pub fn total_equity(&self) -> Decimal {
        self.wallet + self.unrealized
    }
}

/// Acknowledgement for an accepted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: u64,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub price: f64,
}
