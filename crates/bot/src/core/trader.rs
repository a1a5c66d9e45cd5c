//! The trader port: the capability set the pipeline is written against.
//!
//! Two implementations coexist behind this trait: a live exchange adapter
//! (an external collaborator) and the local simulator in `mock_trader`. The
//! pipeline never names an implementation.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::types::{Balance, OrderAck, Position, PositionSide};

#[async_trait]
pub trait TraderPort: Send + Sync {
    /// Current balances. Implementations may piggyback bookkeeping on this
    /// call (the simulator sweeps stops and take-profits here).
    async fn get_balance(&self) -> Result<Balance, EngineError>;

    async fn get_positions(&self) -> Result<Vec<Position>, EngineError>;

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, EngineError>;

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, EngineError>;

    /// Close a long; `quantity` of 0 closes the whole position.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck, EngineError>;

    /// Close a short; `quantity` of 0 closes the whole position.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck, EngineError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<(), EngineError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        take_profit_price: f64,
    ) -> Result<(), EngineError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), EngineError>;

    /// Render a quantity at the venue's precision for the symbol.
    async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, EngineError>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64, EngineError>;
}
