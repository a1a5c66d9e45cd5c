//! Local trading simulator: real prices, in-memory money.
//!
//! Books PnL against a decimal ledger while pulling live marks from the
//! exchange, so fills and sweeps track the venue faithfully. Every
//! `get_balance` call refreshes marks, advances the trailing-stop ladder and
//! auto-executes any triggered stop or take-profit. The account mutex is
//! never held across price I/O.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::trader::TraderPort;
use crate::errors::EngineError;
use crate::types::{Balance, OrderAck, Position, PositionSide};

/// Where the simulator asks for marks. The REST client implements this; the
/// tests pin prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<f64, EngineError>;
}

#[async_trait]
impl PriceSource for crate::core::market_data::ExchangeRest {
    async fn price(&self, symbol: &str) -> Result<f64, EngineError> {
        self.ticker_price(symbol).await
    }
}

#[derive(Debug, Clone)]
struct MockPosition {
    symbol: String,
    side: PositionSide,
    quantity: f64,
    entry_price: f64,
    mark_price: f64,
    unrealized_pnl: f64,
    leverage: u32,
    liquidation_price: f64,
    margin_used: Decimal,
    open_time: chrono::DateTime<Utc>,
    /// 0 = unset.
    stop_loss: f64,
    take_profit: f64,
}

impl MockPosition {
    fn margin_f64(&self) -> f64 {
        self.margin_used.to_f64().unwrap_or(0.0)
    }

    fn pnl_pct(&self) -> f64 {
        let margin = self.margin_f64();
        if margin > 0.0 {
            self.unrealized_pnl / margin * 100.0
        } else {
            0.0
        }
    }

    fn remark(&mut self, price: f64) {
        self.mark_price = price;
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        };
    }
}

struct MockAccount {
    wallet: Decimal,
    available: Decimal,
    positions: HashMap<String, MockPosition>,
    order_seq: u64,
}

pub struct MockTrader {
    account: Mutex<MockAccount>,
    prices: Arc<dyn PriceSource>,
}

fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{side}")
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Trailing-stop ladder: once profit (vs margin) reaches 2%, lock in a
/// stepped fraction of it. Bands tighten as profit grows:
/// 2–5%: 2%-steps locking the previous rung; 5–10%: 1.5%-steps from 4%;
/// 10%+: 1%-steps from 8.5%.
pub(crate) fn trailing_locked_profit_pct(profit_pct: f64) -> Option<f64> {
    if profit_pct < 2.0 {
        return None;
    }
    let locked = if profit_pct < 5.0 {
        let stage = (profit_pct / 2.0) as i64;
        ((stage - 1) * 2) as f64
    } else if profit_pct < 10.0 {
        let stage = ((profit_pct - 5.0) / 1.5) as i64;
        4.0 + stage as f64 * 1.5
    } else {
        let stage = (profit_pct - 10.0) as i64;
        8.5 + stage as f64
    };
    Some(locked)
}

/// Stop price that locks `locked_pct` of profit (vs margin) for the side.
pub(crate) fn trailing_stop_price(
    entry_price: f64,
    side: PositionSide,
    locked_pct: f64,
    leverage: u32,
) -> f64 {
    // Profit is measured against margin; translate back to a price move.
    let price_move = locked_pct / 100.0 / leverage.max(1) as f64;
    match side {
        PositionSide::Long => entry_price * (1.0 + price_move),
        PositionSide::Short => entry_price * (1.0 - price_move),
    }
}

impl MockTrader {
    pub fn new(initial_balance: f64, prices: Arc<dyn PriceSource>) -> Self {
        Self {
            account: Mutex::new(MockAccount {
                wallet: to_decimal(initial_balance),
                available: to_decimal(initial_balance),
                positions: HashMap::new(),
                order_seq: 1_000_000,
            }),
            prices,
        }
    }

    /// Fetch fresh marks for every held symbol without holding the account
    /// lock across the awaits.
    async fn fresh_marks(&self) -> HashMap<String, f64> {
        let symbols: Vec<String> = {
            let account = self.account.lock().await;
            let mut symbols: Vec<String> = account
                .positions
                .values()
                .map(|p| p.symbol.clone())
                .collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        let mut marks = HashMap::new();
        for symbol in symbols {
            match self.prices.price(&symbol).await {
                Ok(price) if price > 0.0 => {
                    marks.insert(symbol, price);
                }
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "mark refresh failed, keeping last"),
            }
        }
        marks
    }

    /// Remark positions, advance trailing stops, execute triggered exits.
    /// Call with the fresh mark map; mutates under one lock acquisition.
    async fn sweep(&self, marks: &HashMap<String, f64>) -> Balance {
        let mut account = self.account.lock().await;

        // Remark and ratchet stops.
        for position in account.positions.values_mut() {
            if let Some(&price) = marks.get(&position.symbol) {
                position.remark(price);
            }

            if position.stop_loss > 0.0 {
                if let Some(locked) = trailing_locked_profit_pct(position.pnl_pct()) {
                    let candidate = trailing_stop_price(
                        position.entry_price,
                        position.side,
                        locked,
                        position.leverage,
                    );
                    let improves = match position.side {
                        PositionSide::Long => candidate > position.stop_loss,
                        PositionSide::Short => candidate < position.stop_loss,
                    };
                    if improves {
                        info!(
                            symbol = %position.symbol,
                            side = %position.side,
                            old_stop = position.stop_loss,
                            new_stop = candidate,
                            locked_pct = locked,
                            "trailing stop raised"
                        );
                        position.stop_loss = candidate;
                    }
                }
            }
        }

        // Collect triggered exits, then execute them.
        let triggered: Vec<(String, &'static str)> = account
            .positions
            .iter()
            .filter_map(|(key, p)| {
                let stop_hit = p.stop_loss > 0.0
                    && match p.side {
                        PositionSide::Long => p.mark_price <= p.stop_loss,
                        PositionSide::Short => p.mark_price >= p.stop_loss,
                    };
                let tp_hit = p.take_profit > 0.0
                    && match p.side {
                        PositionSide::Long => p.mark_price >= p.take_profit,
                        PositionSide::Short => p.mark_price <= p.take_profit,
                    };
                if stop_hit {
                    Some((key.clone(), "stop_loss"))
                } else if tp_hit {
                    Some((key.clone(), "take_profit"))
                } else {
                    None
                }
            })
            .collect();

        for (key, trigger) in triggered {
            if let Some(position) = account.positions.remove(&key) {
                let realized = to_decimal(position.unrealized_pnl);
                account.wallet += realized;
                account.available += position.margin_used + realized;
                info!(
                    symbol = %position.symbol,
                    side = %position.side,
                    trigger,
                    entry = position.entry_price,
                    exit = position.mark_price,
                    realized = %realized,
                    "simulator auto-close"
                );
            }
        }

        if account.wallet < Decimal::ZERO {
            account.wallet = Decimal::ZERO;
            account.available = Decimal::ZERO;
        }

        let unrealized: f64 = account.positions.values().map(|p| p.unrealized_pnl).sum();
        Balance {
            wallet: account.wallet,
            available: account.available,
            unrealized: to_decimal(unrealized),
        }
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, EngineError> {
        if quantity <= 0.0 || leverage == 0 {
            return Err(EngineError::Trader {
                reason: "quantity and leverage must be positive".into(),
            });
        }
        let entry_price = self.prices.price(symbol).await?;
        if entry_price <= 0.0 {
            return Err(EngineError::DataUnavailable {
                name: format!("{symbol} price"),
            });
        }

        let mut account = self.account.lock().await;
        let key = position_key(symbol, side);
        if account.positions.contains_key(&key) {
            return Err(EngineError::Trader {
                reason: format!("{symbol} already has a {side} position"),
            });
        }

        let margin = to_decimal(quantity * entry_price / leverage as f64);
        if margin > account.available {
            return Err(EngineError::Trader {
                reason: format!(
                    "insufficient balance: need {margin}, available {}",
                    account.available
                ),
            });
        }

        // Simple approximation: 90% of the full 1/leverage move.
        let margin_band = entry_price / leverage as f64 * 0.9;
        let liquidation_price = match side {
            PositionSide::Long => entry_price - margin_band,
            PositionSide::Short => entry_price + margin_band,
        };

        account.available -= margin;
        account.order_seq += 1;
        let order_id = account.order_seq;

        account.positions.insert(
            key,
            MockPosition {
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price,
                mark_price: entry_price,
                unrealized_pnl: 0.0,
                leverage,
                liquidation_price,
                margin_used: margin,
                open_time: Utc::now(),
                stop_loss: 0.0,
                take_profit: 0.0,
            },
        );

        info!(
            symbol,
            %side,
            quantity,
            entry_price,
            leverage,
            margin = %margin,
            "simulator open"
        );

        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            price: entry_price,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<OrderAck, EngineError> {
        let exit_price = self.prices.price(symbol).await?;

        let mut account = self.account.lock().await;
        let key = position_key(symbol, side);
        let mut position = account
            .positions
            .remove(&key)
            .ok_or_else(|| EngineError::Trader {
                reason: format!("no {side} position on {symbol}"),
            })?;

        if exit_price > 0.0 {
            position.remark(exit_price);
        }
        let realized = to_decimal(position.unrealized_pnl);
        account.wallet += realized;
        account.available += position.margin_used + realized;
        if account.wallet < Decimal::ZERO {
            account.wallet = Decimal::ZERO;
            account.available = Decimal::ZERO;
        }

        account.order_seq += 1;
        let order_id = account.order_seq;

        info!(
            symbol,
            %side,
            entry = position.entry_price,
            exit = position.mark_price,
            realized = %realized,
            "simulator close"
        );

        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity: position.quantity,
            price: position.mark_price,
        })
    }

    fn to_position(p: &MockPosition) -> Position {
        Position {
            symbol: p.symbol.clone(),
            side: p.side,
            entry_price: p.entry_price,
            mark_price: p.mark_price,
            quantity: p.quantity,
            leverage: p.leverage,
            unrealized_pnl: p.unrealized_pnl,
            unrealized_pnl_pct: p.pnl_pct(),
            open_time: p.open_time,
            stop_loss: (p.stop_loss > 0.0).then_some(p.stop_loss),
            take_profit: (p.take_profit > 0.0).then_some(p.take_profit),
            liquidation_price: p.liquidation_price,
            margin_used: p.margin_f64(),
        }
    }
}

#[async_trait]
impl TraderPort for MockTrader {
    async fn get_balance(&self) -> Result<Balance, EngineError> {
        let marks = self.fresh_marks().await;
        Ok(self.sweep(&marks).await)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, EngineError> {
        let marks = self.fresh_marks().await;
        let mut account = self.account.lock().await;
        for position in account.positions.values_mut() {
            if let Some(&price) = marks.get(&position.symbol) {
                position.remark(price);
            }
        }
        Ok(account.positions.values().map(Self::to_position).collect())
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, EngineError> {
        self.open_position(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderAck, EngineError> {
        self.open_position(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, _quantity: f64) -> Result<OrderAck, EngineError> {
        // The simulator always closes the whole position.
        self.close_position(symbol, PositionSide::Long).await
    }

    async fn close_short(&self, symbol: &str, _quantity: f64) -> Result<OrderAck, EngineError> {
        self.close_position(symbol, PositionSide::Short).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        info!(symbol, leverage, "simulator leverage set");
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: f64,
        stop_price: f64,
    ) -> Result<(), EngineError> {
        let mut account = self.account.lock().await;
        let position = account
            .positions
            .get_mut(&position_key(symbol, side))
            .ok_or_else(|| EngineError::Trader {
                reason: format!("no {side} position on {symbol}"),
            })?;
        position.stop_loss = stop_price;
        info!(symbol, %side, stop_price, "simulator stop set");
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: f64,
        take_profit_price: f64,
    ) -> Result<(), EngineError> {
        let mut account = self.account.lock().await;
        let position = account
            .positions
            .get_mut(&position_key(symbol, side))
            .ok_or_else(|| EngineError::Trader {
                reason: format!("no {side} position on {symbol}"),
            })?;
        position.take_profit = take_profit_price;
        info!(symbol, %side, take_profit_price, "simulator take-profit set");
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), EngineError> {
        info!(symbol, "simulator cancel-all (no-op)");
        Ok(())
    }

    async fn format_quantity(&self, _symbol: &str, quantity: f64) -> Result<String, EngineError> {
        Ok(format!("{quantity:.4}"))
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, EngineError> {
        self.prices.price(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    struct StaticPrices {
        prices: StdMutex<HashMap<String, f64>>,
    }

    impl StaticPrices {
        fn new(pairs: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                prices: StdMutex::new(
                    pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
                ),
            })
        }

        fn set(&self, symbol: &str, price: f64) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }
    }

    #[async_trait]
    impl PriceSource for StaticPrices {
        async fn price(&self, symbol: &str) -> Result<f64, EngineError> {
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| EngineError::DataUnavailable {
                    name: symbol.to_string(),
                })
        }
    }

    #[tokio::test]
    async fn open_books_margin_and_close_realizes_pnl() {
        let prices = StaticPrices::new(&[("SOLUSDT", 100.0)]);
        let trader = MockTrader::new(1_000.0, prices.clone());

        trader.open_long("SOLUSDT", 10.0, 10).await.unwrap();
        // Margin = 10 × 100 / 10 = 100.
        let balance = trader.get_balance().await.unwrap();
        assert_eq!(balance.wallet, dec!(1000));
        assert_eq!(balance.available, dec!(900));

        prices.set("SOLUSDT", 105.0);
        let balance = trader.get_balance().await.unwrap();
        assert_eq!(balance.unrealized, dec!(50));

        let ack = trader.close_long("SOLUSDT", 0.0).await.unwrap();
        assert_eq!(ack.price, 105.0);
        let balance = trader.get_balance().await.unwrap();
        assert_eq!(balance.wallet, dec!(1050));
        assert_eq!(balance.available, dec!(1050));
        assert!(trader.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_positions_are_rejected() {
        let prices = StaticPrices::new(&[("SOLUSDT", 100.0)]);
        let trader = MockTrader::new(1_000.0, prices);

        trader.open_short("SOLUSDT", 1.0, 5).await.unwrap();
        assert!(trader.open_short("SOLUSDT", 1.0, 5).await.is_err());
        assert!(trader.close_long("SOLUSDT", 0.0).await.is_err());
    }

    #[tokio::test]
    async fn insufficient_margin_is_rejected() {
        let prices = StaticPrices::new(&[("BTCUSDT", 100_000.0)]);
        let trader = MockTrader::new(100.0, prices);
        // Margin would be 1 × 100000 / 10 = 10000.
        assert!(trader.open_long("BTCUSDT", 1.0, 10).await.is_err());
    }

    #[tokio::test]
    async fn stop_loss_sweep_closes_long() {
        let prices = StaticPrices::new(&[("SOLUSDT", 100.0)]);
        let trader = MockTrader::new(1_000.0, prices.clone());

        trader.open_long("SOLUSDT", 10.0, 10).await.unwrap();
        trader
            .set_stop_loss("SOLUSDT", PositionSide::Long, 10.0, 95.0)
            .await
            .unwrap();

        prices.set("SOLUSDT", 94.0);
        let balance = trader.get_balance().await.unwrap();
        // Auto-closed at the mark: realized −60, margin released.
        assert!(trader.get_positions().await.unwrap().is_empty());
        assert_eq!(balance.wallet, dec!(940));
        assert_eq!(balance.available, dec!(940));
    }

    #[tokio::test]
    async fn take_profit_sweep_closes_short() {
        let prices = StaticPrices::new(&[("OPUSDT", 2.0)]);
        let trader = MockTrader::new(1_000.0, prices.clone());

        trader.open_short("OPUSDT", 100.0, 5).await.unwrap();
        trader
            .set_take_profit("OPUSDT", PositionSide::Short, 100.0, 1.8)
            .await
            .unwrap();

        prices.set("OPUSDT", 1.75);
        trader.get_balance().await.unwrap();
        assert!(trader.get_positions().await.unwrap().is_empty());
        let balance = trader.get_balance().await.unwrap();
        assert_eq!(balance.wallet, dec!(1025));
    }

    #[tokio::test]
    async fn trailing_ladder_locks_profit_in_stages() {
        assert_eq!(trailing_locked_profit_pct(1.9), None);
        assert_eq!(trailing_locked_profit_pct(2.5), Some(0.0));
        assert_eq!(trailing_locked_profit_pct(4.2), Some(2.0));
        assert_eq!(trailing_locked_profit_pct(5.5), Some(4.0));
        assert_eq!(trailing_locked_profit_pct(7.0), Some(5.5));
        assert_eq!(trailing_locked_profit_pct(8.6), Some(7.0));
        assert_eq!(trailing_locked_profit_pct(10.0), Some(8.5));
        assert_eq!(trailing_locked_profit_pct(12.3), Some(10.5));
    }

    #[tokio::test]
    async fn trailing_stop_only_improves() {
        let prices = StaticPrices::new(&[("SOLUSDT", 100.0)]);
        let trader = MockTrader::new(1_000.0, prices.clone());

        trader.open_long("SOLUSDT", 10.0, 10).await.unwrap();
        trader
            .set_stop_loss("SOLUSDT", PositionSide::Long, 10.0, 95.0)
            .await
            .unwrap();

        // +1% price at 10× = +10% on margin: the ladder locks 8.5%,
        // i.e. a stop at entry × (1 + 0.085/10) = 100.85.
        prices.set("SOLUSDT", 101.0);
        trader.get_balance().await.unwrap();
        let positions = trader.get_positions().await.unwrap();
        let stop = positions[0].stop_loss.unwrap();
        assert!((stop - 100.85).abs() < 1e-9, "stop was {stop}");

        // Price easing back does not lower the stop…
        prices.set("SOLUSDT", 100.9);
        trader.get_balance().await.unwrap();
        // …it triggers it: 100.9 > 100.85 keeps the position.
        let positions = trader.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].stop_loss.unwrap(), 100.85);

        // Falling through the ratcheted stop closes in profit.
        prices.set("SOLUSDT", 100.5);
        let balance = trader.get_balance().await.unwrap();
        assert!(trader.get_positions().await.unwrap().is_empty());
        assert_eq!(balance.wallet, dec!(1005));
    }

    #[tokio::test]
    async fn wallet_floors_at_zero() {
        let prices = StaticPrices::new(&[("SOLUSDT", 100.0)]);
        let trader = MockTrader::new(50.0, prices.clone());

        trader.open_long("SOLUSDT", 5.0, 10).await.unwrap();
        prices.set("SOLUSDT", 80.0); // −100 on a 50 wallet
        trader.close_long("SOLUSDT", 0.0).await.unwrap();
        let balance = trader.get_balance().await.unwrap();
        assert_eq!(balance.wallet, Decimal::ZERO);
        assert_eq!(balance.available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn format_quantity_uses_four_decimals() {
        let prices = StaticPrices::new(&[]);
        let trader = MockTrader::new(100.0, prices);
        assert_eq!(
            trader.format_quantity("SOLUSDT", 1.23456).await.unwrap(),
            "1.2346"
        );
    }
}
