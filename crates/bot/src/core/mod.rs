pub mod anomaly_scanner;
pub mod constraints;
pub mod cycle;
pub mod extended_data;
pub mod indicators;
pub mod intelligence_agent;
pub mod market_data;
pub mod mock_trader;
pub mod position_agent;
pub mod prediction_agent;
pub mod prediction_store;
pub mod rate_limiter;
pub mod regime_agent;
pub mod risk_agent;
pub mod signal_agent;
pub mod ticker_tracker;
pub mod trade_memory;
pub mod trader;
