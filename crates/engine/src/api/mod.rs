//! External market data APIs

pub mod binance;

pub use binance::BinanceClient;
