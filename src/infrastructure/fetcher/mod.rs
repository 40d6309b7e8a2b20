pub mod binance;

pub use binance::BinanceFetcher;
