pub mod bar;
pub mod timeframe;

pub use bar::{candle_interval_secs, OhlcvBar};
pub use timeframe::Timeframe;
