pub mod hyperliquid;

pub use hyperliquid::HyperliquidAdapter;
