pub mod binance;
pub mod loader;
pub mod store;

pub use binance::BinanceClient;
pub use loader::CandleLoader;
pub use store::{CacheMeta, KlineStore};
