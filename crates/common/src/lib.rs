pub mod config;
pub mod error;
pub mod exchange;
pub mod series;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::KlineSource;
pub use series::CandleSeries;
pub use types::*;
