use thiserror::Error;

use crate::Timeframe;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, unsorted or gappy candle data. Fatal for one run only.
    #[error("Data integrity error for {symbol}/{timeframe}: {reason}")]
    DataIntegrity {
        symbol: String,
        timeframe: Timeframe,
        reason: String,
    },

    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
