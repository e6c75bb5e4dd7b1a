pub mod ema;

pub use ema::{Ema, IndicatorPoint, TrendIndicator, TrendPoints, TrendTrack};
