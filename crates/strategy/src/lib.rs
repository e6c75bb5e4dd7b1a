pub mod config;
pub mod indicators;
pub mod patterns;

pub use config::{EngineConfig, StrategyFileConfig};
pub use indicators::{IndicatorPoint, TrendIndicator, TrendTrack};
pub use patterns::{PatternDetector, PatternSet, PatternSignal};
