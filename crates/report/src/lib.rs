pub mod aggregate;
pub mod render;

pub use aggregate::{
    FailedRun, OverallStats, PerformanceAggregator, Report, ReportConfig, RunSummary,
    TimeframeSummary,
};
pub use render::{print_summary, save_json, write_summary};
