pub mod session;
pub mod stats;

pub use session::{SessionAccumulator, SessionArtifact, SessionError, SessionWriter};
pub use stats::{
    drawdown_series, period_returns, static_stats, timeseries_stats, EquityPoint,
    RegressionStats, StaticStats, TimeseriesStats,
};
