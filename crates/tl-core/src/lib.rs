pub mod engine;
pub mod host;
pub mod order_manager;
pub mod portfolio_server;
pub mod risk;
pub mod strategy;
pub mod tracker;

pub use engine::{Engine, RunOutcome, RunState};
pub use host::{QuarantineSlot, StrategyHost};
pub use order_manager::OrderManager;
pub use portfolio_server::{portfolio_handle, PortfolioHandle, PortfolioServer, PortfolioState};
pub use risk::{PassThroughRisk, PortfolioSnapshot, RiskModel, RiskRegistry};
pub use strategy::{Strategy, StrategyContext, StrategyRegistry};
pub use tracker::SignalTracker;
