pub mod calendar;
pub mod live;
pub mod sim;

pub use calendar::{is_rollover_day, term_day};
pub use live::{BrokerGateway, GatewayMessage, LiveBroker};
pub use sim::SimBroker;
