use serde::{Deserialize, Serialize};

use crate::market::{EodEvent, MarketRecord};
use crate::orders::{OrderEvent, OrderUpdateEvent};
use crate::portfolio::{Account, PositionUpdate};
use crate::signals::SignalEvent;
use crate::trades::{CommissionEvent, Trade};

/// Value published on a queued bus topic. Copied to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Data(MarketRecord),
    OrderBook(MarketRecord),
    Signal(SignalEvent),
    SignalUpdate(SignalEvent),
    Order(OrderEvent),
    Trade(Trade),
    TradeCommission(CommissionEvent),
    PositionUpdate(PositionUpdate),
    AccountUpdate(Account),
    OrderUpdate(OrderUpdateEvent),
    Eod(EodEvent),
    /// Sentinel delivered to every blocked consumer when the process-wide
    /// shutdown latch is set.
    Shutdown,
}

impl Event {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Event::Shutdown)
    }
}
