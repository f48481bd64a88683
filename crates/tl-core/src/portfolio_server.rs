//! Authoritative portfolio state.
//!
//! Positions, the active-order ledger, the account snapshot, and the trade
//! log live behind one lock and are maintained by a single consumer thread.
//! Everything else in the process reads through the shared handle and
//! tolerates point-in-time snapshots.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crossbeam_channel::Receiver;
use tl_bus::{EventType, MessageBus};
use tl_types::{
    Account, ActiveOrder, Currency, Event, InstrumentId, OrderUpdateEvent, Position, SymbolMap,
    TlResult, Trade,
};

use crate::tracker::SignalTracker;

/// Snapshot-readable portfolio state.
#[derive(Debug)]
pub struct PortfolioState {
    pub positions: HashMap<InstrumentId, Position>,
    pub active_orders: HashMap<u32, ActiveOrder>,
    pub account: Account,
    pub trades: HashMap<String, Trade>,
}

impl PortfolioState {
    pub fn new(capital: Decimal) -> Self {
        Self {
            positions: HashMap::new(),
            active_orders: HashMap::new(),
            account: Account::new(capital, Currency::USD),
            trades: HashMap::new(),
        }
    }

    pub fn position(&self, id: InstrumentId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn equity(&self) -> Decimal {
        self.account.equity
    }
}

/// Shared read handle onto the portfolio.
pub type PortfolioHandle = Arc<Mutex<PortfolioState>>;

pub fn portfolio_handle(capital: Decimal) -> PortfolioHandle {
    Arc::new(Mutex::new(PortfolioState::new(capital)))
}

/// Consumer thread keeping the portfolio in sync with the bus.
pub struct PortfolioServer {
    symbols: Arc<SymbolMap>,
    state: PortfolioHandle,
    tracker: Arc<SignalTracker>,
    account_name: String,
    order_rx: Receiver<Event>,
    trade_rx: Receiver<Event>,
    commission_rx: Receiver<Event>,
    position_rx: Receiver<Event>,
    account_rx: Receiver<Event>,
    update_rx: Receiver<Event>,
}

impl PortfolioServer {
    pub fn new(
        symbols: Arc<SymbolMap>,
        bus: &Arc<MessageBus>,
        state: PortfolioHandle,
        tracker: Arc<SignalTracker>,
        account_name: &str,
    ) -> TlResult<Self> {
        Ok(Self {
            symbols,
            state,
            tracker,
            account_name: account_name.to_string(),
            order_rx: bus.subscribe(EventType::Order)?,
            trade_rx: bus.subscribe(EventType::Trade)?,
            commission_rx: bus.subscribe(EventType::TradeCommission)?,
            position_rx: bus.subscribe(EventType::PositionUpdate)?,
            account_rx: bus.subscribe(EventType::AccountUpdate)?,
            update_rx: bus.subscribe(EventType::OrderUpdate)?,
        })
    }

    fn apply(&self, event: Event) {
        let mut state = self.state.lock();
        match event {
            Event::Order(order) => {
                state.active_orders.insert(
                    order.order_id,
                    ActiveOrder::from_event(&order, &self.account_name),
                );
            }
            Event::Trade(trade) => {
                let mult = self
                    .symbols
                    .get(trade.instrument_id)
                    .map(|s| s.value_multiplier())
                    .unwrap_or(Decimal::ONE);
                let position = state
                    .positions
                    .entry(trade.instrument_id)
                    .or_insert_with(|| Position::new(trade.instrument_id));
                position.apply_delta(trade.quantity, trade.avg_price, mult, trade.timestamp);
                if position.is_flat() {
                    state.positions.remove(&trade.instrument_id);
                }
                state.trades.insert(trade.trade_id.clone(), trade);
            }
            Event::TradeCommission(commission) => {
                match state.trades.get_mut(&commission.trade_id) {
                    Some(trade) => trade.fees = commission.commission,
                    None => warn!(
                        trade_id = %commission.trade_id,
                        "commission for unknown trade"
                    ),
                }
            }
            Event::PositionUpdate(update) => match update.position {
                // Broker mirrors are authoritative; they overwrite whatever
                // the trade stream produced.
                Some(position) => {
                    state.positions.insert(update.instrument_id, position);
                }
                None => {
                    state.positions.remove(&update.instrument_id);
                }
            },
            Event::AccountUpdate(account) => {
                state.account = account;
            }
            Event::OrderUpdate(update) => {
                drop(state);
                self.apply_order_update(update);
            }
            _ => {}
        }
    }

    fn apply_order_update(&self, update: OrderUpdateEvent) {
        {
            let mut state = self.state.lock();
            if let Some(order) = state.active_orders.get_mut(&update.order_id) {
                match update.status {
                    tl_types::OrderStatus::PartiallyFilled | tl_types::OrderStatus::Filled => {
                        let delta = update.filled - order.filled;
                        if delta > Decimal::ZERO {
                            order.apply_fill(delta, update.avg_fill_price);
                        }
                    }
                    tl_types::OrderStatus::Cancelled | tl_types::OrderStatus::Rejected => {
                        order.cancel();
                    }
                    _ => order.status = update.status,
                }
                if order.is_terminal() {
                    state.active_orders.remove(&update.order_id);
                }
            } else {
                debug!(order_id = update.order_id, "order update for unknown order");
            }
        }

        // Settle the in-flight counter only once the terminal state is
        // reflected in the ledger.
        if update.status.is_terminal() && update.signal_id > 0 {
            self.tracker.record_outcome(update.signal_id);
        }
    }

    /// Drain every non-order-update queue. Called before an ORDER_UPDATE is
    /// applied: the broker publishes fills and account snapshots first, so
    /// they are already queued and must land first.
    fn drain_pending(&self) {
        for rx in [
            &self.order_rx,
            &self.trade_rx,
            &self.commission_rx,
            &self.position_rx,
            &self.account_rx,
        ] {
            while let Ok(event) = rx.try_recv() {
                if !event.is_shutdown() {
                    self.apply(event);
                }
            }
        }
    }

    pub fn process(&self) -> TlResult<()> {
        info!("portfolio server running");

        let receivers = [
            &self.order_rx,
            &self.trade_rx,
            &self.commission_rx,
            &self.position_rx,
            &self.account_rx,
            &self.update_rx,
        ];

        'outer: loop {
            let mut select = crossbeam_channel::Select::new();
            for rx in receivers {
                select.recv(rx);
            }
            let op = select.select();
            let index = op.index();
            match op.recv(receivers[index]) {
                Ok(Event::Shutdown) | Err(_) => break 'outer,
                Ok(Event::OrderUpdate(update)) => {
                    self.drain_pending();
                    self.apply_order_update(update);
                }
                Ok(event) => self.apply(event),
            }
        }

        // Final drain so late publishes (liquidation trades, the closing
        // account snapshot) are reflected in the terminal state.
        self.drain_pending();
        while let Ok(event) = self.update_rx.try_recv() {
            if let Event::OrderUpdate(update) = event {
                self.apply_order_update(update);
            }
        }

        info!("portfolio server stopped");
        Ok(())
    }

    pub fn spawn(self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("core-portfolio".to_string())
            .spawn(move || self.process())
            .expect("failed to spawn core-portfolio thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{long_order, stock, trade_for};
    use rust_decimal_macros::dec;
    use tl_types::{OrderStatus, PositionUpdate};

    struct Fixture {
        bus: Arc<MessageBus>,
        state: PortfolioHandle,
        tracker: Arc<SignalTracker>,
        handle: JoinHandle<TlResult<()>>,
    }

    fn fixture() -> Fixture {
        let mut symbols = SymbolMap::new();
        symbols.add_symbol(stock("AAPL", 1));

        let bus = Arc::new(MessageBus::new());
        let state = portfolio_handle(dec!(1000000));
        let tracker = Arc::new(SignalTracker::new());

        let server = PortfolioServer::new(
            Arc::new(symbols),
            &bus,
            Arc::clone(&state),
            Arc::clone(&tracker),
            "sim",
        )
        .unwrap();
        let handle = server.spawn();

        Fixture {
            bus,
            state,
            tracker,
            handle,
        }
    }

    #[test]
    fn test_order_ledger_lifecycle() {
        let f = fixture();

        f.tracker.open(1);
        f.bus
            .publish(EventType::Order, Event::Order(long_order(1, 5, dec!(100))));
        f.bus.publish(
            EventType::OrderUpdate,
            Event::OrderUpdate(OrderUpdateEvent {
                timestamp: 2,
                order_id: 5,
                signal_id: 1,
                instrument_id: 1,
                status: OrderStatus::Filled,
                filled: dec!(100),
                avg_fill_price: dec!(50),
                reason: None,
            }),
        );

        // Settling proves both the update and the outcome were recorded.
        f.tracker.set_expected(1, 1);
        f.tracker.wait_settled(&[1], &f.bus).unwrap();

        let state = f.state.lock();
        assert!(state.active_orders.is_empty());
        drop(state);

        f.bus.shutdown();
        f.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_trade_builds_position_and_flat_removes() {
        let f = fixture();

        f.bus
            .publish(EventType::Trade, Event::Trade(trade_for("T-1", 1, dec!(10), dec!(100))));
        f.bus
            .publish(EventType::Trade, Event::Trade(trade_for("T-2", 1, dec!(-10), dec!(110))));
        f.bus.shutdown();
        f.handle.join().unwrap().unwrap();

        let state = f.state.lock();
        assert!(state.positions.is_empty());
        assert_eq!(state.trades.len(), 2);
    }

    #[test]
    fn test_position_update_overwrites_trade_math() {
        let f = fixture();

        f.bus
            .publish(EventType::Trade, Event::Trade(trade_for("T-1", 1, dec!(10), dec!(100))));

        let mut authoritative = Position::new(1);
        authoritative.apply_delta(dec!(12), dec!(99), Decimal::ONE, 3);
        f.bus.publish(
            EventType::PositionUpdate,
            Event::PositionUpdate(PositionUpdate {
                instrument_id: 1,
                position: Some(authoritative.clone()),
            }),
        );
        f.bus.shutdown();
        f.handle.join().unwrap().unwrap();

        let state = f.state.lock();
        assert_eq!(state.position(1), Some(&authoritative));
    }

    #[test]
    fn test_partial_fill_keeps_order_active() {
        let f = fixture();

        f.bus
            .publish(EventType::Order, Event::Order(long_order(1, 9, dec!(100))));
        f.bus.publish(
            EventType::OrderUpdate,
            Event::OrderUpdate(OrderUpdateEvent {
                timestamp: 2,
                order_id: 9,
                signal_id: 1,
                instrument_id: 1,
                status: OrderStatus::PartiallyFilled,
                filled: dec!(40),
                avg_fill_price: dec!(50),
                reason: None,
            }),
        );
        f.bus.shutdown();
        f.handle.join().unwrap().unwrap();

        let state = f.state.lock();
        let order = state.active_orders.get(&9).unwrap();
        assert_eq!(order.filled, dec!(40));
        assert_eq!(order.remaining, dec!(60));
        assert_eq!(order.filled + order.remaining, order.total_qty);
    }
}
