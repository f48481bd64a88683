//! Live broker adaptor.
//!
//! Forwards ORDER events to a wire-protocol gateway and translates the
//! gateway's callbacks back into bus events. The gateway itself (session
//! management, encoding, reconnects) is behind the [`BrokerGateway`] trait;
//! this adaptor owns only the event plumbing.
//!
//! Commission arrives out-of-band here (unlike the simulated broker, which
//! reports fees inline): it is published as TRADE_COMMISSION and merged into
//! the stored trade downstream.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use tl_bus::{EventType, MessageBus};
use tl_types::{
    Account, BrokerError, CommissionEvent, Event, OrderEvent, OrderUpdateEvent, PositionUpdate,
    Symbol, SymbolMap, TlError, TlResult, Trade,
};

/// Messages emitted by a broker gateway session.
#[derive(Debug, Clone)]
pub enum GatewayMessage {
    Fill(Trade),
    Commission(CommissionEvent),
    OrderStatus(OrderUpdateEvent),
    AccountSummary(Account),
    PositionReport(PositionUpdate),
    Disconnected { reason: String },
}

/// Wire-protocol seam. Implementations own the connection; the adaptor owns
/// the bus.
pub trait BrokerGateway: Send {
    /// Transmit an order. The gateway reports the outcome asynchronously
    /// through its message channel.
    fn submit_order(&mut self, order: &OrderEvent, symbol: &Symbol) -> TlResult<()>;

    /// Channel of session callbacks.
    fn messages(&self) -> Receiver<GatewayMessage>;
}

/// Routes orders out to the gateway and gateway callbacks onto the bus.
pub struct LiveBroker {
    symbols: Arc<SymbolMap>,
    bus: Arc<MessageBus>,
    gateway: Box<dyn BrokerGateway>,
    order_rx: Receiver<Event>,
}

impl LiveBroker {
    pub fn new(
        symbols: Arc<SymbolMap>,
        bus: Arc<MessageBus>,
        gateway: Box<dyn BrokerGateway>,
    ) -> TlResult<Self> {
        let order_rx = bus.subscribe(EventType::Order)?;
        Ok(Self {
            symbols,
            bus,
            gateway,
            order_rx,
        })
    }

    fn submit(&mut self, order: OrderEvent) {
        let Some(symbol) = self.symbols.get(order.instrument_id) else {
            warn!(instrument = order.instrument_id, "order for unknown instrument dropped");
            return;
        };
        if let Err(e) = self.gateway.submit_order(&order, symbol) {
            // A failed transmit is a broker rejection, not a fatal fault.
            warn!(order_id = order.order_id, error = %e, "order transmit failed");
            self.bus.publish(
                EventType::OrderUpdate,
                Event::OrderUpdate(OrderUpdateEvent {
                    timestamp: order.timestamp,
                    order_id: order.order_id,
                    signal_id: order.signal_id,
                    instrument_id: order.instrument_id,
                    status: tl_types::OrderStatus::Cancelled,
                    filled: rust_decimal::Decimal::ZERO,
                    avg_fill_price: rust_decimal::Decimal::ZERO,
                    reason: Some(e.to_string()),
                }),
            );
        }
    }

    fn dispatch(&self, message: GatewayMessage) -> TlResult<()> {
        match message {
            GatewayMessage::Fill(trade) => {
                self.bus.publish(EventType::Trade, Event::Trade(trade));
            }
            GatewayMessage::Commission(commission) => {
                self.bus.publish(
                    EventType::TradeCommission,
                    Event::TradeCommission(commission),
                );
            }
            GatewayMessage::OrderStatus(update) => {
                self.bus
                    .publish(EventType::OrderUpdate, Event::OrderUpdate(update));
            }
            GatewayMessage::AccountSummary(account) => {
                self.bus
                    .publish(EventType::AccountUpdate, Event::AccountUpdate(account));
            }
            GatewayMessage::PositionReport(update) => {
                self.bus
                    .publish(EventType::PositionUpdate, Event::PositionUpdate(update));
            }
            GatewayMessage::Disconnected { reason } => {
                return Err(BrokerError::Disconnected { message: reason }.into());
            }
        }
        Ok(())
    }

    pub fn process(&mut self) -> TlResult<()> {
        info!("live broker running");
        let gateway_rx = self.gateway.messages();
        let order_rx = self.order_rx.clone();

        loop {
            crossbeam_channel::select! {
                recv(order_rx) -> msg => match msg {
                    Ok(Event::Order(order)) => self.submit(order),
                    Ok(Event::Shutdown) | Err(_) => break,
                    Ok(_) => {}
                },
                recv(gateway_rx) -> msg => match msg {
                    Ok(message) => self.dispatch(message)?,
                    Err(_) => {
                        return Err(BrokerError::Disconnected {
                            message: "gateway channel closed".to_string(),
                        }
                        .into());
                    }
                },
            }
        }

        info!("live broker stopped");
        Ok(())
    }

    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("exec-live".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "live broker failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn exec-live thread")
    }
}
