//! Signal-to-order conversion.
//!
//! Consumes SIGNAL events, runs the optional risk gate, sizes each
//! instruction, and publishes typed ORDER events. For every signal id in the
//! incoming batch the in-flight tracker learns exactly how many orders were
//! produced, including zero, which is what lets the host release the replay
//! barrier when a batch is rejected or unsizeable.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crossbeam_channel::Receiver;
use tl_bus::{EventType, MessageBus};
use tl_data::OrderBook;
use tl_types::{Event, OrderEvent, SignalEvent, SignalInstruction, SymbolMap, TlResult};

use crate::portfolio_server::PortfolioHandle;
use crate::risk::{PortfolioSnapshot, RiskModel};
use crate::tracker::SignalTracker;

pub struct OrderManager {
    bus: Arc<MessageBus>,
    symbols: Arc<SymbolMap>,
    book: Arc<OrderBook>,
    portfolio: PortfolioHandle,
    risk: Option<Box<dyn RiskModel>>,
    tracker: Arc<SignalTracker>,
    initial_capital: Decimal,
    signal_rx: Receiver<Event>,
    order_seq: u32,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: &Arc<MessageBus>,
        symbols: Arc<SymbolMap>,
        book: Arc<OrderBook>,
        portfolio: PortfolioHandle,
        risk: Option<Box<dyn RiskModel>>,
        tracker: Arc<SignalTracker>,
        initial_capital: Decimal,
    ) -> TlResult<Self> {
        Ok(Self {
            bus: Arc::clone(bus),
            symbols,
            book,
            portfolio,
            risk,
            tracker,
            initial_capital,
            signal_rx: bus.subscribe(EventType::Signal)?,
            order_seq: 0,
        })
    }

    /// Size an instruction: an explicit quantity wins; otherwise commit
    /// `capital * |weight|` of the portfolio at the current price.
    fn order_quantity(&self, instruction: &SignalInstruction) -> Option<Decimal> {
        if let Some(quantity) = instruction.quantity {
            return (quantity > Decimal::ZERO).then_some(quantity);
        }

        let symbol = self.symbols.get(instruction.instrument_id)?;
        let price = self
            .book
            .snapshot(instruction.instrument_id)?
            .reference_price()?;
        if price <= Decimal::ZERO {
            return None;
        }

        let equity = self.portfolio.lock().equity();
        let capital = if equity > Decimal::ZERO {
            equity
        } else {
            self.initial_capital
        };
        let trade_capital = capital * instruction.weight.abs();
        let quantity = (trade_capital / (price * symbol.value_multiplier())).floor();
        (quantity > Decimal::ZERO).then_some(quantity)
    }

    fn handle_signal(&mut self, signal: SignalEvent) {
        let original_ids = signal.signal_ids();

        let instructions = match &self.risk {
            Some(model) => {
                let snapshot = {
                    let state = self.portfolio.lock();
                    PortfolioSnapshot {
                        account: state.account.clone(),
                        positions: state.positions.clone(),
                    }
                };
                model.evaluate(signal.instructions, &snapshot)
            }
            None => signal.instructions,
        };

        let mut counts: HashMap<u32, usize> =
            original_ids.iter().map(|id| (*id, 0)).collect();

        for instruction in instructions {
            if let Err(e) = instruction.validate() {
                warn!(error = %e, "dropping invalid instruction");
                continue;
            }
            let Some(quantity) = self.order_quantity(&instruction) else {
                warn!(
                    instrument = instruction.instrument_id,
                    signal = instruction.signal_id,
                    "instruction unsizeable, dropped"
                );
                continue;
            };

            self.order_seq += 1;
            let order = OrderEvent {
                timestamp: signal.timestamp,
                order_id: self.order_seq,
                signal_id: instruction.signal_id,
                instrument_id: instruction.instrument_id,
                action: instruction.action,
                order_type: instruction.order_type,
                quantity,
                limit_price: instruction.limit_price,
                aux_price: instruction.aux_price,
            };
            debug!(
                order_id = order.order_id,
                instrument = order.instrument_id,
                action = %order.action,
                %quantity,
                "order published"
            );
            *counts.entry(instruction.signal_id).or_insert(0) += 1;
            self.bus.publish(EventType::Order, Event::Order(order));
        }

        // Report counts for every id, zeros included: the host's barrier
        // wait depends on it.
        for (signal_id, count) in counts {
            self.tracker.set_expected(signal_id, count);
        }
    }

    pub fn process(&mut self) -> TlResult<()> {
        info!("order manager running");

        loop {
            match self.signal_rx.recv() {
                Ok(Event::Signal(signal)) => self.handle_signal(signal),
                Ok(Event::Shutdown) | Err(_) => break,
                Ok(_) => {}
            }
        }

        info!("order manager stopped");
        Ok(())
    }

    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("core-orders".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(tl_types::TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "order manager failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn core-orders thread")
    }
}
