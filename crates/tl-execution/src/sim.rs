//! Simulated broker for backtests.
//!
//! Keeps its own mirrors of cash, positions, and pending state, fills
//! incoming orders against the latest order-book snapshot, and publishes the
//! authoritative TRADE / POSITION_UPDATE / ACCOUNT_UPDATE / ORDER_UPDATE
//! stream. End-of-day events drive futures rollover, mark-to-market, and,
//! for the terminal event, full liquidation.

use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crossbeam_channel::Receiver;
use tl_bus::{EventType, MessageBus};
use tl_data::OrderBook;
use tl_types::{
    Account, Action, Currency, EodEvent, Event, InstrumentId, OrderEvent, OrderStatus,
    OrderUpdateEvent, Position, PositionUpdate, StateError, Symbol, SymbolMap, TlError, TlResult,
    Trade,
};

use crate::calendar::is_rollover_day;

/// Simulated broker. One instance per backtest run.
pub struct SimBroker {
    symbols: Arc<SymbolMap>,
    bus: Arc<MessageBus>,
    book: Arc<OrderBook>,
    account: Account,
    positions: HashMap<InstrumentId, Position>,
    trade_seq: u32,
    order_rx: Receiver<Event>,
    eod_rx: Receiver<Event>,
}

impl SimBroker {
    /// Build the broker and open its subscriptions. Subscriptions are taken
    /// here, on the construction thread, so no event published after setup
    /// can be missed.
    pub fn new(
        symbols: Arc<SymbolMap>,
        bus: Arc<MessageBus>,
        book: Arc<OrderBook>,
        capital: Decimal,
    ) -> TlResult<Self> {
        let order_rx = bus.subscribe(EventType::Order)?;
        let eod_rx = bus.subscribe(EventType::Eod)?;
        Ok(Self {
            symbols,
            bus,
            book,
            account: Account::new(capital, Currency::USD),
            positions: HashMap::new(),
            trade_seq: 0,
            order_rx,
            eod_rx,
        })
    }

    fn next_trade_id(&mut self) -> String {
        self.trade_seq += 1;
        format!("SIM-{:06}", self.trade_seq)
    }

    /// Fill price for a marketable order: bar close plus directional
    /// slippage, or the touch on the aggressed side of a quote.
    fn fill_price(&self, symbol: &Symbol, action: Action) -> Option<Decimal> {
        let snapshot = self.book.snapshot(symbol.instrument_id)?;
        let base = if action.sign() > 0 {
            snapshot.buy_price()?
        } else {
            snapshot.sell_price()?
        };
        match snapshot {
            tl_types::MarketRecord::Bar(_) => {
                Some(base + symbol.slippage() * Decimal::from(action.sign()))
            }
            _ => Some(base),
        }
    }

    /// Quantity by which a signed fill would increase exposure. Reductions
    /// and the closing leg of a reversal consume no fresh buying power.
    fn opening_quantity(existing: Decimal, delta: Decimal) -> Decimal {
        if existing == Decimal::ZERO || existing.signum() == delta.signum() {
            delta.abs()
        } else {
            (delta.abs() - existing.abs()).max(Decimal::ZERO)
        }
    }

    /// Funds available to support new exposure.
    fn available_funds(&self) -> Decimal {
        self.account.cash
            + self
                .positions
                .values()
                .map(|p| p.unrealized_pnl)
                .sum::<Decimal>()
    }

    fn reject(&self, order: &OrderEvent, reason: &str) {
        warn!(
            order_id = order.order_id,
            instrument = order.instrument_id,
            reason,
            "order rejected"
        );
        self.bus.publish(
            EventType::OrderUpdate,
            Event::OrderUpdate(OrderUpdateEvent {
                timestamp: order.timestamp,
                order_id: order.order_id,
                signal_id: order.signal_id,
                instrument_id: order.instrument_id,
                status: OrderStatus::Cancelled,
                filled: Decimal::ZERO,
                avg_fill_price: Decimal::ZERO,
                reason: Some(reason.to_string()),
            }),
        );
    }

    fn execute_order(&mut self, order: OrderEvent) -> TlResult<()> {
        let Some(symbol) = self.symbols.get(order.instrument_id).cloned() else {
            self.reject(&order, "unknown instrument");
            return Ok(());
        };
        let Some(fill_price) = self.fill_price(&symbol, order.action) else {
            self.reject(&order, "no market data for instrument");
            return Ok(());
        };

        let delta = order.action.signed(order.quantity);
        let existing = self
            .positions
            .get(&order.instrument_id)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        let opening = Self::opening_quantity(existing, delta);
        if opening > Decimal::ZERO {
            let required = symbol.required_capital(opening, fill_price);
            if required > self.available_funds() {
                self.reject(&order, "insufficient buying power");
                return Ok(());
            }
        }

        let trade = self.apply_fill(
            &symbol,
            order.signal_id,
            order.action,
            delta,
            fill_price,
            order.timestamp,
            false,
        )?;

        debug!(
            trade_id = %trade.trade_id,
            instrument = order.instrument_id,
            price = %fill_price,
            qty = %delta,
            "order filled"
        );

        self.bus.publish(
            EventType::OrderUpdate,
            Event::OrderUpdate(OrderUpdateEvent {
                timestamp: order.timestamp,
                order_id: order.order_id,
                signal_id: order.signal_id,
                instrument_id: order.instrument_id,
                status: OrderStatus::Filled,
                filled: order.quantity,
                avg_fill_price: fill_price,
                reason: None,
            }),
        );
        Ok(())
    }

    /// Apply a signed fill to the mirrors and publish the resulting TRADE,
    /// POSITION_UPDATE, and ACCOUNT_UPDATE events.
    #[allow(clippy::too_many_arguments)]
    fn apply_fill(
        &mut self,
        symbol: &Symbol,
        signal_id: u32,
        action: Action,
        delta: Decimal,
        price: Decimal,
        ts_event: i64,
        is_rollover: bool,
    ) -> TlResult<Trade> {
        let mult = symbol.value_multiplier();
        let id = symbol.instrument_id;

        let position = self.positions.entry(id).or_insert_with(|| Position::new(id));
        position.apply_delta(delta, price, mult, ts_event);
        position.mark_to_market(price, symbol, ts_event);

        let fees = symbol.commission(delta);
        let notional = delta * price * mult;
        self.account.cash += -notional - fees;

        if self.account.cash < Decimal::ZERO && symbol.initial_margin > Decimal::ZERO {
            return Err(StateError::NegativeCash {
                cash: self.account.cash.to_string(),
            }
            .into());
        }

        let update = if position.is_flat() {
            self.positions.remove(&id);
            PositionUpdate {
                instrument_id: id,
                position: None,
            }
        } else {
            PositionUpdate {
                instrument_id: id,
                position: Some(position.clone()),
            }
        };

        let trade = Trade {
            trade_id: self.next_trade_id(),
            signal_id,
            timestamp: ts_event,
            instrument_id: id,
            security_type: symbol.security_type,
            quantity: delta,
            avg_price: price,
            trade_value: -notional,
            trade_cost: notional.abs(),
            action,
            fees,
            is_rollover,
        };

        self.bus.publish(EventType::Trade, Event::Trade(trade.clone()));
        self.bus
            .publish(EventType::PositionUpdate, Event::PositionUpdate(update));
        let snapshot = self.account_snapshot(ts_event);
        self.bus
            .publish(EventType::AccountUpdate, Event::AccountUpdate(snapshot));

        Ok(trade)
    }

    fn account_snapshot(&mut self, ts_event: i64) -> Account {
        let market_value: Decimal = self.positions.values().map(|p| p.market_value).sum();
        self.account.equity = self.account.cash + market_value;
        self.account.unrealized_pnl =
            self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.account.full_initial_margin =
            self.positions.values().map(|p| p.margin_required).sum();
        self.account.buying_power = self.account.cash + self.account.unrealized_pnl;
        self.account.timestamp = ts_event;
        self.account.clone()
    }

    fn action_for(existing: Decimal, delta: Decimal) -> Action {
        if delta > Decimal::ZERO {
            if existing < Decimal::ZERO {
                Action::Cover
            } else {
                Action::Long
            }
        } else if existing > Decimal::ZERO {
            Action::Sell
        } else {
            Action::Short
        }
    }

    /// Roll every open futures position whose calendar marks `date` as the
    /// term day: close at the old contract's settle, reopen the same size at
    /// the new contract's settle. Both legs are tagged `is_rollover`.
    fn roll_positions(&mut self, eod: &EodEvent) -> TlResult<bool> {
        let mut ids: Vec<InstrumentId> = self.positions.keys().copied().collect();
        ids.sort_unstable();

        let mut rolled = false;
        for id in ids {
            let Some(symbol) = self.symbols.get(id).cloned() else {
                continue;
            };
            if !symbol.is_future() || !is_rollover_day(&symbol, eod.date) {
                continue;
            }

            let Some(latest) = self.book.snapshot(id) else {
                continue;
            };
            // When the day's last record already belongs to the next
            // contract (rollover-flagged), the record before it carries the
            // expiring contract's settle.
            let (old_settle, new_settle) = if latest.rollover_flag() {
                let new_px = latest.reference_price().unwrap_or_default();
                let old_px = self
                    .book
                    .previous(id)
                    .and_then(|r| r.reference_price())
                    .unwrap_or(new_px);
                (old_px, new_px)
            } else {
                let px = latest.reference_price().unwrap_or_default();
                (px, px)
            };

            let quantity = self.positions[&id].quantity;
            info!(
                instrument = id,
                %old_settle,
                %new_settle,
                %quantity,
                "rolling futures position"
            );

            let close_action = Self::action_for(quantity, -quantity);
            self.apply_fill(
                &symbol,
                0,
                close_action,
                -quantity,
                old_settle,
                eod.ts_event,
                true,
            )?;
            let open_action = Self::action_for(Decimal::ZERO, quantity);
            self.apply_fill(
                &symbol,
                0,
                open_action,
                quantity,
                new_settle,
                eod.ts_event,
                true,
            )?;
            rolled = true;
        }
        Ok(rolled)
    }

    /// Close every open position at the last known price.
    fn liquidate_all(&mut self, ts_event: i64) -> TlResult<()> {
        let mut ids: Vec<InstrumentId> = self.positions.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let Some(symbol) = self.symbols.get(id).cloned() else {
                continue;
            };
            let Some(price) = self.book.snapshot(id).and_then(|r| r.reference_price()) else {
                continue;
            };
            let quantity = self.positions[&id].quantity;
            info!(instrument = id, %price, %quantity, "liquidating position");
            let action = Self::action_for(quantity, -quantity);
            self.apply_fill(&symbol, 0, action, -quantity, price, ts_event, false)?;
        }
        Ok(())
    }

    /// Mark every open position at the latest book price and publish the
    /// account snapshot.
    fn mark_to_market(&mut self, ts_event: i64) {
        for (id, position) in self.positions.iter_mut() {
            let Some(symbol) = self.symbols.get(*id) else {
                continue;
            };
            if let Some(price) = self.book.snapshot(*id).and_then(|r| r.reference_price()) {
                position.mark_to_market(price, symbol, ts_event);
            }
        }
        let snapshot = self.account_snapshot(ts_event);
        self.bus
            .publish(EventType::AccountUpdate, Event::AccountUpdate(snapshot));
    }

    fn on_eod(&mut self, eod: EodEvent) -> TlResult<()> {
        if eod.liquidate {
            self.liquidate_all(eod.ts_event)?;
            self.mark_to_market(eod.ts_event);
            self.bus.publish_flag(EventType::DataProcessed, true);
            return Ok(());
        }

        let rolled = self.roll_positions(&eod)?;
        self.bus.publish_flag(EventType::RolledOver, rolled);
        self.mark_to_market(eod.ts_event);

        // Release the data engine's end-of-day barrier.
        self.bus.publish_flag(EventType::DataProcessed, true);
        Ok(())
    }

    pub fn process(&mut self) -> TlResult<()> {
        info!(cash = %self.account.cash, "simulated broker running");

        // Local receiver handles keep the select arms free to borrow self.
        let order_rx = self.order_rx.clone();
        let eod_rx = self.eod_rx.clone();

        loop {
            crossbeam_channel::select! {
                recv(order_rx) -> msg => match msg {
                    Ok(Event::Order(order)) => self.execute_order(order)?,
                    Ok(Event::Shutdown) | Err(_) => break,
                    Ok(_) => {}
                },
                recv(eod_rx) -> msg => match msg {
                    Ok(Event::Eod(eod)) => self.on_eod(eod)?,
                    Ok(Event::Shutdown) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }

        info!("simulated broker stopped");
        Ok(())
    }

    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("exec-sim".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "simulated broker failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn exec-sim thread")
    }

    #[cfg(test)]
    pub(crate) fn position(&self, id: InstrumentId) -> Option<&Position> {
        self.positions.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn cash(&self) -> Decimal {
        self.account.cash
    }
}
