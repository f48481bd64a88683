//! Strategy host.
//!
//! Dedicates a worker thread to the strategy: every ORDER_BOOK event is
//! handed to `handle_event`, emitted instructions become SIGNAL /
//! SIGNAL_UPDATE publishes, and in backtest mode the host releases the
//! replay barrier only after the in-flight tracker confirms every resulting
//! order has a published outcome.
//!
//! A strategy that errors or panics is quarantined: the fault is recorded
//! for the session artifact, the barrier keeps cycling, and the rest of the
//! run streams on. In live mode the fault is surfaced to the operator but
//! the engines likewise stay up.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crossbeam_channel::Receiver;
use tl_bus::{EventType, MessageBus};
use tl_types::{Event, MarketRecord, Mode, SignalEvent, TlResult};

use crate::strategy::{Strategy, StrategyContext};
use crate::tracker::SignalTracker;

/// Shared slot carrying the quarantine reason, if any, to the coordinator.
pub type QuarantineSlot = Arc<Mutex<Option<String>>>;

pub struct StrategyHost {
    bus: Arc<MessageBus>,
    mode: Mode,
    strategy: Box<dyn Strategy>,
    ctx: StrategyContext,
    tracker: Arc<SignalTracker>,
    quarantine: QuarantineSlot,
    book_rx: Receiver<Event>,
}

impl StrategyHost {
    pub fn new(
        bus: &Arc<MessageBus>,
        mode: Mode,
        strategy: Box<dyn Strategy>,
        ctx: StrategyContext,
        tracker: Arc<SignalTracker>,
        quarantine: QuarantineSlot,
    ) -> TlResult<Self> {
        Ok(Self {
            bus: Arc::clone(bus),
            mode,
            strategy,
            ctx,
            tracker,
            quarantine,
            book_rx: bus.subscribe(EventType::OrderBook)?,
        })
    }

    fn is_quarantined(&self) -> bool {
        self.quarantine.lock().is_some()
    }

    fn quarantine(&self, reason: String) {
        match self.mode {
            Mode::Backtest => warn!(reason = %reason, "strategy quarantined; stream continues"),
            Mode::Live => error!(reason = %reason, "strategy fault"),
        }
        let mut slot = self.quarantine.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Release the replay barrier for the current record.
    fn release_barrier(&self) {
        if self.mode == Mode::Backtest {
            self.bus.publish_flag(EventType::UpdateSystem, true);
        }
    }

    fn on_record(&mut self, record: MarketRecord) -> TlResult<()> {
        if self.is_quarantined() {
            self.release_barrier();
            return Ok(());
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.strategy.handle_event(&record, &self.ctx)
        }));

        let instructions = match outcome {
            Ok(Ok(instructions)) => instructions,
            Ok(Err(e)) => {
                self.quarantine(format!("strategy error: {e}"));
                self.release_barrier();
                return Ok(());
            }
            Err(panic) => {
                self.quarantine(format!("strategy panic: {}", panic_message(&panic)));
                self.release_barrier();
                return Ok(());
            }
        };

        if instructions.is_empty() {
            self.release_barrier();
            return Ok(());
        }

        let signal = match SignalEvent::new(record.ts_event(), instructions) {
            Ok(signal) => signal,
            Err(e) => {
                self.quarantine(format!("invalid signal: {e}"));
                self.release_barrier();
                return Ok(());
            }
        };

        let signal_ids = signal.signal_ids();
        for id in &signal_ids {
            self.tracker.open(*id);
        }
        debug!(ids = ?signal_ids, "signal emitted");
        self.bus
            .publish(EventType::Signal, Event::Signal(signal.clone()));
        self.bus
            .publish(EventType::SignalUpdate, Event::SignalUpdate(signal));

        if self.mode == Mode::Backtest {
            // Defer the barrier until the broker has published an outcome
            // for every order this signal produced.
            self.tracker.wait_settled(&signal_ids, &self.bus)?;
            self.release_barrier();
        }
        Ok(())
    }

    pub fn process(&mut self) -> TlResult<()> {
        info!("strategy host running");

        loop {
            match self.book_rx.recv() {
                Ok(Event::OrderBook(record)) => self.on_record(record)?,
                Ok(Event::Shutdown) | Err(_) => break,
                Ok(_) => {}
            }
        }

        debug!(data = %self.strategy.strategy_data(), "strategy final state");
        info!("strategy host stopped");
        Ok(())
    }

    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("core-strategy".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(tl_types::TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "strategy host failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn core-strategy thread")
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
