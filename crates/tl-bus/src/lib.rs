//! Topic-based pub/sub fabric connecting the data, core, and execution
//! engines.
//!
//! Two delivery mechanisms exist. *Queued* topics hand every subscriber its
//! own unbounded FIFO; publishing fans a copy of the event out to each queue
//! and never blocks. *Flag* topics are booleans behind a condition variable,
//! used for the barrier-style synchronisation that keeps a backtest
//! deterministic.
//!
//! A single SHUTDOWN publish latches a process-wide atomic; every blocking
//! wait observes the latch and returns the [`Event::Shutdown`] sentinel so
//! threads can drain and exit.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use tl_types::{Event, TlError, TlResult};

/// Every topic carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Data,
    OrderBook,
    Signal,
    SignalUpdate,
    Order,
    Trade,
    TradeCommission,
    PositionUpdate,
    AccountUpdate,
    OrderUpdate,
    Eod,
    DataProcessed,
    UpdateSystem,
    RolledOver,
    Shutdown,
}

impl EventType {
    /// Flag topics are condition-variable booleans rather than queues.
    pub fn is_flag(&self) -> bool {
        matches!(
            self,
            EventType::DataProcessed | EventType::UpdateSystem | EventType::RolledOver
        )
    }
}

/// How long a flag wait sleeps between shutdown-latch polls.
const FLAG_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct FlagState {
    values: HashMap<EventType, bool>,
}

/// The engine-wide message bus. Cheap to share behind an `Arc`; all interior
/// state is lock-protected.
pub struct MessageBus {
    queues: Mutex<HashMap<EventType, Vec<Sender<Event>>>>,
    flags: Mutex<FlagState>,
    flag_signal: Condvar,
    shutdown: AtomicBool,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            flags: Mutex::new(FlagState::default()),
            flag_signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Open a fresh FIFO on `topic`. Each subscriber owns its queue; events
    /// published before subscription are not replayed.
    pub fn subscribe(&self, topic: EventType) -> TlResult<Receiver<Event>> {
        if topic.is_flag() {
            return Err(TlError::Config(format!(
                "topic {topic:?} is a flag; use await_flag/get_flag"
            )));
        }
        let (tx, rx) = unbounded();
        self.queues.lock().entry(topic).or_default().push(tx);
        Ok(rx)
    }

    /// Fan `event` out to every subscriber of `topic`. Non-blocking; sends
    /// to dropped subscribers are pruned in place.
    pub fn publish(&self, topic: EventType, event: Event) {
        if topic == EventType::Shutdown || event.is_shutdown() {
            self.shutdown();
            return;
        }

        let mut queues = self.queues.lock();
        if let Some(senders) = queues.get_mut(&topic) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Set a flag topic and wake every waiter.
    pub fn publish_flag(&self, topic: EventType, value: bool) {
        debug_assert!(topic.is_flag());
        let mut flags = self.flags.lock();
        flags.values.insert(topic, value);
        self.flag_signal.notify_all();
    }

    /// Current value of a flag topic (unset reads as `false`).
    pub fn get_flag(&self, topic: EventType) -> bool {
        *self.flags.lock().values.get(&topic).unwrap_or(&false)
    }

    /// Block until `topic` reads `expected`, or the shutdown latch is set.
    ///
    /// The condvar's own mutex is the only lock held while parked.
    pub fn await_flag(&self, topic: EventType, expected: bool) -> TlResult<()> {
        let mut flags = self.flags.lock();
        loop {
            if self.is_shutdown() {
                return Err(TlError::Shutdown);
            }
            if *flags.values.get(&topic).unwrap_or(&false) == expected {
                return Ok(());
            }
            self.flag_signal
                .wait_until(&mut flags, Instant::now() + FLAG_POLL_INTERVAL);
        }
    }

    /// Latch the process-wide shutdown: wake flag waiters and push the
    /// [`Event::Shutdown`] sentinel into every subscriber queue.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return; // already latched
        }
        debug!("message bus shutdown latched");

        self.flag_signal.notify_all();

        let mut queues = self.queues.lock();
        for senders in queues.values_mut() {
            senders.retain(|tx| tx.send(Event::Shutdown).is_ok());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
