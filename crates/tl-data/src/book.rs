//! Latest-record order book.
//!
//! Holds the most recent market record per instrument plus the record before
//! it (rollover settlement needs both sides of a contract switch), and a
//! monotonic time cursor. Writes are serialised through the single
//! [`OrderBookService`] thread; readers take point-in-time snapshots and
//! tolerate staleness.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

use tl_bus::{EventType, MessageBus};
use tl_types::{Event, InstrumentId, MarketRecord, TlResult};

#[derive(Debug, Clone)]
struct BookEntry {
    latest: MarketRecord,
    previous: Option<MarketRecord>,
}

/// Shared latest-quote/bar state. Cheap concurrent reads, one writer.
#[derive(Debug, Default)]
pub struct OrderBook {
    entries: DashMap<InstrumentId, BookEntry>,
    last_updated_ns: AtomicI64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for the record's instrument and advance the cursor.
    pub fn apply(&self, record: &MarketRecord) {
        let id = record.instrument_id();
        self.entries
            .entry(id)
            .and_modify(|entry| {
                entry.previous = Some(entry.latest.clone());
                entry.latest = record.clone();
            })
            .or_insert_with(|| BookEntry {
                latest: record.clone(),
                previous: None,
            });
        self.last_updated_ns
            .fetch_max(record.ts_event(), Ordering::SeqCst);
    }

    /// Latest known record for an instrument.
    pub fn snapshot(&self, id: InstrumentId) -> Option<MarketRecord> {
        self.entries.get(&id).map(|e| e.latest.clone())
    }

    /// The record immediately before the latest one.
    pub fn previous(&self, id: InstrumentId) -> Option<MarketRecord> {
        self.entries.get(&id).and_then(|e| e.previous.clone())
    }

    pub fn last_updated_ns(&self) -> i64 {
        self.last_updated_ns.load(Ordering::SeqCst)
    }
}

/// Consumer thread: applies DATA records to the book, republishes them on
/// ORDER_BOOK, and routes end-of-day events onto the EOD topic.
pub struct OrderBookService {
    book: Arc<OrderBook>,
    bus: Arc<MessageBus>,
    data_rx: crossbeam_channel::Receiver<Event>,
}

impl OrderBookService {
    /// Subscribes at construction so no record published after setup can be
    /// missed.
    pub fn new(book: Arc<OrderBook>, bus: Arc<MessageBus>) -> TlResult<Self> {
        let data_rx = bus.subscribe(EventType::Data)?;
        Ok(Self { book, bus, data_rx })
    }

    pub fn process(&self) -> TlResult<()> {
        info!("order book running");

        while let Ok(event) = self.data_rx.recv() {
            match event {
                Event::Shutdown => break,
                Event::Data(MarketRecord::EndOfDay(eod)) => {
                    // Bookkeeping events bypass the book and the strategies.
                    self.bus.publish(EventType::Eod, Event::Eod(eod));
                }
                Event::Data(record) => {
                    self.book.apply(&record);
                    self.bus
                        .publish(EventType::OrderBook, Event::OrderBook(record));
                }
                _ => {}
            }
        }

        info!("order book stopped");
        Ok(())
    }

    pub fn spawn(self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("core-book".to_string())
            .spawn(move || self.process())
            .expect("failed to spawn core-book thread")
    }
}
