//! Live market-data adaptor.
//!
//! Bridges a streaming broker feed onto the DATA topic. Ordering is
//! preserved per instrument by virtue of the single feed thread; the
//! backtest barriers do not apply. End-of-day is detected from the feed
//! clock: the first record stamped past a symbol's day close triggers the
//! EOD event for that session date.

use chrono::NaiveDate;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use tl_bus::{EventType, MessageBus};
use tl_types::{EodEvent, Event, MarketRecord, SymbolMap, TlError, TlResult};

use crate::historical::session_date;

/// A record handed over by the broker gateway, keyed by the vendor's data
/// ticker. The adaptor owns the id rewrite.
#[derive(Debug, Clone)]
pub struct FeedRecord {
    pub data_ticker: String,
    pub record: MarketRecord,
}

/// Forwards gateway feed messages onto the bus.
pub struct LiveFeedAdaptor {
    symbols: Arc<SymbolMap>,
    bus: Arc<MessageBus>,
    feed: Receiver<FeedRecord>,
    current_date: Option<NaiveDate>,
    eod_triggered: bool,
}

impl LiveFeedAdaptor {
    pub fn new(symbols: Arc<SymbolMap>, bus: Arc<MessageBus>, feed: Receiver<FeedRecord>) -> Self {
        Self {
            symbols,
            bus,
            feed,
            current_date: None,
            eod_triggered: false,
        }
    }

    fn forward(&mut self, feed_record: FeedRecord) {
        let FeedRecord {
            data_ticker,
            mut record,
        } = feed_record;

        let Some(id) = self.symbols.id_for_data_ticker(&data_ticker) else {
            warn!(ticker = %data_ticker, "dropping feed record for unknown ticker");
            return;
        };
        record.set_instrument_id(id);

        self.check_eod(&record);
        self.bus.publish(EventType::Data, Event::Data(record));
    }

    /// Clock-driven EOD: no barrier, best-effort ordering.
    fn check_eod(&mut self, record: &MarketRecord) {
        let date = session_date(record.ts_event());
        if self.current_date.map_or(true, |d| date > d) {
            self.current_date = Some(date);
            self.eod_triggered = false;
        }

        let Some(symbol) = self.symbols.get(record.instrument_id()) else {
            return;
        };

        if !self.eod_triggered && symbol.after_day_close(record.ts_event()) {
            self.eod_triggered = true;
            self.bus.publish(
                EventType::Data,
                Event::Data(MarketRecord::EndOfDay(EodEvent {
                    instrument_id: record.instrument_id(),
                    ts_event: record.ts_event(),
                    date,
                    liquidate: false,
                })),
            );
        }
    }

    pub fn process(&mut self) -> TlResult<()> {
        info!("live feed adaptor running");

        loop {
            if self.bus.is_shutdown() {
                return Ok(());
            }
            match self.feed.recv() {
                Ok(feed_record) => self.forward(feed_record),
                Err(_) => {
                    // Gateway hung up: the feed is gone, the run is over.
                    info!("live feed closed");
                    self.bus.publish(EventType::Shutdown, Event::Shutdown);
                    return Ok(());
                }
            }
        }
    }

    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("data-live".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "live feed adaptor failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn data-live thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crossbeam_channel::unbounded;
    use rust_decimal_macros::dec;
    use tl_types::{price_to_scaled, OhlcvBar};

    fn bar(ts: i64) -> MarketRecord {
        let px = price_to_scaled(dec!(50));
        MarketRecord::Bar(OhlcvBar {
            instrument_id: 0,
            ts_event: ts,
            rollover_flag: false,
            open: px,
            high: px,
            low: px,
            close: px,
            volume: 1,
        })
    }

    #[test]
    fn test_forwarding_rewrites_ids_and_drops_unknown() {
        let mut symbols = SymbolMap::new();
        symbols.add_symbol(crate::tests_support::stock("AAPL", 3));

        let bus = Arc::new(MessageBus::new());
        let rx = bus.subscribe(EventType::Data).unwrap();
        let (feed_tx, feed_rx) = unbounded();

        let mut adaptor =
            LiveFeedAdaptor::new(Arc::new(symbols), Arc::clone(&bus), feed_rx);

        let ts = Utc
            .with_ymd_and_hms(2024, 3, 4, 20, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();

        feed_tx
            .send(FeedRecord {
                data_ticker: "AAPL2".to_string(),
                record: bar(ts),
            })
            .unwrap();
        feed_tx
            .send(FeedRecord {
                data_ticker: "GHOST".to_string(),
                record: bar(ts),
            })
            .unwrap();
        drop(feed_tx);

        adaptor.process().unwrap();

        match rx.recv().unwrap() {
            Event::Data(MarketRecord::Bar(b)) => assert_eq!(b.instrument_id, 3),
            other => panic!("expected bar, got {other:?}"),
        }
        // Unknown ticker dropped; next delivery is the shutdown sentinel.
        assert!(rx.recv().unwrap().is_shutdown());
        assert!(bus.is_shutdown());
    }
}
