//! Deterministic replay of a recorded market-data stream.
//!
//! The adaptor releases one record at a time: in backtest mode it blocks on
//! the UPDATE_SYSTEM flag after every publish until the core engine confirms
//! all downstream effects are absorbed, and on the DATA_PROCESSED flag after
//! every synthetic end-of-day event. Those two barriers are what make a
//! multi-threaded backtest reproducible.

use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use tl_bus::{EventType, MessageBus};
use tl_types::{
    DataSourceConfig, EodEvent, Event, MarketRecord, Mode, Parameters, SchemaError, SymbolMap,
    TlError, TlResult,
};

use crate::encoding::RecordBuffer;
use crate::midas::MidasClient;

/// Format a UTC nanosecond timestamp as an ISO-8601 string.
pub fn unix_to_iso(ts_ns: i64) -> String {
    Utc.timestamp_nanos(ts_ns).to_rfc3339()
}

/// Trading date of a UTC nanosecond timestamp, in `America/New_York`.
pub fn session_date(ts_ns: i64) -> NaiveDate {
    Utc.timestamp_nanos(ts_ns)
        .with_timezone(&New_York)
        .date_naive()
}

/// Streams a recorded buffer through the DATA topic in order.
pub struct HistoricalAdaptor {
    symbols: Arc<SymbolMap>,
    bus: Arc<MessageBus>,
    mode: Mode,
    source: DataSourceConfig,
    data: Option<RecordBuffer>,
    current_date: Option<NaiveDate>,
    eod_triggered: bool,
    last_ts: i64,
}

impl HistoricalAdaptor {
    pub fn new(
        symbols: Arc<SymbolMap>,
        bus: Arc<MessageBus>,
        mode: Mode,
        source: DataSourceConfig,
    ) -> Self {
        Self {
            symbols,
            bus,
            mode,
            source,
            data: None,
            current_date: None,
            eod_triggered: false,
            last_ts: 0,
        }
    }

    /// Load the record buffer from the configured source.
    ///
    /// For file sources the stream's metadata trailer is authoritative:
    /// `params.start/end/schema` are overwritten from it.
    pub fn get_data(&mut self, params: &mut Parameters) -> TlResult<bool> {
        let buffer = match &self.source {
            DataSourceConfig::File { path } => {
                let buffer = RecordBuffer::from_file(path)?;
                params.start = unix_to_iso(buffer.metadata.start_ns);
                params.end = unix_to_iso(buffer.metadata.end_ns);
                params.schema = buffer.metadata.schema.clone();
                buffer
            }
            DataSourceConfig::Http => MidasClient::from_env()?.get_records(params)?,
        };

        info!(
            records = buffer.len(),
            schema = %buffer.metadata.schema,
            "historical buffer loaded"
        );
        self.data = Some(buffer);
        Ok(true)
    }

    /// Pop the next record and rewrite its instrument id from the stream's
    /// native numbering to the run's symbol map.
    fn next_record(&mut self) -> TlResult<Option<MarketRecord>> {
        let buffer = self.data.as_mut().ok_or_else(|| {
            TlError::Config("historical adaptor has no data; call get_data first".into())
        })?;

        let mut record = match buffer.replay() {
            Some(r) => r,
            None => return Ok(None),
        };

        let native_id = record.instrument_id();
        let ticker = buffer
            .metadata
            .ticker(native_id)
            .ok_or(SchemaError::UnknownInstrument {
                instrument_id: native_id,
            })?
            .to_string();

        let mapped = self
            .symbols
            .id_for_data_ticker(&ticker)
            .or_else(|| {
                self.symbols
                    .get_by_midas_ticker(&ticker)
                    .map(|s| s.instrument_id)
            })
            .ok_or(SchemaError::UnmappedTicker { ticker })?;

        record.set_instrument_id(mapped);
        Ok(Some(record))
    }

    /// Detect a day-session close and run the end-of-day barrier.
    fn check_eod(&mut self, record: &MarketRecord) -> TlResult<()> {
        let date = session_date(record.ts_event());

        if self.current_date.map_or(true, |d| date > d) {
            self.current_date = Some(date);
            self.eod_triggered = false;
            self.bus.publish_flag(EventType::DataProcessed, false);
        }

        let symbol = self
            .symbols
            .get(record.instrument_id())
            .ok_or(SchemaError::UnknownInstrument {
                instrument_id: record.instrument_id(),
            })?;

        if !self.eod_triggered && symbol.after_day_close(record.ts_event()) {
            debug!(date = %date, "end-of-day triggered");
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
            self.bus.await_flag(EventType::DataProcessed, true)?;
            self.bus.publish_flag(EventType::DataProcessed, false);
        }

        Ok(())
    }

    /// Drain the buffer record-by-record, enforcing the backtest barriers.
    pub fn process(&mut self) -> TlResult<()> {
        info!("historical adaptor running");

        loop {
            if self.bus.is_shutdown() {
                return Ok(());
            }

            let record = match self.next_record()? {
                Some(r) => r,
                None => break,
            };
            self.last_ts = record.ts_event();

            if self.mode == Mode::Backtest {
                self.check_eod(&record)?;
            }

            self.bus.publish(EventType::Data, Event::Data(record));

            if self.mode == Mode::Backtest {
                // Barrier: every downstream effect of this record must be
                // published before the next record is released.
                self.bus.await_flag(EventType::UpdateSystem, true)?;
                self.bus.publish_flag(EventType::UpdateSystem, false);
            }
        }

        // End of buffer: one terminal end-of-day pass liquidates whatever is
        // still open, then the run shuts down.
        if self.mode == Mode::Backtest {
            if let Some(date) = self.current_date {
                self.bus.publish(
                    EventType::Data,
                    Event::Data(MarketRecord::EndOfDay(EodEvent {
                        instrument_id: 0,
                        ts_event: self.last_ts,
                        date,
                        liquidate: true,
                    })),
                );
                self.bus.await_flag(EventType::DataProcessed, true)?;
                self.bus.publish_flag(EventType::DataProcessed, false);
            }
        }

        info!("historical stream complete");
        self.bus.publish(EventType::Shutdown, Event::Shutdown);
        Ok(())
    }

    /// Run `process` on a dedicated named thread. A fatal error latches
    /// shutdown so every other engine unwinds.
    pub fn spawn(mut self) -> JoinHandle<TlResult<()>> {
        std::thread::Builder::new()
            .name("data-historical".to_string())
            .spawn(move || match self.process() {
                Ok(()) => Ok(()),
                Err(TlError::Shutdown) => Ok(()),
                Err(e) => {
                    error!(error = %e, "historical adaptor failed");
                    self.bus.shutdown();
                    Err(e)
                }
            })
            .expect("failed to spawn data-historical thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{write_stream_file, StreamMetadata};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tl_types::{price_to_scaled, OhlcvBar};

    fn test_symbols() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.add_symbol(crate::tests_support::stock("AAPL", 1));
        map
    }

    fn bar_at(native_id: u32, ts: i64) -> MarketRecord {
        let px = price_to_scaled(dec!(100));
        MarketRecord::Bar(OhlcvBar {
            instrument_id: native_id,
            ts_event: ts,
            rollover_flag: false,
            open: px,
            high: px,
            low: px,
            close: px,
            volume: 10,
        })
    }

    /// 2024-03-04 15:00 New York, in UTC ns.
    fn mid_session_ts() -> i64 {
        Utc.with_ymd_and_hms(2024, 3, 4, 20, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    /// 2024-03-04 16:30 New York, past the day close.
    fn post_close_ts() -> i64 {
        Utc.with_ymd_and_hms(2024, 3, 4, 21, 30, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    fn write_file(dir: &tempfile::TempDir, records: &[MarketRecord]) -> String {
        let path = dir.path().join("stream.bin");
        let metadata = StreamMetadata {
            schema: "ohlcv-1h".to_string(),
            start_ns: records.first().map(|r| r.ts_event()).unwrap_or(0),
            end_ns: records.last().map(|r| r.ts_event()).unwrap_or(0),
            mappings: HashMap::from([(42, "AAPL2".to_string())]),
        };
        write_stream_file(&path, records, &metadata).unwrap();
        path.display().to_string()
    }

    /// Stand-in for the core/execution engines: acknowledges every record
    /// and every EOD so the adaptor's barriers release.
    fn spawn_acknowledger(bus: Arc<MessageBus>) -> (std::thread::JoinHandle<Vec<Event>>,) {
        let rx = bus.subscribe(EventType::Data).unwrap();
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(event) = rx.recv() {
                if event.is_shutdown() {
                    break;
                }
                match &event {
                    Event::Data(MarketRecord::EndOfDay(_)) => {
                        bus.publish_flag(EventType::DataProcessed, true);
                    }
                    Event::Data(_) => {
                        bus.publish_flag(EventType::UpdateSystem, true);
                    }
                    _ => {}
                }
                seen.push(event);
            }
            seen
        });
        (handle,)
    }

    #[test]
    fn test_get_data_overrides_params_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, &[bar_at(42, mid_session_ts())]);

        let bus = Arc::new(MessageBus::new());
        let mut adaptor = HistoricalAdaptor::new(
            Arc::new(test_symbols()),
            bus,
            Mode::Backtest,
            DataSourceConfig::File { path },
        );

        let mut params = params_stub();
        assert!(adaptor.get_data(&mut params).unwrap());
        assert_eq!(params.schema, "ohlcv-1h");
        assert!(params.start.starts_with("2024-03-04"));
    }

    #[test]
    fn test_replay_rewrites_instrument_ids_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, &[bar_at(42, mid_session_ts())]);

        let bus = Arc::new(MessageBus::new());
        let mut adaptor = HistoricalAdaptor::new(
            Arc::new(test_symbols()),
            Arc::clone(&bus),
            Mode::Backtest,
            DataSourceConfig::File { path },
        );
        adaptor.get_data(&mut params_stub()).unwrap();

        let (ack,) = spawn_acknowledger(Arc::clone(&bus));
        adaptor.process().unwrap();

        let seen = ack.join().unwrap();
        // Bar plus the terminal liquidation EOD.
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            Event::Data(MarketRecord::Bar(bar)) => assert_eq!(bar.instrument_id, 1),
            other => panic!("expected bar, got {other:?}"),
        }
        match &seen[1] {
            Event::Data(MarketRecord::EndOfDay(eod)) => assert!(eod.liquidate),
            other => panic!("expected terminal EOD, got {other:?}"),
        }
        assert!(bus.is_shutdown());
    }

    #[test]
    fn test_eod_fires_once_per_day_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            bar_at(42, mid_session_ts()),
            bar_at(42, post_close_ts()),
            bar_at(42, post_close_ts() + 3_600_000_000_000),
        ];
        let path = write_file(&dir, &records);

        let bus = Arc::new(MessageBus::new());
        let mut adaptor = HistoricalAdaptor::new(
            Arc::new(test_symbols()),
            Arc::clone(&bus),
            Mode::Backtest,
            DataSourceConfig::File { path },
        );
        adaptor.get_data(&mut params_stub()).unwrap();

        let (ack,) = spawn_acknowledger(Arc::clone(&bus));
        adaptor.process().unwrap();

        let seen = ack.join().unwrap();
        let eods: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                Event::Data(MarketRecord::EndOfDay(eod)) => Some(eod),
                _ => None,
            })
            .collect();

        // One daily EOD (before the first post-close bar) plus the terminal
        // liquidation event.
        assert_eq!(eods.len(), 2);
        assert!(!eods[0].liquidate);
        assert!(eods[1].liquidate);

        // The daily EOD must precede the bar that triggered it.
        let eod_idx = seen
            .iter()
            .position(|e| matches!(e, Event::Data(MarketRecord::EndOfDay(_))))
            .unwrap();
        assert_eq!(eod_idx, 1);
    }

    #[test]
    fn test_unmapped_ticker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, &[bar_at(99, mid_session_ts())]);

        let bus = Arc::new(MessageBus::new());
        let mut adaptor = HistoricalAdaptor::new(
            Arc::new(test_symbols()),
            bus,
            Mode::Backtest,
            DataSourceConfig::File { path },
        );
        adaptor.get_data(&mut params_stub()).unwrap();

        match adaptor.next_record() {
            Err(TlError::Schema(SchemaError::UnknownInstrument { instrument_id: 99 })) => (),
            other => panic!("expected unknown instrument, got {other:?}"),
        }
    }

    fn params_stub() -> Parameters {
        Parameters {
            strategy_name: "test".to_string(),
            capital: dec!(1000000),
            data_type: tl_types::DataType::Bar,
            start: String::new(),
            end: String::new(),
            schema: String::new(),
            risk_free_rate: dec!(0.04),
            output_path: "out.json".to_string(),
            tickers: vec!["AAPL".to_string()],
        }
    }
}
