//! Session accumulation and the end-of-run artifact.
//!
//! The writer thread tails the bus for trades, signals, and account
//! snapshots. At shutdown it drains whatever is still queued and hands the
//! accumulated session back to the coordinator, which attaches statistics
//! and writes a single JSON artifact. The artifact shape is identical in
//! backtest and live.

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use tl_bus::{EventType, MessageBus};
use tl_types::{Event, Parameters, SignalEvent, TlResult, Trade};

use crate::stats::{
    static_stats, timeseries_stats, EquityPoint, RegressionStats, StaticStats, TimeseriesStats,
};

/// Raw material gathered over the run.
#[derive(Debug, Default)]
pub struct SessionAccumulator {
    trades: Vec<Trade>,
    trade_index: HashMap<String, usize>,
    signals: Vec<SignalEvent>,
    equity_curve: Vec<EquityPoint>,
}

impl SessionAccumulator {
    fn record(&mut self, event: Event) {
        match event {
            Event::Trade(trade) => {
                self.trade_index
                    .insert(trade.trade_id.clone(), self.trades.len());
                self.trades.push(trade);
            }
            Event::TradeCommission(commission) => {
                // Live commission arrives out-of-band; converge it into the
                // stored trade record.
                match self.trade_index.get(&commission.trade_id) {
                    Some(&i) => self.trades[i].fees = commission.commission,
                    None => warn!(
                        trade_id = %commission.trade_id,
                        "commission for unknown trade dropped"
                    ),
                }
            }
            Event::SignalUpdate(signal) => self.signals.push(signal),
            Event::AccountUpdate(account) => self.equity_curve.push(EquityPoint {
                timestamp: account.timestamp,
                equity: account.equity,
            }),
            _ => {}
        }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }
}

/// Error block appended when a run does not finish cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: String,
    pub message: String,
}

/// The persisted end-of-run record.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionArtifact {
    pub run_id: Uuid,
    pub parameters: Parameters,
    pub static_stats: StaticStats,
    pub regression_stats: RegressionStats,
    pub timeseries_stats: TimeseriesStats,
    pub trades: Vec<Trade>,
    pub signals: Vec<SignalEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
}

impl SessionArtifact {
    /// Assemble the artifact from an accumulator.
    pub fn build(
        parameters: Parameters,
        accumulator: SessionAccumulator,
        error: Option<SessionError>,
    ) -> Self {
        let stats = static_stats(
            parameters.capital,
            &accumulator.equity_curve,
            &accumulator.trades,
            parameters.risk_free_rate,
        );
        let timeseries = timeseries_stats(&accumulator.equity_curve);
        Self {
            run_id: Uuid::new_v4(),
            parameters,
            static_stats: stats,
            regression_stats: RegressionStats::default(),
            timeseries_stats: timeseries,
            trades: accumulator.trades,
            signals: accumulator.signals,
            error,
        }
    }

    /// Write the artifact as pretty JSON, creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>) -> TlResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), trades = self.trades.len(), "session artifact written");
        Ok(())
    }
}

/// Bus consumer that feeds the accumulator until shutdown.
pub struct SessionWriter {
    receivers: Vec<Receiver<Event>>,
    accumulator: SessionAccumulator,
}

impl SessionWriter {
    /// Subscriptions open at construction so nothing published after setup
    /// is missed.
    pub fn new(bus: &Arc<MessageBus>) -> TlResult<Self> {
        let receivers = vec![
            bus.subscribe(EventType::Trade)?,
            bus.subscribe(EventType::TradeCommission)?,
            bus.subscribe(EventType::SignalUpdate)?,
            bus.subscribe(EventType::AccountUpdate)?,
        ];
        Ok(Self {
            receivers,
            accumulator: SessionAccumulator::default(),
        })
    }

    /// Consume until every queue has delivered its shutdown sentinel, then
    /// drain the leftovers.
    pub fn process(mut self) -> SessionAccumulator {
        info!("session writer running");

        let mut open: Vec<Receiver<Event>> = self.receivers.drain(..).collect();
        while !open.is_empty() {
            let mut select = crossbeam_channel::Select::new();
            for rx in &open {
                select.recv(rx);
            }
            let op = select.select();
            let index = op.index();
            match op.recv(&open[index]) {
                Ok(Event::Shutdown) | Err(_) => {
                    // Drain whatever was already queued behind the sentinel.
                    while let Ok(event) = open[index].try_recv() {
                        self.accumulator.record(event);
                    }
                    open.swap_remove(index);
                }
                Ok(event) => self.accumulator.record(event),
            }
        }

        info!("session writer stopped");
        self.accumulator
    }

    pub fn spawn(self) -> JoinHandle<SessionAccumulator> {
        std::thread::Builder::new()
            .name("report-session".to_string())
            .spawn(move || self.process())
            .expect("failed to spawn report-session thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tl_types::{
        Account, Action, CommissionEvent, Currency, DataType, SecurityType, SignalInstruction,
        OrderType,
    };

    fn params() -> Parameters {
        Parameters {
            strategy_name: "test".to_string(),
            capital: dec!(1000000),
            data_type: DataType::Bar,
            start: "2024-01-01".to_string(),
            end: "2024-06-30".to_string(),
            schema: "ohlcv-1h".to_string(),
            risk_free_rate: dec!(0.04),
            output_path: "out.json".to_string(),
            tickers: vec!["AAPL".to_string()],
        }
    }

    fn trade(id: &str, value: Decimal) -> Trade {
        Trade {
            trade_id: id.to_string(),
            signal_id: 1,
            timestamp: 1,
            instrument_id: 1,
            security_type: SecurityType::Stock,
            quantity: dec!(10),
            avg_price: dec!(100),
            trade_value: value,
            trade_cost: value.abs(),
            action: Action::Long,
            fees: dec!(1),
            is_rollover: false,
        }
    }

    #[test]
    fn test_writer_accumulates_and_merges_commission() {
        let bus = Arc::new(MessageBus::new());
        let writer = SessionWriter::new(&bus).unwrap();
        let handle = writer.spawn();

        bus.publish(EventType::Trade, Event::Trade(trade("T-1", dec!(-1000))));
        bus.publish(
            EventType::TradeCommission,
            Event::TradeCommission(CommissionEvent {
                trade_id: "T-1".to_string(),
                commission: dec!(2.5),
                currency: Currency::USD,
            }),
        );
        let mut account = Account::new(dec!(1000000), Currency::USD);
        account.timestamp = 5;
        bus.publish(EventType::AccountUpdate, Event::AccountUpdate(account));
        bus.publish(
            EventType::SignalUpdate,
            Event::SignalUpdate(
                SignalEvent::new(
                    5,
                    vec![SignalInstruction {
                        instrument_id: 1,
                        order_type: OrderType::Market,
                        action: Action::Long,
                        signal_id: 1,
                        weight: dec!(0.1),
                        quantity: None,
                        limit_price: None,
                        aux_price: None,
                    }],
                )
                .unwrap(),
            ),
        );
        bus.shutdown();

        let accumulator = handle.join().unwrap();
        assert_eq!(accumulator.trades().len(), 1);
        assert_eq!(accumulator.trades()[0].fees, dec!(2.5));
        assert_eq!(accumulator.equity_curve().len(), 1);

        let artifact = SessionArtifact::build(params(), accumulator, None);
        assert_eq!(artifact.trades.len(), 1);
        assert_eq!(artifact.signals.len(), 1);
        assert!(artifact.error.is_none());
    }

    #[test]
    fn test_artifact_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");

        let mut accumulator = SessionAccumulator::default();
        accumulator.record(Event::Trade(trade("T-9", dec!(500))));
        let artifact = SessionArtifact::build(
            params(),
            accumulator,
            Some(SessionError {
                kind: "StateError".to_string(),
                message: "negative cash".to_string(),
            }),
        );
        artifact.write(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let back: SessionArtifact = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.trades.len(), 1);
        assert_eq!(back.error.unwrap().kind, "StateError");
    }
}
