//! Engine coordinator.
//!
//! Wires every component onto one bus, spawns the per-engine threads, and
//! drives the run lifecycle:
//! Idle -> Initialized -> Streaming -> LiquidatingEod -> Finalizing -> Done.
//! Transitions are driven by the data engine reaching end-of-buffer (or the
//! shutdown latch). Teardown joins threads in dependency order (data, core,
//! execution, report) with a timeout that escalates to abandoning the
//! thread.
//!
//! Components never learn about each other: construction passes each one
//! the bus handle plus whatever shared state it reads, and all bus
//! subscriptions are opened on the construction thread so nothing published
//! after setup can be missed.

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use tl_bus::MessageBus;
use tl_data::{
    FeedRecord, HistoricalAdaptor, LiveFeedAdaptor, OrderBook, OrderBookService,
};
use tl_execution::{BrokerGateway, LiveBroker, SimBroker};
use tl_report::{SessionArtifact, SessionError, SessionWriter};
use tl_types::{
    BrokerError, Mode, Parameters, RunConfig, SymbolMap, TlError, TlResult,
};

use crate::host::{QuarantineSlot, StrategyHost};
use crate::order_manager::OrderManager;
use crate::portfolio_server::{portfolio_handle, PortfolioServer};
use crate::risk::RiskRegistry;
use crate::strategy::{StrategyContext, StrategyRegistry};
use crate::tracker::SignalTracker;

/// How long teardown waits for each thread before abandoning it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Backtest run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initialized,
    Streaming,
    LiquidatingEod,
    Finalizing,
    Done,
}

/// What a completed (or failed) run hands back to the caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub artifact_path: String,
    pub quarantined: Option<String>,
}

pub struct Engine {
    config: RunConfig,
    mode: Mode,
    params: Parameters,
    symbols: Arc<SymbolMap>,
    bus: Arc<MessageBus>,
    state: RunState,
    gateway: Option<Box<dyn BrokerGateway>>,
    feed: Option<Receiver<FeedRecord>>,
}

impl Engine {
    pub fn new(config: RunConfig, mode: Mode) -> TlResult<Self> {
        let params = config.parameters();
        let symbols = Arc::new(config.build_symbol_map());
        Ok(Self {
            config,
            mode,
            params,
            symbols,
            bus: Arc::new(MessageBus::new()),
            state: RunState::Idle,
            gateway: None,
            feed: None,
        })
    }

    /// Attach the live-mode gateway and its market-data feed. Required
    /// before `run` in live mode; ignored in backtest.
    pub fn with_live_gateway(
        mut self,
        gateway: Box<dyn BrokerGateway>,
        feed: Receiver<FeedRecord>,
    ) -> Self {
        self.gateway = Some(gateway);
        self.feed = Some(feed);
        self
    }

    /// Bus handle, e.g. for an external shutdown trigger.
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    /// Execute the full run and write the session artifact.
    ///
    /// Fatal engine errors are returned *after* the artifact (with its error
    /// block) is persisted, so a crashed run still leaves a record.
    pub fn run(
        mut self,
        strategies: &StrategyRegistry,
        risks: &RiskRegistry,
    ) -> TlResult<RunOutcome> {
        info!(
            strategy = %self.config.strategy.name,
            mode = ?self.mode,
            symbols = self.symbols.len(),
            "engine starting"
        );

        // ---- construction: shared state, plugins, components ----

        let book = Arc::new(OrderBook::new());
        let portfolio = portfolio_handle(self.params.capital);
        let tracker = Arc::new(SignalTracker::new());
        let quarantine: QuarantineSlot = Arc::new(parking_lot::Mutex::new(None));

        let strategy = strategies.create(&self.config.strategy.name, &self.config.strategy.params)?;
        let risk_model = match &self.config.risk {
            Some(section) => Some(risks.create(&section.name, &section.params)?),
            None => None,
        };

        let writer = SessionWriter::new(&self.bus)?;
        let portfolio_server = PortfolioServer::new(
            Arc::clone(&self.symbols),
            &self.bus,
            Arc::clone(&portfolio),
            Arc::clone(&tracker),
            "sim",
        )?;
        let book_service = OrderBookService::new(Arc::clone(&book), Arc::clone(&self.bus))?;
        let host = StrategyHost::new(
            &self.bus,
            self.mode,
            strategy,
            StrategyContext {
                symbols: Arc::clone(&self.symbols),
                book: Arc::clone(&book),
                portfolio: Arc::clone(&portfolio),
            },
            Arc::clone(&tracker),
            Arc::clone(&quarantine),
        )?;
        let order_manager = OrderManager::new(
            &self.bus,
            Arc::clone(&self.symbols),
            Arc::clone(&book),
            Arc::clone(&portfolio),
            risk_model,
            Arc::clone(&tracker),
            self.params.capital,
        )?;

        enum BrokerThread {
            Sim(SimBroker),
            Live(LiveBroker),
        }
        let broker = match self.mode {
            Mode::Backtest => BrokerThread::Sim(SimBroker::new(
                Arc::clone(&self.symbols),
                Arc::clone(&self.bus),
                Arc::clone(&book),
                self.params.capital,
            )?),
            Mode::Live => {
                let gateway = self.gateway.take().ok_or_else(|| {
                    TlError::Config("live mode requires a broker gateway".into())
                })?;
                BrokerThread::Live(LiveBroker::new(
                    Arc::clone(&self.symbols),
                    Arc::clone(&self.bus),
                    gateway,
                )?)
            }
        };

        // Data adaptor last: everything else is already subscribed.
        enum DataThread {
            Historical(HistoricalAdaptor),
            Live(LiveFeedAdaptor),
        }
        let data = match self.mode {
            Mode::Backtest => {
                let mut adaptor = HistoricalAdaptor::new(
                    Arc::clone(&self.symbols),
                    Arc::clone(&self.bus),
                    self.mode,
                    self.config.data_source.clone(),
                );
                adaptor.get_data(&mut self.params)?;
                DataThread::Historical(adaptor)
            }
            Mode::Live => {
                let feed = self.feed.take().ok_or_else(|| {
                    TlError::Config("live mode requires a market-data feed".into())
                })?;
                DataThread::Live(LiveFeedAdaptor::new(
                    Arc::clone(&self.symbols),
                    Arc::clone(&self.bus),
                    feed,
                ))
            }
        };

        self.transition(RunState::Initialized);

        // ---- spawn ----

        let writer_handle = writer.spawn();
        let portfolio_handle_t = portfolio_server.spawn();
        let book_handle = book_service.spawn();
        let host_handle = host.spawn();
        let orders_handle = order_manager.spawn();
        let broker_handle = match broker {
            BrokerThread::Sim(b) => b.spawn(),
            BrokerThread::Live(b) => b.spawn(),
        };
        let data_handle = match data {
            DataThread::Historical(a) => a.spawn(),
            DataThread::Live(a) => a.spawn(),
        };

        self.transition(RunState::Streaming);

        // ---- teardown, in dependency order ----

        let mut fatal: Option<TlError> = None;
        let mut record_fault = |result: Option<TlResult<()>>, name: &str| {
            match result {
                Some(Err(e)) if fatal.is_none() => {
                    error!(thread = name, error = %e, "engine thread failed");
                    fatal = Some(e);
                }
                Some(Err(e)) => error!(thread = name, error = %e, "engine thread failed"),
                None => warn!(thread = name, "engine thread abandoned after timeout"),
                Some(Ok(())) => {}
            }
        };

        record_fault(join_timeout(data_handle, SHUTDOWN_TIMEOUT, "data"), "data");
        self.transition(RunState::LiquidatingEod);

        record_fault(join_timeout(book_handle, SHUTDOWN_TIMEOUT, "core-book"), "core-book");
        record_fault(
            join_timeout(host_handle, SHUTDOWN_TIMEOUT, "core-strategy"),
            "core-strategy",
        );
        record_fault(
            join_timeout(orders_handle, SHUTDOWN_TIMEOUT, "core-orders"),
            "core-orders",
        );
        record_fault(
            join_timeout(portfolio_handle_t, SHUTDOWN_TIMEOUT, "core-portfolio"),
            "core-portfolio",
        );
        record_fault(
            join_timeout(broker_handle, SHUTDOWN_TIMEOUT, "execution"),
            "execution",
        );

        self.transition(RunState::Finalizing);

        let accumulator = join_timeout(writer_handle, SHUTDOWN_TIMEOUT, "report-session")
            .unwrap_or_default();

        // ---- artifact ----

        let quarantined = quarantine.lock().clone();
        let error_block = match (&fatal, &quarantined) {
            (Some(e), _) => Some(SessionError {
                kind: error_kind(e).to_string(),
                message: e.to_string(),
            }),
            (None, Some(reason)) => Some(SessionError {
                kind: "StrategyQuarantined".to_string(),
                message: reason.clone(),
            }),
            (None, None) => None,
        };

        let artifact_path = self.params.output_path.clone();
        let artifact = SessionArtifact::build(self.params.clone(), accumulator, error_block);
        artifact.write(&artifact_path)?;

        self.transition(RunState::Done);
        info!("engine finished");

        match fatal {
            Some(e) => Err(e),
            None => Ok(RunOutcome {
                state: self.state,
                artifact_path,
                quarantined,
            }),
        }
    }
}

fn error_kind(error: &TlError) -> &'static str {
    match error {
        TlError::Config(_) => "ConfigError",
        TlError::DataSource(_) => "DataSourceError",
        TlError::Schema(_) => "SchemaError",
        TlError::Broker(BrokerError::Disconnected { .. }) => "BrokerDisconnect",
        TlError::Broker(_) => "BrokerError",
        TlError::State(_) => "StateError",
        TlError::Plugin(_) => "PluginError",
        TlError::Io(_) => "IoError",
        TlError::Serialization(_) => "SerializationError",
        TlError::Shutdown => "Shutdown",
    }
}

/// Join with a deadline. `None` means the thread outlived the timeout and
/// was abandoned (forced-exit escalation is the caller's policy).
fn join_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
    name: &str,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!(thread = name, "shutdown join timed out");
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().ok()
}
