//! End-to-end backtest scenarios over the full engine pipeline: recorded
//! stream in, session artifact out.

use chrono::{NaiveTime, TimeZone, Utc};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::Path;

use tl_core::{Engine, RiskRegistry, Strategy, StrategyContext, StrategyRegistry};
use tl_data::{write_stream_file, StreamMetadata};
use tl_report::SessionArtifact;
use tl_types::{
    price_to_scaled, Action, Currency, DataSourceConfig, FuturesMonth, GeneralConfig,
    MarketRecord, Mode, OhlcvBar, OrderType, PluginConfig, Position, RunConfig, SecurityType,
    SignalInstruction, Symbol, SymbolConfig, SymbolKind, TlResult, TradingSession,
};

// ---- stream fabrication ----

const AAPL_NATIVE: u32 = 7;
const HOGS_NATIVE: u32 = 8;

fn bar(native_id: u32, ts: i64, close: Decimal, rollover: bool) -> MarketRecord {
    let px = price_to_scaled(close);
    MarketRecord::Bar(OhlcvBar {
        instrument_id: native_id,
        ts_event: ts,
        rollover_flag: rollover,
        open: px,
        high: px,
        low: px,
        close: px,
        volume: 1_000,
    })
}

/// 2024-03-04 15:00:00 New York (EST) plus `offset` seconds, in UTC ns.
fn march_session_ts(offset: i64) -> i64 {
    Utc.with_ymd_and_hms(2024, 3, 4, 20, 0, 0)
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
        + offset * 1_000_000_000
}

/// 2024-04-12 (the lean-hog term day, EDT) at `hour:minute` New York.
fn april_ts(hour: u32, minute: u32) -> i64 {
    Utc.with_ymd_and_hms(2024, 4, 12, hour + 4, minute, 0)
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
}

fn write_stream(path: &Path, records: &[MarketRecord]) {
    let metadata = StreamMetadata {
        schema: "ohlcv-1s".to_string(),
        start_ns: records.first().map(|r| r.ts_event()).unwrap_or(0),
        end_ns: records.last().map(|r| r.ts_event()).unwrap_or(0),
        mappings: HashMap::from([
            (AAPL_NATIVE, "AAPL2".to_string()),
            (HOGS_NATIVE, "HE".to_string()),
        ]),
    };
    write_stream_file(path, records, &metadata).unwrap();
}

// ---- configuration ----

fn aapl_config() -> SymbolConfig {
    SymbolConfig {
        broker_ticker: "AAPL".to_string(),
        data_ticker: "AAPL2".to_string(),
        midas_ticker: "AAPL".to_string(),
        security_type: SecurityType::Stock,
        currency: Currency::USD,
        venue: "NASDAQ".to_string(),
        fees: dec!(0.1),
        quantity_multiplier: Decimal::ONE,
        price_multiplier: Decimal::ONE,
        initial_margin: Decimal::ZERO,
        slippage_factor: dec!(5),
        tick_size: dec!(0.01),
        trading_sessions: TradingSession {
            day_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            day_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        },
        kind: SymbolKind::Stock,
    }
}

fn hogs_config() -> SymbolConfig {
    SymbolConfig {
        broker_ticker: "HEJ4".to_string(),
        data_ticker: "HE".to_string(),
        midas_ticker: "HE.n.0".to_string(),
        security_type: SecurityType::Future,
        currency: Currency::USD,
        venue: "CME".to_string(),
        fees: dec!(0.85),
        quantity_multiplier: dec!(40000),
        price_multiplier: dec!(0.01),
        initial_margin: dec!(4564.17),
        slippage_factor: Decimal::ZERO,
        tick_size: dec!(0.00025),
        trading_sessions: TradingSession {
            day_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            day_close: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
        },
        kind: SymbolKind::Future {
            expiry_months: vec![FuturesMonth::G, FuturesMonth::J, FuturesMonth::Z],
            term_day_rule: "nth_business_day_10".to_string(),
            market_calendar: "CMEGlobex_Lean_Hog".to_string(),
            contract_size: dec!(40000),
        },
    }
}

fn config(
    symbols: Vec<SymbolConfig>,
    strategy: &str,
    capital: Decimal,
    data_path: &Path,
    output_path: &Path,
) -> RunConfig {
    RunConfig {
        general: GeneralConfig {
            strategy_name: strategy.to_string(),
            capital,
            data_type: tl_types::DataType::Bar,
            start: "2024-01-01".to_string(),
            end: "2024-06-30".to_string(),
            schema: "ohlcv-1s".to_string(),
            risk_free_rate: dec!(0.04),
            output_path: output_path.display().to_string(),
        },
        symbols,
        strategy: PluginConfig {
            name: strategy.to_string(),
            params: toml::Table::new(),
        },
        risk: None,
        data_source: DataSourceConfig::File {
            path: data_path.display().to_string(),
        },
        broker: None,
    }
}

// ---- scripted strategies ----

/// Emits one LONG for a single contract/share on every bar.
struct OneLotPerBar {
    next_signal_id: u32,
}

impl Strategy for OneLotPerBar {
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        _ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>> {
        if record.reference_price().is_none() {
            return Ok(vec![]);
        }
        let signal_id = self.next_signal_id;
        self.next_signal_id += 1;
        Ok(vec![SignalInstruction {
            instrument_id: record.instrument_id(),
            order_type: OrderType::Market,
            action: Action::Long,
            signal_id,
            weight: Decimal::ZERO,
            quantity: Some(Decimal::ONE),
            limit_price: None,
            aux_price: None,
        }])
    }
}

/// Opens a fixed-size long on the first bar, then stays quiet.
struct FixedOpenOnce {
    quantity: Decimal,
    opened: bool,
}

impl Strategy for FixedOpenOnce {
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        _ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>> {
        if self.opened || record.reference_price().is_none() {
            return Ok(vec![]);
        }
        self.opened = true;
        Ok(vec![SignalInstruction {
            instrument_id: record.instrument_id(),
            order_type: OrderType::Market,
            action: Action::Long,
            signal_id: 1,
            weight: Decimal::ZERO,
            quantity: Some(self.quantity),
            limit_price: None,
            aux_price: None,
        }])
    }
}

/// Buys one lot per bar, then panics on the fifth bar it sees.
struct PanicsOnFifthBar {
    seen: u32,
}

impl Strategy for PanicsOnFifthBar {
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        _ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>> {
        self.seen += 1;
        if self.seen == 5 {
            panic!("bar five is unlucky");
        }
        Ok(vec![SignalInstruction {
            instrument_id: record.instrument_id(),
            order_type: OrderType::Market,
            action: Action::Long,
            signal_id: self.seen,
            weight: Decimal::ZERO,
            quantity: Some(Decimal::ONE),
            limit_price: None,
            aux_price: None,
        }])
    }
}

fn registries() -> (StrategyRegistry, RiskRegistry) {
    let mut strategies = StrategyRegistry::with_builtins();
    strategies.register("one_lot_per_bar", |_| {
        Ok(Box::new(OneLotPerBar { next_signal_id: 1 }))
    });
    strategies.register("open_two_lots", |_| {
        Ok(Box::new(FixedOpenOnce {
            quantity: dec!(2),
            opened: false,
        }))
    });
    strategies.register("open_one_lot", |_| {
        Ok(Box::new(FixedOpenOnce {
            quantity: Decimal::ONE,
            opened: false,
        }))
    });
    strategies.register("panics_on_bar_5", |_| {
        Ok(Box::new(PanicsOnFifthBar { seen: 0 }))
    });
    (strategies, RiskRegistry::with_builtins())
}

fn read_artifact(path: &Path) -> SessionArtifact {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// ---- scenarios ----

/// S1: one weighted long in a stock; slippage and fees land where expected.
#[test]
fn single_stock_trade_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s1.bin");
    let out = dir.path().join("s1.json");

    write_stream(&data, &[bar(AAPL_NATIVE, march_session_ts(0), dec!(100), false)]);

    let mut cfg = config(vec![aapl_config()], "buy_and_hold", dec!(1000000), &data, &out);
    cfg.strategy
        .params
        .insert("weight".to_string(), toml::Value::Float(0.1));

    let (strategies, risks) = registries();
    let outcome = Engine::new(cfg, Mode::Backtest)
        .unwrap()
        .run(&strategies, &risks)
        .unwrap();
    assert!(outcome.quarantined.is_none());

    let artifact = read_artifact(&out);
    assert!(artifact.error.is_none());

    // Entry fill plus the terminal liquidation.
    assert_eq!(artifact.trades.len(), 2);
    let entry = &artifact.trades[0];
    assert_eq!(entry.quantity, dec!(1000));
    assert_eq!(entry.avg_price, dec!(100.05));
    assert_eq!(entry.fees, dec!(100));
    assert_eq!(entry.trade_value, dec!(-100050));

    let exit = &artifact.trades[1];
    assert_eq!(exit.quantity, dec!(-1000));
    assert_eq!(exit.avg_price, dec!(100));

    // 1,000,000 - 50 slippage - 100 entry fees - 100 exit fees.
    assert_eq!(artifact.static_stats.ending_equity, dec!(999750));
    assert_eq!(artifact.static_stats.net_profit, dec!(-250));
    assert_eq!(artifact.signals.len(), 1);
}

/// S2: futures EOD rollover on the calendar's term day.
#[test]
fn futures_eod_rollover() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s2.bin");
    let out = dir.path().join("s2.json");

    // In-session bar at 80.00, the next contract's first print at 80.10
    // (rollover-flagged), then a post-close bar to trigger EOD.
    write_stream(
        &data,
        &[
            bar(HOGS_NATIVE, april_ts(12, 0), dec!(80), false),
            bar(HOGS_NATIVE, april_ts(13, 30), dec!(80.10), true),
            bar(HOGS_NATIVE, april_ts(14, 30), dec!(80.10), true),
        ],
    );

    let cfg = config(vec![hogs_config()], "open_two_lots", dec!(1000000), &data, &out);
    let (strategies, risks) = registries();
    Engine::new(cfg, Mode::Backtest)
        .unwrap()
        .run(&strategies, &risks)
        .unwrap();

    let artifact = read_artifact(&out);
    let rollover_trades: Vec<_> = artifact.trades.iter().filter(|t| t.is_rollover).collect();
    assert_eq!(rollover_trades.len(), 2);

    let close_leg = rollover_trades[0];
    let open_leg = rollover_trades[1];
    assert_eq!(close_leg.action, Action::Sell);
    assert_eq!(close_leg.quantity, dec!(-2));
    assert_eq!(close_leg.avg_price, dec!(80));
    assert_eq!(open_leg.action, Action::Long);
    assert_eq!(open_leg.quantity, dec!(2));
    assert_eq!(open_leg.avg_price, dec!(80.10));

    // Entry at 80, rollover close at 80: no realized move on the closing
    // leg; the liquidation leg closes the reopened 2 lots.
    let exit = artifact.trades.last().unwrap();
    assert!(!exit.is_rollover);
    assert_eq!(exit.quantity, dec!(-2));
}

/// S3: two interleaved instruments replay deterministically.
#[test]
fn deterministic_interleaved_replay() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s3.bin");

    // 100 bars per instrument, interleaved in a seeded random order, with
    // timestamps assigned after the shuffle so the stream stays
    // time-ordered.
    let mut slots: Vec<(u32, Decimal)> = Vec::new();
    for i in 0..100i64 {
        slots.push((AAPL_NATIVE, dec!(10) + Decimal::new(i % 7, 2)));
        slots.push((HOGS_NATIVE, dec!(80) + Decimal::new(i % 5, 2)));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    slots.shuffle(&mut rng);
    let records: Vec<MarketRecord> = slots
        .into_iter()
        .enumerate()
        .map(|(i, (native, price))| bar(native, march_session_ts(i as i64), price, false))
        .collect();
    write_stream(&data, &records);

    let run = |out: &Path| {
        let cfg = config(
            vec![aapl_config(), hogs_config()],
            "one_lot_per_bar",
            dec!(100000000),
            &data,
            out,
        );
        let (strategies, risks) = registries();
        Engine::new(cfg, Mode::Backtest)
            .unwrap()
            .run(&strategies, &risks)
            .unwrap();
        read_artifact(out)
    };

    let first = run(&dir.path().join("s3a.json"));
    let second = run(&dir.path().join("s3b.json"));

    // One long per bar per instrument, plus two liquidation legs.
    let buys = |artifact: &SessionArtifact, id: u32| {
        artifact
            .trades
            .iter()
            .filter(|t| t.instrument_id == id && t.quantity > Decimal::ZERO)
            .count()
    };
    assert_eq!(buys(&first, 1), 100);
    assert_eq!(buys(&first, 2), 100);
    assert_eq!(first.trades.len(), 202);

    // A different thread schedule must not change the outcome.
    assert_eq!(first.trades, second.trades);
    assert_eq!(
        first.timeseries_stats.equity_curve,
        second.timeseries_stats.equity_curve
    );
    assert_eq!(
        first.static_stats.ending_equity,
        second.static_stats.ending_equity
    );
}

/// S4: an order whose margin exceeds available funds is rejected cleanly.
#[test]
fn insufficient_buying_power() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s4.bin");
    let out = dir.path().join("s4.json");

    write_stream(&data, &[bar(HOGS_NATIVE, april_ts(12, 0), dec!(80), false)]);

    let cfg = config(vec![hogs_config()], "open_one_lot", dec!(1000), &data, &out);
    let (strategies, risks) = registries();
    let outcome = Engine::new(cfg, Mode::Backtest)
        .unwrap()
        .run(&strategies, &risks)
        .unwrap();
    assert!(outcome.quarantined.is_none());

    let artifact = read_artifact(&out);
    assert!(artifact.trades.is_empty());
    assert!(artifact.error.is_none());
    assert_eq!(artifact.static_stats.ending_equity, dec!(1000));
}

/// S5: a strategy fault is contained; the stream finishes and the artifact
/// carries the quarantine reason.
#[test]
fn strategy_fault_containment() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s5.bin");
    let out = dir.path().join("s5.json");

    let records: Vec<MarketRecord> = (0..10)
        .map(|i| bar(AAPL_NATIVE, march_session_ts(i), dec!(50), false))
        .collect();
    write_stream(&data, &records);

    let cfg = config(vec![aapl_config()], "panics_on_bar_5", dec!(1000000), &data, &out);
    let (strategies, risks) = registries();
    let outcome = Engine::new(cfg, Mode::Backtest)
        .unwrap()
        .run(&strategies, &risks)
        .unwrap();

    assert!(outcome
        .quarantined
        .as_deref()
        .unwrap()
        .contains("bar five is unlucky"));

    let artifact = read_artifact(&out);
    let error = artifact.error.unwrap();
    assert_eq!(error.kind, "StrategyQuarantined");
    assert!(error.message.contains("bar five is unlucky"));

    // Four fills before the fault, one liquidation after the full stream.
    let buys = artifact
        .trades
        .iter()
        .filter(|t| t.quantity > Decimal::ZERO)
        .count();
    assert_eq!(buys, 4);
    assert_eq!(artifact.trades.len(), 5);
}

/// S6: an external SHUTDOWN mid-stream still produces an artifact with the
/// trades recorded so far.
#[test]
fn graceful_shutdown_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("s6.bin");
    let out = dir.path().join("s6.json");

    let records: Vec<MarketRecord> = (0..50_000)
        .map(|i| bar(AAPL_NATIVE, march_session_ts(i), dec!(50), false))
        .collect();
    write_stream(&data, &records);

    let cfg = config(vec![aapl_config()], "one_lot_per_bar", dec!(100000000), &data, &out);
    let engine = Engine::new(cfg, Mode::Backtest).unwrap();
    let bus = engine.bus();

    let runner = std::thread::spawn(move || {
        let (strategies, risks) = registries();
        engine.run(&strategies, &risks)
    });

    std::thread::sleep(std::time::Duration::from_millis(100));
    bus.shutdown();

    let outcome = runner.join().unwrap().unwrap();
    assert_eq!(outcome.state, tl_core::RunState::Done);

    let artifact = read_artifact(&out);
    // Partial progress, not the whole stream.
    assert!(artifact.trades.len() < 50_001);
}

/// Ledger invariant: for any fill sequence on one instrument,
/// cash + market_value == initial + realized + unrealized - fees.
#[test]
fn ledger_identity_over_random_fills() {
    use rand::Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mult = dec!(2);
    let initial_cash = dec!(1000000);

    for _ in 0..50 {
        let mut position = Position::new(1);
        let mut cash = initial_cash;
        let mut fees_total = Decimal::ZERO;
        let mut realized_total = Decimal::ZERO;
        let mut price = dec!(100);

        for _ in 0..40 {
            price += Decimal::new(rng.gen_range(-200..=200), 2);
            if price < dec!(1) {
                price = dec!(1);
            }
            let delta = Decimal::from(rng.gen_range(-5..=5i64));
            if delta == Decimal::ZERO {
                continue;
            }

            realized_total += position.apply_delta(delta, price, mult, 0);
            let fees = delta.abs() * dec!(0.1);
            cash += -(delta * price * mult) - fees;
            fees_total += fees;
        }

        let symbol = Symbol {
            instrument_id: 1,
            broker_ticker: "AAPL".to_string(),
            data_ticker: "AAPL2".to_string(),
            midas_ticker: "AAPL".to_string(),
            security_type: SecurityType::Stock,
            currency: Currency::USD,
            venue: "NASDAQ".to_string(),
            fees: dec!(0.1),
            quantity_multiplier: mult,
            price_multiplier: Decimal::ONE,
            initial_margin: Decimal::ZERO,
            slippage_factor: Decimal::ZERO,
            tick_size: dec!(0.01),
            trading_sessions: TradingSession {
                day_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                day_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            },
            kind: SymbolKind::Stock,
        };
        position.mark_to_market(price, &symbol, 0);

        let lhs = cash + position.market_value;
        let rhs = initial_cash + realized_total + position.unrealized_pnl - fees_total;
        assert!(
            (lhs - rhs).abs() < dec!(0.000001),
            "ledger identity broken: {lhs} vs {rhs}"
        );
    }
}
