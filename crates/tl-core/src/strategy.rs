//! Strategy seam and registry.
//!
//! Strategies are message-driven state machines: the host hands them one
//! market record at a time and they answer with zero or more signal
//! instructions. Any history, counters, or warm-up logic lives inside the
//! strategy itself; the engine never suspends it mid-call.
//!
//! Concrete strategies are resolved by name from a [`StrategyRegistry`]
//! populated at process start. The configuration selects one by name and
//! passes its free-form parameter table through.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

use tl_data::OrderBook;
use tl_types::{
    Action, InstrumentId, MarketRecord, OrderType, PluginError, SignalInstruction, SymbolMap,
    TlResult,
};

use crate::portfolio_server::PortfolioHandle;

/// Read-only view handed to a strategy on every event.
#[derive(Clone)]
pub struct StrategyContext {
    pub symbols: Arc<SymbolMap>,
    pub book: Arc<OrderBook>,
    pub portfolio: PortfolioHandle,
}

impl StrategyContext {
    /// Signed quantity currently held in an instrument.
    pub fn position_quantity(&self, id: InstrumentId) -> Decimal {
        self.portfolio
            .lock()
            .position(id)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn equity(&self) -> Decimal {
        self.portfolio.lock().equity()
    }
}

/// The capability set every pluggable strategy implements.
pub trait Strategy: Send {
    /// Handle one market record, returning any signal instructions it
    /// produces. Errors (and panics) quarantine the strategy.
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>>;

    /// Free-form diagnostic table included with operator tooling.
    fn strategy_data(&self) -> serde_json::Value {
        serde_json::Value::Object(Default::default())
    }
}

type StrategyFactory = Box<dyn Fn(&toml::Table) -> TlResult<Box<dyn Strategy>> + Send + Sync>;

/// Name -> constructor table for strategies.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in sample strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("buy_and_hold", |params| {
            Ok(Box::new(BuyAndHoldStrategy::from_params(params)))
        });
        registry.register("sma_cross", |params| {
            Ok(Box::new(SmaCrossStrategy::from_params(params)))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table) -> TlResult<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, params: &toml::Table) -> TlResult<Box<dyn Strategy>> {
        match self.factories.get(name) {
            Some(factory) => factory(params),
            None => Err(PluginError::StrategyNotFound {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

fn param_i64(params: &toml::Table, key: &str, default: i64) -> i64 {
    params.get(key).and_then(|v| v.as_integer()).unwrap_or(default)
}

fn param_f64(params: &toml::Table, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_float()).unwrap_or(default)
}

/// Opens one position per instrument on its first record and holds.
pub struct BuyAndHoldStrategy {
    weight: Decimal,
    opened: HashMap<InstrumentId, bool>,
    next_signal_id: u32,
}

impl BuyAndHoldStrategy {
    pub fn from_params(params: &toml::Table) -> Self {
        Self {
            weight: Decimal::try_from(param_f64(params, "weight", 0.1)).unwrap_or(Decimal::ONE),
            opened: HashMap::new(),
            next_signal_id: 1,
        }
    }
}

impl Strategy for BuyAndHoldStrategy {
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        _ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>> {
        if record.reference_price().is_none() {
            return Ok(vec![]);
        }
        let id = record.instrument_id();
        if *self.opened.get(&id).unwrap_or(&false) {
            return Ok(vec![]);
        }
        self.opened.insert(id, true);

        let signal_id = self.next_signal_id;
        self.next_signal_id += 1;
        Ok(vec![SignalInstruction {
            instrument_id: id,
            order_type: OrderType::Market,
            action: Action::Long,
            signal_id,
            weight: self.weight,
            quantity: None,
            limit_price: None,
            aux_price: None,
        }])
    }

    fn strategy_data(&self) -> serde_json::Value {
        serde_json::json!({ "opened": self.opened.len() })
    }
}

/// Classic fast/slow moving-average crossover, one state machine per
/// instrument.
pub struct SmaCrossStrategy {
    fast: usize,
    slow: usize,
    weight: Decimal,
    closes: HashMap<InstrumentId, Vec<Decimal>>,
    last_side: HashMap<InstrumentId, i8>,
    next_signal_id: u32,
}

impl SmaCrossStrategy {
    pub fn from_params(params: &toml::Table) -> Self {
        let fast = param_i64(params, "fast", 10).max(1) as usize;
        let slow = param_i64(params, "slow", 30).max(2) as usize;
        Self {
            fast: fast.min(slow.saturating_sub(1)).max(1),
            slow,
            weight: Decimal::try_from(param_f64(params, "weight", 0.25))
                .unwrap_or_else(|_| Decimal::new(25, 2)),
            closes: HashMap::new(),
            last_side: HashMap::new(),
            next_signal_id: 1,
        }
    }

    fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
        if values.len() < period {
            return None;
        }
        let sum: Decimal = values.iter().rev().take(period).sum();
        Some(sum / Decimal::from(period))
    }
}

impl Strategy for SmaCrossStrategy {
    fn handle_event(
        &mut self,
        record: &MarketRecord,
        ctx: &StrategyContext,
    ) -> TlResult<Vec<SignalInstruction>> {
        let Some(price) = record.reference_price() else {
            return Ok(vec![]);
        };
        let id = record.instrument_id();

        let closes = self.closes.entry(id).or_default();
        closes.push(price);
        if closes.len() > self.slow + 1 {
            closes.remove(0);
        }

        let (Some(fast_ma), Some(slow_ma)) =
            (Self::sma(closes, self.fast), Self::sma(closes, self.slow))
        else {
            return Ok(vec![]);
        };

        let side: i8 = if fast_ma > slow_ma {
            1
        } else if fast_ma < slow_ma {
            -1
        } else {
            0
        };
        let previous = *self.last_side.get(&id).unwrap_or(&0);
        if side == 0 || side == previous {
            return Ok(vec![]);
        }
        self.last_side.insert(id, side);

        let held = ctx.position_quantity(id);
        let mut instructions = Vec::new();
        let signal_id = self.next_signal_id;
        self.next_signal_id += 1;

        if side > 0 {
            if held < Decimal::ZERO {
                instructions.push(SignalInstruction {
                    instrument_id: id,
                    order_type: OrderType::Market,
                    action: Action::Cover,
                    signal_id,
                    weight: Decimal::ZERO,
                    quantity: Some(held.abs()),
                    limit_price: None,
                    aux_price: None,
                });
            }
            instructions.push(SignalInstruction {
                instrument_id: id,
                order_type: OrderType::Market,
                action: Action::Long,
                signal_id,
                weight: self.weight,
                quantity: None,
                limit_price: None,
                aux_price: None,
            });
        } else {
            if held > Decimal::ZERO {
                instructions.push(SignalInstruction {
                    instrument_id: id,
                    order_type: OrderType::Market,
                    action: Action::Sell,
                    signal_id,
                    weight: Decimal::ZERO,
                    quantity: Some(held),
                    limit_price: None,
                    aux_price: None,
                });
            }
            instructions.push(SignalInstruction {
                instrument_id: id,
                order_type: OrderType::Market,
                action: Action::Short,
                signal_id,
                weight: -self.weight,
                quantity: None,
                limit_price: None,
                aux_price: None,
            });
        }

        Ok(instructions)
    }

    fn strategy_data(&self) -> serde_json::Value {
        serde_json::json!({
            "fast": self.fast,
            "slow": self.slow,
            "instruments": self.closes.len(),
        })
    }
}
