use chrono::{NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque instrument identifier assigned by [`SymbolMap`] registration.
/// Stable for the duration of a run.
pub type InstrumentId = u32;

/// Security classes supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    Stock,
    Future,
    Option,
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityType::Stock => "STOCK",
            SecurityType::Future => "FUTURE",
            SecurityType::Option => "OPTION",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    USD,
    CAD,
    EUR,
}

/// Regular trading session boundaries, exchange-local wall clock
/// (`America/New_York` for every venue currently supported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    pub day_open: NaiveTime,
    pub day_close: NaiveTime,
}

/// Contract month codes used in futures expiry cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuturesMonth {
    F, // Jan
    G, // Feb
    H, // Mar
    J, // Apr
    K, // May
    M, // Jun
    N, // Jul
    Q, // Aug
    U, // Sep
    V, // Oct
    X, // Nov
    Z, // Dec
}

impl FuturesMonth {
    pub fn month_number(&self) -> u32 {
        match self {
            FuturesMonth::F => 1,
            FuturesMonth::G => 2,
            FuturesMonth::H => 3,
            FuturesMonth::J => 4,
            FuturesMonth::K => 5,
            FuturesMonth::M => 6,
            FuturesMonth::N => 7,
            FuturesMonth::Q => 8,
            FuturesMonth::U => 9,
            FuturesMonth::V => 10,
            FuturesMonth::X => 11,
            FuturesMonth::Z => 12,
        }
    }
}

/// Per-variant contract details. The tag drives fee, margin, and multiplier
/// dispatch; shared metadata lives on [`Symbol`] itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SymbolKind {
    Stock,
    Future {
        expiry_months: Vec<FuturesMonth>,
        term_day_rule: String,
        market_calendar: String,
        contract_size: Decimal,
    },
    Option {
        expiry: String,
        strike: Decimal,
        is_call: bool,
    },
}

/// Immutable instrument metadata.
///
/// One record per tradable instrument, registered at startup and shared
/// read-only across every engine. Fees are per-share for stocks and
/// per-contract for futures/options; `price_multiplier` and
/// `quantity_multiplier` convert a quoted price and a contract count into
/// notional value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub instrument_id: InstrumentId,
    pub broker_ticker: String,
    pub data_ticker: String,
    /// Canonical key within the Midas data platform.
    pub midas_ticker: String,
    pub security_type: SecurityType,
    pub currency: Currency,
    pub venue: String,
    pub fees: Decimal,
    pub quantity_multiplier: Decimal,
    pub price_multiplier: Decimal,
    pub initial_margin: Decimal,
    pub slippage_factor: Decimal,
    pub tick_size: Decimal,
    pub trading_sessions: TradingSession,
    pub kind: SymbolKind,
}

impl Symbol {
    /// Combined multiplier converting (price, quantity) into notional value.
    pub fn value_multiplier(&self) -> Decimal {
        self.price_multiplier * self.quantity_multiplier
    }

    /// Commission for a fill of `quantity` units (shares or contracts).
    pub fn commission(&self, quantity: Decimal) -> Decimal {
        quantity.abs() * self.fees
    }

    /// Directional slippage applied to a fill price: one increment of
    /// `slippage_factor * tick_size` in the direction of the aggressing side.
    pub fn slippage(&self) -> Decimal {
        self.slippage_factor * self.tick_size
    }

    /// Capital required to carry `quantity` units. Margined products use the
    /// exchange initial margin; everything else consumes full notional.
    pub fn required_capital(&self, quantity: Decimal, price: Decimal) -> Decimal {
        if self.initial_margin > Decimal::ZERO {
            self.initial_margin * quantity.abs()
        } else {
            price * quantity.abs() * self.value_multiplier()
        }
    }

    /// True when `ts_event` (UTC ns) falls after this symbol's day-session
    /// close on its own trading date.
    pub fn after_day_close(&self, ts_event: i64) -> bool {
        let utc = Utc.timestamp_nanos(ts_event);
        let local = utc.with_timezone(&New_York);
        local.time() > self.trading_sessions.day_close
    }

    pub fn is_future(&self) -> bool {
        matches!(self.kind, SymbolKind::Future { .. })
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.midas_ticker)
    }
}

/// Immutable lookup of instrument metadata.
///
/// Two primary tables (`instrument_id -> Symbol`, `midas_ticker -> id`) plus
/// per-convention ticker caches so each adaptor can resolve its own naming
/// scheme without string probing. Populated at init, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    by_id: HashMap<InstrumentId, Symbol>,
    by_midas: HashMap<String, InstrumentId>,
    by_broker: HashMap<String, InstrumentId>,
    by_data: HashMap<String, InstrumentId>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol under every ticker convention it carries.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.by_midas
            .insert(symbol.midas_ticker.clone(), symbol.instrument_id);
        self.by_broker
            .insert(symbol.broker_ticker.clone(), symbol.instrument_id);
        self.by_data
            .insert(symbol.data_ticker.clone(), symbol.instrument_id);
        self.by_id.insert(symbol.instrument_id, symbol);
    }

    pub fn get(&self, id: InstrumentId) -> Option<&Symbol> {
        self.by_id.get(&id)
    }

    pub fn get_by_midas_ticker(&self, ticker: &str) -> Option<&Symbol> {
        self.by_midas.get(ticker).and_then(|id| self.by_id.get(id))
    }

    pub fn id_for_data_ticker(&self, ticker: &str) -> Option<InstrumentId> {
        self.by_data.get(ticker).copied()
    }

    pub fn id_for_broker_ticker(&self, ticker: &str) -> Option<InstrumentId> {
        self.by_broker.get(ticker).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
