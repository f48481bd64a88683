use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::symbol::InstrumentId;

/// Fixed-point scale applied to every price on the wire (1e9).
pub const PRICE_SCALE: i64 = 1_000_000_000;

/// Book depth carried by a quote record.
pub const DEPTH_LEVELS: usize = 10;

/// Convert a wire price (scaled integer) into a [`Decimal`].
pub fn price_from_scaled(raw: i64) -> Decimal {
    Decimal::new(raw, 9)
}

/// Convert a [`Decimal`] price into its wire representation.
/// Truncates any precision beyond 1e-9.
pub fn price_to_scaled(price: Decimal) -> i64 {
    let mut p = price;
    p.rescale(9);
    p.mantissa() as i64
}

/// Aggregated open/high/low/close/volume sample over a time window.
/// Prices are wire-scaled integers; use the accessor methods for math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub instrument_id: InstrumentId,
    pub ts_event: i64,
    pub rollover_flag: bool,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: u64,
}

impl OhlcvBar {
    pub fn open_price(&self) -> Decimal {
        price_from_scaled(self.open)
    }

    pub fn high_price(&self) -> Decimal {
        price_from_scaled(self.high)
    }

    pub fn low_price(&self) -> Decimal {
        price_from_scaled(self.low)
    }

    pub fn close_price(&self) -> Decimal {
        price_from_scaled(self.close)
    }
}

/// One depth level of a best-bid-offer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BidAskPair {
    pub bid_px: i64,
    pub ask_px: i64,
    pub bid_sz: u32,
    pub ask_sz: u32,
    pub bid_ct: u32,
    pub ask_ct: u32,
}

/// Best bid / best offer snapshot with market depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BboQuote {
    pub instrument_id: InstrumentId,
    pub ts_event: i64,
    pub rollover_flag: bool,
    pub price: i64,
    pub size: u32,
    pub side: u8,
    pub flags: u8,
    pub ts_recv: i64,
    pub sequence: u32,
    pub levels: Vec<BidAskPair>,
}

impl BboQuote {
    /// Best bid, from the top depth level.
    pub fn bid_price(&self) -> Decimal {
        price_from_scaled(self.levels.first().map(|l| l.bid_px).unwrap_or(0))
    }

    /// Best ask, from the top depth level.
    pub fn ask_price(&self) -> Decimal {
        price_from_scaled(self.levels.first().map(|l| l.ask_px).unwrap_or(0))
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price() + self.ask_price()) / Decimal::TWO
    }
}

/// Synthetic per-day bookkeeping trigger: mark-to-market, futures rollover,
/// margin reset.
///
/// `liquidate` marks the terminal event emitted at end-of-buffer; the broker
/// closes every open position at the last known price before the run
/// finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EodEvent {
    pub instrument_id: InstrumentId,
    pub ts_event: i64,
    pub date: NaiveDate,
    pub liquidate: bool,
}

/// Tagged variant over every record the data engines produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketRecord {
    Bar(OhlcvBar),
    Quote(BboQuote),
    EndOfDay(EodEvent),
}

impl MarketRecord {
    pub fn instrument_id(&self) -> InstrumentId {
        match self {
            MarketRecord::Bar(b) => b.instrument_id,
            MarketRecord::Quote(q) => q.instrument_id,
            MarketRecord::EndOfDay(e) => e.instrument_id,
        }
    }

    pub fn set_instrument_id(&mut self, id: InstrumentId) {
        match self {
            MarketRecord::Bar(b) => b.instrument_id = id,
            MarketRecord::Quote(q) => q.instrument_id = id,
            MarketRecord::EndOfDay(e) => e.instrument_id = id,
        }
    }

    pub fn ts_event(&self) -> i64 {
        match self {
            MarketRecord::Bar(b) => b.ts_event,
            MarketRecord::Quote(q) => q.ts_event,
            MarketRecord::EndOfDay(e) => e.ts_event,
        }
    }

    pub fn rollover_flag(&self) -> bool {
        match self {
            MarketRecord::Bar(b) => b.rollover_flag,
            MarketRecord::Quote(q) => q.rollover_flag,
            MarketRecord::EndOfDay(_) => false,
        }
    }

    /// Price a marketable buy would cross at: the ask for quotes, the close
    /// for bars.
    pub fn buy_price(&self) -> Option<Decimal> {
        match self {
            MarketRecord::Bar(b) => Some(b.close_price()),
            MarketRecord::Quote(q) => Some(q.ask_price()),
            MarketRecord::EndOfDay(_) => None,
        }
    }

    /// Price a marketable sell would cross at: the bid for quotes, the close
    /// for bars.
    pub fn sell_price(&self) -> Option<Decimal> {
        match self {
            MarketRecord::Bar(b) => Some(b.close_price()),
            MarketRecord::Quote(q) => Some(q.bid_price()),
            MarketRecord::EndOfDay(_) => None,
        }
    }

    /// Reference price for sizing and mark-to-market.
    pub fn reference_price(&self) -> Option<Decimal> {
        match self {
            MarketRecord::Bar(b) => Some(b.close_price()),
            MarketRecord::Quote(q) => Some(q.mid_price()),
            MarketRecord::EndOfDay(_) => None,
        }
    }
}
