use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use serde::{Deserialize, Serialize};

use crate::symbol::{Currency, InstrumentId, Symbol};

/// Open exposure in one instrument.
///
/// Invariant: a position with `quantity == 0` never survives; the owner
/// drops it from its map the moment it flattens (`avg_cost` is reset to zero
/// first so a resurrected entry starts clean).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: InstrumentId,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub market_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub margin_required: Decimal,
    pub last_updated_ns: i64,
}

impl Position {
    pub fn new(instrument_id: InstrumentId) -> Self {
        Self {
            instrument_id,
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            market_price: Decimal::ZERO,
            market_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            margin_required: Decimal::ZERO,
            last_updated_ns: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    /// Apply a signed quantity delta filled at `price`.
    ///
    /// Additions re-average the cost basis; reductions accrue realized PnL
    /// through the value multiplier; a reversal closes the whole position and
    /// re-opens the residual at the fill price. Returns the realized PnL
    /// produced by this fill.
    pub fn apply_delta(
        &mut self,
        delta: Decimal,
        price: Decimal,
        value_multiplier: Decimal,
        ts_event: i64,
    ) -> Decimal {
        let mut realized = Decimal::ZERO;

        if self.quantity == Decimal::ZERO || self.quantity.signum() == delta.signum() {
            // Opening or adding: re-average the cost basis.
            let total = self.quantity.abs() + delta.abs();
            if total > Decimal::ZERO {
                self.avg_cost =
                    (self.avg_cost * self.quantity.abs() + price * delta.abs()) / total;
            }
            self.quantity += delta;
        } else if delta.abs() <= self.quantity.abs() {
            // Reducing (possibly to flat): cost basis unchanged.
            let closed = delta.abs();
            realized = (price - self.avg_cost) * closed * self.quantity.signum() * value_multiplier;
            self.quantity += delta;
            if self.quantity == Decimal::ZERO {
                self.avg_cost = Decimal::ZERO;
            }
        } else {
            // Reversal: close fully, open the residual on the other side.
            let closed = self.quantity.abs();
            realized = (price - self.avg_cost) * closed * self.quantity.signum() * value_multiplier;
            self.quantity += delta;
            self.avg_cost = price;
        }

        self.realized_pnl += realized;
        self.last_updated_ns = ts_event;
        realized
    }

    /// Revalue at the latest market price.
    pub fn mark_to_market(&mut self, price: Decimal, symbol: &Symbol, ts_event: i64) {
        let mult = symbol.value_multiplier();
        self.market_price = price;
        self.market_value = self.quantity * price * mult;
        self.unrealized_pnl = (price - self.avg_cost) * self.quantity * mult;
        self.margin_required = symbol.initial_margin * self.quantity.abs();
        self.last_updated_ns = ts_event;
    }
}

/// Account-level cash and equity snapshot.
///
/// Invariant: `equity == cash + sum(position.market_value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub equity: Decimal,
    pub full_initial_margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub currency: Currency,
    pub timestamp: i64,
}

impl Account {
    pub fn new(cash: Decimal, currency: Currency) -> Self {
        Self {
            cash,
            buying_power: cash,
            equity: cash,
            full_initial_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            currency,
            timestamp: 0,
        }
    }
}

/// Payload for the POSITION_UPDATE topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub instrument_id: InstrumentId,
    /// `None` means the position flattened and was removed.
    pub position: Option<Position>,
}
