use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::symbol::InstrumentId;

/// Direction of a strategy instruction.
///
/// `Long`/`Short` open exposure, `Sell`/`Cover` reduce it. The distinction
/// matters for reporting; for ledger math only the sign matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Long,
    Sell,
    Short,
    Cover,
}

impl Action {
    /// +1 for buy-side actions, -1 for sell-side.
    pub fn sign(&self) -> i8 {
        match self {
            Action::Long | Action::Cover => 1,
            Action::Sell | Action::Short => -1,
        }
    }

    /// Signed quantity delta for a fill of `quantity` units.
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        match self.sign() {
            1 => quantity.abs(),
            _ => -quantity.abs(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Long => "LONG",
            Action::Sell => "SELL",
            Action::Short => "SHORT",
            Action::Cover => "COVER",
        };
        write!(f, "{}", s)
    }
}

/// Order types supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stoploss,
}

/// Order status during lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    PreSubmitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal orders are dropped from the active-order ledger.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// An order request published on the ORDER topic by the order manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub timestamp: i64,
    pub order_id: u32,
    pub signal_id: u32,
    pub instrument_id: InstrumentId,
    pub action: Action,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub aux_price: Option<Decimal>,
}

/// An order in non-terminal status, tracked by the portfolio server.
///
/// Invariant: `filled + remaining == total_qty` at every point of the
/// lifecycle New -> Submitted -> (PartiallyFilled*) -> Filled | Cancelled |
/// Rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub perm_id: u32,
    pub client_id: u32,
    pub order_id: u32,
    pub parent_id: u32,
    pub account: String,
    pub instrument_id: InstrumentId,
    pub signal_id: u32,
    pub action: Action,
    pub order_type: OrderType,
    pub total_qty: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub limit_price: Option<Decimal>,
    pub aux_price: Option<Decimal>,
}

impl ActiveOrder {
    /// Build the ledger entry for a freshly published order request.
    pub fn from_event(event: &OrderEvent, account: &str) -> Self {
        Self {
            perm_id: event.order_id,
            client_id: 0,
            order_id: event.order_id,
            parent_id: 0,
            account: account.to_string(),
            instrument_id: event.instrument_id,
            signal_id: event.signal_id,
            action: event.action,
            order_type: event.order_type,
            total_qty: event.quantity,
            filled: Decimal::ZERO,
            remaining: event.quantity,
            avg_fill_price: Decimal::ZERO,
            status: OrderStatus::Submitted,
            limit_price: event.limit_price,
            aux_price: event.aux_price,
        }
    }

    /// Record a (partial) execution against this order.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal) {
        let fill_qty = quantity.abs().min(self.remaining);
        let total_filled = self.filled + fill_qty;

        if total_filled > Decimal::ZERO {
            self.avg_fill_price =
                (self.avg_fill_price * self.filled + price * fill_qty) / total_filled;
        }

        self.filled = total_filled;
        self.remaining = self.total_qty - total_filled;
        self.status = if self.remaining == Decimal::ZERO {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Cancelled;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status transition published on the ORDER_UPDATE topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdateEvent {
    pub timestamp: i64,
    pub order_id: u32,
    pub signal_id: u32,
    pub instrument_id: InstrumentId,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub avg_fill_price: Decimal,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order_event(qty: Decimal) -> OrderEvent {
        OrderEvent {
            timestamp: 0,
            order_id: 1,
            signal_id: 1,
            instrument_id: 1,
            action: Action::Long,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
            aux_price: None,
        }
    }

    #[test]
    fn test_action_sign() {
        assert_eq!(Action::Long.sign(), 1);
        assert_eq!(Action::Cover.sign(), 1);
        assert_eq!(Action::Sell.sign(), -1);
        assert_eq!(Action::Short.sign(), -1);
        assert_eq!(Action::Short.signed(dec!(5)), dec!(-5));
    }

    #[test]
    fn test_partial_fill_accounting() {
        let mut order = ActiveOrder::from_event(&order_event(dec!(100)), "sim");

        order.apply_fill(dec!(40), dec!(10));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled, dec!(40));
        assert_eq!(order.remaining, dec!(60));
        assert_eq!(order.filled + order.remaining, order.total_qty);

        order.apply_fill(dec!(60), dec!(12));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.remaining, Decimal::ZERO);
        assert_eq!(order.avg_fill_price, dec!(11.2));
        assert!(order.is_terminal());
    }

    #[test]
    fn test_overfill_is_clamped() {
        let mut order = ActiveOrder::from_event(&order_event(dec!(10)), "sim");
        order.apply_fill(dec!(25), dec!(10));
        assert_eq!(order.filled, dec!(10));
        assert_eq!(order.remaining, Decimal::ZERO);
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_cancel_only_mutates_active() {
        let mut order = ActiveOrder::from_event(&order_event(dec!(10)), "sim");
        order.apply_fill(dec!(10), dec!(10));
        order.cancel();
        assert_eq!(order.status, OrderStatus::Filled);

        let mut order = ActiveOrder::from_event(&order_event(dec!(10)), "sim");
        order.cancel();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }
}
