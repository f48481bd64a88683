use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::orders::Action;
use crate::symbol::{InstrumentId, SecurityType};

/// An executed fill, as recorded in the session artifact.
///
/// `trade_value` is the signed cash impact of the fill excluding fees
/// (negative for buys); `trade_cost` is the absolute capital consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub signal_id: u32,
    pub timestamp: i64,
    pub instrument_id: InstrumentId,
    pub security_type: SecurityType,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub trade_value: Decimal,
    pub trade_cost: Decimal,
    pub action: Action,
    pub fees: Decimal,
    pub is_rollover: bool,
}

/// Commission reported out-of-band by a live broker. Merged into the stored
/// [`Trade`] by `trade_id`; the simulated broker reports fees inline instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub trade_id: String,
    pub commission: Decimal,
    pub currency: crate::symbol::Currency,
}
