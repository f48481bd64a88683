use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{TlError, TlResult};
use crate::orders::{Action, OrderType};
use crate::symbol::InstrumentId;

/// A single trade instruction emitted by a strategy.
///
/// `weight` expresses the fraction of capital to commit (sign implied by the
/// action); an explicit `quantity` overrides weight-based sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInstruction {
    pub instrument_id: InstrumentId,
    pub order_type: OrderType,
    pub action: Action,
    pub signal_id: u32,
    pub weight: Decimal,
    pub quantity: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub aux_price: Option<Decimal>,
}

impl SignalInstruction {
    /// Enforce the instruction constraints before it enters the pipeline.
    pub fn validate(&self) -> TlResult<()> {
        if self.signal_id == 0 {
            return Err(TlError::Config("signal_id must be greater than zero".into()));
        }
        if self.weight.abs() > Decimal::ONE {
            return Err(TlError::Config(format!(
                "signal weight {} outside [-1, 1]",
                self.weight
            )));
        }
        if let Some(qty) = self.quantity {
            if qty <= Decimal::ZERO {
                return Err(TlError::Config("explicit quantity must be positive".into()));
            }
        }
        if let Some(px) = self.limit_price {
            if px <= Decimal::ZERO {
                return Err(TlError::Config("limit_price must be positive".into()));
            }
        }
        if let Some(px) = self.aux_price {
            if px <= Decimal::ZERO {
                return Err(TlError::Config("aux_price must be positive".into()));
            }
        }
        Ok(())
    }
}

/// A batch of instructions produced from one strategy invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub timestamp: i64,
    pub instructions: Vec<SignalInstruction>,
}

impl SignalEvent {
    pub fn new(timestamp: i64, instructions: Vec<SignalInstruction>) -> TlResult<Self> {
        if instructions.is_empty() {
            return Err(TlError::Config(
                "signal event requires at least one instruction".into(),
            ));
        }
        for instruction in &instructions {
            instruction.validate()?;
        }
        Ok(Self {
            timestamp,
            instructions,
        })
    }

    /// All distinct signal ids carried by this event.
    pub fn signal_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.instructions.iter().map(|i| i.signal_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
