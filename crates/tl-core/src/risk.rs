//! Pluggable pre-trade risk gate.
//!
//! A risk model sees every signal batch before the order manager converts
//! it. It may pass the instructions through, modify them, or return an empty
//! list to reject the batch outright. Models are resolved by name from a
//! registry, mirroring the strategy seam.

use rust_decimal::Decimal;
use std::collections::HashMap;

use tl_types::{Account, InstrumentId, PluginError, Position, SignalInstruction, TlResult};

/// Point-in-time portfolio view handed to the risk model.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub account: Account,
    pub positions: HashMap<InstrumentId, Position>,
}

/// The capability set every pluggable risk model implements.
pub trait RiskModel: Send {
    /// Return the instructions to forward: the originals, a modified list,
    /// or empty to reject.
    fn evaluate(
        &self,
        instructions: Vec<SignalInstruction>,
        portfolio: &PortfolioSnapshot,
    ) -> Vec<SignalInstruction>;
}

type RiskFactory = Box<dyn Fn(&toml::Table) -> TlResult<Box<dyn RiskModel>> + Send + Sync>;

#[derive(Default)]
pub struct RiskRegistry {
    factories: HashMap<String, RiskFactory>,
}

impl RiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("pass_through", |_| Ok(Box::new(PassThroughRisk)));
        registry.register("max_weight", |params| {
            let cap = params
                .get("cap")
                .and_then(|v| v.as_float())
                .unwrap_or(0.25);
            Ok(Box::new(MaxWeightRisk {
                cap: Decimal::try_from(cap).unwrap_or_else(|_| Decimal::new(25, 2)),
            }))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table) -> TlResult<Box<dyn RiskModel>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, params: &toml::Table) -> TlResult<Box<dyn RiskModel>> {
        match self.factories.get(name) {
            Some(factory) => factory(params),
            None => Err(PluginError::RiskModelNotFound {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

/// Default model: forwards everything untouched.
pub struct PassThroughRisk;

impl RiskModel for PassThroughRisk {
    fn evaluate(
        &self,
        instructions: Vec<SignalInstruction>,
        _portfolio: &PortfolioSnapshot,
    ) -> Vec<SignalInstruction> {
        instructions
    }
}

/// Clamps every instruction's weight into `[-cap, cap]`.
pub struct MaxWeightRisk {
    cap: Decimal,
}

impl RiskModel for MaxWeightRisk {
    fn evaluate(
        &self,
        instructions: Vec<SignalInstruction>,
        _portfolio: &PortfolioSnapshot,
    ) -> Vec<SignalInstruction> {
        instructions
            .into_iter()
            .map(|mut instruction| {
                instruction.weight = instruction.weight.clamp(-self.cap, self.cap);
                instruction
            })
            .collect()
    }
}
