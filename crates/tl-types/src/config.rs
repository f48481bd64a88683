use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::errors::{TlError, TlResult};
use crate::symbol::{
    Currency, SecurityType, Symbol, SymbolKind, SymbolMap, TradingSession,
};

/// Execution mode, selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backtest,
    Live,
}

impl FromStr for Mode {
    type Err = TlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "live" => Ok(Mode::Live),
            other => Err(TlError::Config(format!(
                "unknown mode '{other}', expected 'backtest' or 'live'"
            ))),
        }
    }
}

/// Primary record flavour streamed by the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bar,
    Quote,
}

/// Runtime parameters distilled from `[general]`.
///
/// `start`/`end`/`schema` may be overwritten by the metadata trailer of a
/// recorded stream, which is authoritative for file-backed replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub strategy_name: String,
    pub capital: Decimal,
    pub data_type: DataType,
    pub start: String,
    pub end: String,
    pub schema: String,
    pub risk_free_rate: Decimal,
    pub output_path: String,
    pub tickers: Vec<String>,
}

/// `[general]` section of the run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub strategy_name: String,
    pub capital: Decimal,
    pub data_type: DataType,
    pub start: String,
    pub end: String,
    pub schema: String,
    pub risk_free_rate: Decimal,
    pub output_path: String,
}

/// One `[[symbols]]` entry. Instrument ids are assigned at registration
/// order, so the config never carries them.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    pub broker_ticker: String,
    pub data_ticker: String,
    pub midas_ticker: String,
    pub security_type: SecurityType,
    pub currency: Currency,
    pub venue: String,
    pub fees: Decimal,
    pub quantity_multiplier: Decimal,
    pub price_multiplier: Decimal,
    #[serde(default)]
    pub initial_margin: Decimal,
    pub slippage_factor: Decimal,
    pub tick_size: Decimal,
    pub trading_sessions: TradingSession,
    #[serde(flatten)]
    pub kind: SymbolKind,
}

impl SymbolConfig {
    fn into_symbol(self, instrument_id: u32) -> Symbol {
        Symbol {
            instrument_id,
            broker_ticker: self.broker_ticker,
            data_ticker: self.data_ticker,
            midas_ticker: self.midas_ticker,
            security_type: self.security_type,
            currency: self.currency,
            venue: self.venue,
            fees: self.fees,
            quantity_multiplier: self.quantity_multiplier,
            price_multiplier: self.price_multiplier,
            initial_margin: self.initial_margin,
            slippage_factor: self.slippage_factor,
            tick_size: self.tick_size,
            trading_sessions: self.trading_sessions,
            kind: self.kind,
        }
    }
}

/// `[strategy]` / `[risk]` sections: registry name plus free-form params.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub params: toml::Table,
}

/// `[data_source]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataSourceConfig {
    /// Recorded binary stream on disk.
    File { path: String },
    /// Midas historical endpoint (`MIDAS_URL` / `MIDAS_API_KEY`).
    Http,
}

/// `[broker]` section, live mode only.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub account: String,
    pub host: String,
    pub port: u16,
    pub client_id: u32,
}

/// Fully parsed run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub general: GeneralConfig,
    pub symbols: Vec<SymbolConfig>,
    pub strategy: PluginConfig,
    pub risk: Option<PluginConfig>,
    pub data_source: DataSourceConfig,
    pub broker: Option<BrokerConfig>,
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> TlResult<Self> {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| TlError::Config(format!("cannot read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> TlResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| TlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> TlResult<()> {
        if self.symbols.is_empty() {
            return Err(TlError::Config("no symbols configured".into()));
        }
        if self.general.capital <= Decimal::ZERO {
            return Err(TlError::Config("capital must be positive".into()));
        }
        Ok(())
    }

    /// Assign instrument ids in declaration order and build the shared map.
    pub fn build_symbol_map(&self) -> SymbolMap {
        let mut map = SymbolMap::new();
        for (i, symbol) in self.symbols.iter().cloned().enumerate() {
            map.add_symbol(symbol.into_symbol(i as u32 + 1));
        }
        map
    }

    pub fn parameters(&self) -> Parameters {
        Parameters {
            strategy_name: self.general.strategy_name.clone(),
            capital: self.general.capital,
            data_type: self.general.data_type,
            start: self.general.start.clone(),
            end: self.general.end.clone(),
            schema: self.general.schema.clone(),
            risk_free_rate: self.general.risk_free_rate,
            output_path: self.general.output_path.clone(),
            tickers: self.symbols.iter().map(|s| s.midas_ticker.clone()).collect(),
        }
    }
}
