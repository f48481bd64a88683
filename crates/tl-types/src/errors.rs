use thiserror::Error;

/// Main error type for the Tapeline system
#[derive(Error, Debug)]
pub enum TlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data source error: {0}")]
    DataSource(#[from] DataSourceError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cooperative shutdown. Never reported as a failure; every blocking
    /// primitive returns this when the process-wide shutdown latch is set.
    #[error("shutdown requested")]
    Shutdown,
}

impl TlError {
    /// Whether this error should tear the whole run down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TlError::DataSource(_) | TlError::Schema(_) | TlError::State(_)
        )
    }
}

/// Errors raised while loading or streaming market data
#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("data file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed reading record stream: {message}")]
    ReadFailed { message: String },

    #[error("historical endpoint request failed: {message}")]
    RequestFailed { message: String },

    #[error("missing environment variable: {name}")]
    MissingEnv { name: String },

    #[error("record stream exhausted before metadata trailer")]
    TruncatedStream,
}

/// Errors raised decoding the record wire format or mapping tickers
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("unknown record type: {record_type}")]
    UnknownRecordType { record_type: u8 },

    #[error("unknown instrument id in stream: {instrument_id}")]
    UnknownInstrument { instrument_id: u32 },

    #[error("no symbol registered for ticker: {ticker}")]
    UnmappedTicker { ticker: String },

    #[error("malformed record body: {message}")]
    MalformedBody { message: String },

    #[error("unsupported schema: {schema}")]
    UnsupportedSchema { schema: String },
}

/// Errors raised by a broker (simulated or live)
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("order timed out: order_id {order_id}")]
    OrderTimeout { order_id: u32 },

    #[error("broker disconnected: {message}")]
    Disconnected { message: String },

    #[error("no market data for instrument {instrument_id}")]
    NoMarketData { instrument_id: u32 },
}

/// A broken internal invariant. Always fatal.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("negative cash after margined fill: {cash}")]
    NegativeCash { cash: String },

    #[error("order ledger inconsistency: {message}")]
    OrderLedger { message: String },

    #[error("position inconsistency for instrument {instrument_id}: {message}")]
    Position { instrument_id: u32, message: String },
}

/// Strategy / risk-model resolution failures
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("no strategy registered under name: {name}")]
    StrategyNotFound { name: String },

    #[error("no risk model registered under name: {name}")]
    RiskModelNotFound { name: String },

    #[error("plugin construction failed: {message}")]
    ConstructionFailed { message: String },
}

/// Result type alias for Tapeline operations
pub type TlResult<T> = Result<T, TlError>;
