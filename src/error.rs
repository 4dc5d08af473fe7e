use thiserror::Error;
use uuid::Uuid;

/// Every failure the trading core can surface.
///
/// Retry decisions are made with [`TradeError::is_transient`]; nothing else in
/// the crate inspects error variants to decide whether to try again.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("malformed response from {exchange}: {detail}")]
    MalformedResponse { exchange: String, detail: String },

    /// The venue answered, but the answer cannot be trusted to be complete
    /// (pagination cursor, truncated list). Treated like a failed fetch.
    #[error("incomplete report from {exchange}: {detail}")]
    IncompleteReport { exchange: String, detail: String },

    #[error("{exchange} rejected request ({code}): {message}")]
    ExchangeRejected {
        exchange: String,
        code: i64,
        message: String,
    },

    /// The venue already holds an order with this client order id.
    #[error("{exchange} reports a duplicate client order id: {message}")]
    DuplicateOrder { exchange: String, message: String },

    #[error("order failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TradeError>,
    },

    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("position {0} already closed")]
    PositionClosed(Uuid),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl TradeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TradeError::Transient(_))
    }

    pub fn malformed(exchange: impl ToString, detail: impl ToString) -> Self {
        TradeError::MalformedResponse {
            exchange: exchange.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl From<reqwest::Error> for TradeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return TradeError::malformed("http", e);
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return TradeError::Transient(e.to_string());
        }
        match e.status() {
            Some(s) if s.is_server_error() => TradeError::Transient(e.to_string()),
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
                TradeError::Authentication(e.to_string())
            }
            Some(_) => TradeError::Validation(e.to_string()),
            None => TradeError::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TradeError {
    fn from(e: serde_json::Error) -> Self {
        TradeError::malformed("json", e)
    }
}

impl From<sqlx::Error> for TradeError {
    fn from(e: sqlx::Error) -> Self {
        TradeError::Store(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for TradeError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        TradeError::Store(e.to_string())
    }
}
