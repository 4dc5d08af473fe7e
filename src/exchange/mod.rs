// Venue adapters: signing, symbol conventions, request/response translation
pub mod bybit;
pub mod clock;
pub mod http;
pub mod mexc;
pub mod paper;
pub mod signer;

pub use bybit::BybitAdapter;
pub use clock::ServerClock;
pub use http::{BackoffPolicy, RestClient};
pub use mexc::MexcAdapter;
pub use paper::{PaperExchange, PaperFault};
pub use signer::HmacSigner;

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExchangeSettings;
use crate::models::{
    ExchangeId, InstrumentInfo, MarketType, OrderReport, OrderRequest, ReportedPosition,
};
use crate::{Result, TradeError};

/// Request parameters in send order. Values keep their JSON type so POST
/// bodies can carry booleans and numbers.
pub type Params = Vec<(String, serde_json::Value)>;

/// One implementation per venue. Everything venue-specific stays behind this.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Markets whose position listing is complete enough to infer closures from.
    fn reconciled_markets(&self) -> Vec<MarketType>;

    fn sign(&self, timestamp: i64, payload: &str) -> String;

    fn format_symbol(&self, symbol: &str, market: MarketType) -> String;

    /// Venue time in ms, served from a TTL cache when fresh.
    async fn server_time(&self) -> Result<i64>;

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &Params,
        signed: bool,
    ) -> Result<String>;

    /// Submits and returns the raw body. An empty body is a transient failure
    /// for the caller to judge; this method does not retry.
    async fn submit_order(&self, request: &OrderRequest, client_order_id: &str) -> Result<String>;

    fn parse_order_response(&self, raw: &str) -> Result<OrderReport>;

    async fn query_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>>;

    async fn cancel_order(&self, symbol: &str, market: MarketType, client_order_id: &str)
        -> Result<()>;

    async fn fetch_positions(&self, market: MarketType) -> Result<Vec<ReportedPosition>>;

    async fn ticker_price(&self, symbol: &str, market: MarketType) -> Result<f64>;

    /// Daily closes, oldest first.
    async fn daily_closes(&self, symbol: &str, market: MarketType, limit: usize)
        -> Result<Vec<f64>>;

    async fn instrument(&self, symbol: &str, market: MarketType) -> Result<InstrumentInfo>;

    /// Account equity in the settlement currency.
    async fn wallet_balance(&self) -> Result<f64>;
}

/// Adapters keyed by venue, composed once at startup.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    adapters: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        tracing::info!(exchange = %adapter.id(), "registered exchange adapter");
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, id: ExchangeId) -> Result<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| TradeError::UnknownExchange(id.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<dyn ExchangeAdapter>> {
        let mut adapters: Vec<_> = self.adapters.values().cloned().collect();
        adapters.sort_by_key(|a| a.id().as_str());
        adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn from_settings(settings: &ExchangeSettings) -> Result<Self> {
        let mut registry = Self::new();
        let timeout = Duration::from_millis(settings.http_timeout_ms);
        let ttl = Duration::from_secs(settings.server_time_ttl_secs);

        if let Some(creds) = &settings.bybit {
            registry.register(Arc::new(BybitAdapter::new(creds, timeout, ttl)?));
        }
        if let Some(creds) = &settings.mexc {
            registry.register(Arc::new(MexcAdapter::new(creds, timeout, ttl)?));
        }
        if settings.paper {
            registry.register(Arc::new(PaperExchange::new(
                ExchangeId::Paper,
                settings.paper_balance,
            )));
        }

        if registry.is_empty() {
            return Err(TradeError::Validation(
                "no exchanges configured (set exchanges.bybit, exchanges.mexc or exchanges.paper)"
                    .to_string(),
            ));
        }
        Ok(registry)
    }
}

/// Venue numbers arrive as strings; empty means absent.
pub(crate) fn parse_num(venue: ExchangeId, field: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| TradeError::malformed(venue, format!("{field} is not a number: {raw:?}")))
}

pub(crate) fn parse_opt(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| *v > 0.0)
}

pub(crate) fn value_to_param(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ExchangeRegistry::new()
            .with(Arc::new(PaperExchange::new(ExchangeId::Paper, 1000.0)));

        assert!(registry.get(ExchangeId::Paper).is_ok());
        assert!(matches!(
            registry.get(ExchangeId::Bybit),
            Err(TradeError::UnknownExchange(_))
        ));
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_from_settings_requires_a_venue() {
        let settings = ExchangeSettings::default();
        assert!(ExchangeRegistry::from_settings(&settings).is_err());

        let settings = ExchangeSettings {
            paper: true,
            ..Default::default()
        };
        let registry = ExchangeRegistry::from_settings(&settings).unwrap();
        assert!(registry.get(ExchangeId::Paper).is_ok());
    }

    #[test]
    fn test_number_parsing() {
        assert_eq!(parse_num(ExchangeId::Bybit, "qty", "0.5").unwrap(), 0.5);
        assert!(parse_num(ExchangeId::Bybit, "qty", "abc").is_err());
        assert_eq!(parse_opt(""), None);
        assert_eq!(parse_opt("0"), None);
        assert_eq!(parse_opt("101.5"), Some(101.5));
    }
}
