#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tradecore::exchange::{ExchangeAdapter, PaperExchange};
use tradecore::store::{InMemoryStore, PositionStore};
use tradecore::{
    AppConfig, ExchangeId, ExchangeRegistry, MarketType, OrderRequest, OrderSide, Position,
    PositionSide, PositionStatus, ReportedPosition, Result, TradeError, TradingCore,
};
use uuid::Uuid;

pub struct Harness {
    pub core: Arc<TradingCore>,
    pub venue: Arc<PaperExchange>,
    pub store: Arc<InMemoryStore>,
}

/// Fast retries so failure paths do not slow the suite down.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orders.retry_delay_ms = 10;
    config.scheduler.price_timeout_ms = 500;
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: AppConfig) -> Harness {
    let venue = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
    venue.set_price("BTCUSDT", 100.0);
    harness_over(config, venue.clone(), venue)
}

/// Wires the core over `adapter`, which may wrap `venue`.
pub fn harness_over(
    config: AppConfig,
    venue: Arc<PaperExchange>,
    adapter: Arc<dyn ExchangeAdapter>,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let registry = ExchangeRegistry::new().with(adapter);
    let core = Arc::new(TradingCore::build(&config, registry, store.clone(), store.clone()));
    Harness { core, venue, store }
}

/// Position store whose per-symbol lookups can be switched to fail.
pub struct FlakyPositions {
    pub inner: Arc<InMemoryStore>,
    pub fail_symbol_lookups: AtomicBool,
}

impl FlakyPositions {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_symbol_lookups: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_symbol_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PositionStore for FlakyPositions {
    async fn save(&self, position: &Position) -> Result<()> {
        PositionStore::save(self.inner.as_ref(), position).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Position>> {
        PositionStore::find_by_id(self.inner.as_ref(), id).await
    }

    async fn find_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        self.inner.find_by_status(status).await
    }

    async fn find_by_symbol_and_status(
        &self,
        symbol: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        if self.fail_symbol_lookups.load(Ordering::SeqCst) {
            return Err(TradeError::Store(format!("lookup for {symbol} failed")));
        }
        self.inner.find_by_symbol_and_status(symbol, status).await
    }
}

/// Paper harness whose core reads and writes positions through [`FlakyPositions`].
pub fn flaky_harness() -> (Harness, Arc<FlakyPositions>) {
    let venue = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
    venue.set_price("BTCUSDT", 100.0);
    let store = Arc::new(InMemoryStore::new());
    let positions = Arc::new(FlakyPositions::new(store.clone()));
    let registry = ExchangeRegistry::new().with(venue.clone());
    let core = Arc::new(TradingCore::build(
        &test_config(),
        registry,
        store.clone(),
        positions.clone(),
    ));
    (Harness { core, venue, store }, positions)
}

pub fn market(side: OrderSide, qty: f64) -> OrderRequest {
    OrderRequest::market("BTCUSDT", MarketType::Linear, side, qty)
}

pub fn reported(symbol: &str, side: PositionSide, qty: f64, entry: f64) -> ReportedPosition {
    ReportedPosition {
        symbol: symbol.to_string(),
        market_type: MarketType::Linear,
        side,
        quantity: qty,
        entry_price: entry,
        mark_price: None,
        unrealized_pnl: 0.0,
        leverage: 1.0,
    }
}
