use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::position_book::PositionBook;
use crate::config::OrderSettings;
use crate::exchange::{ExchangeAdapter, ExchangeRegistry};
use crate::models::{ExchangeId, Order, OrderReport, OrderRequest, OrderStatus, OrderType};
use crate::store::OrderStore;
use crate::{Result, TradeError};

/// Submits orders, retries transient failures and turns venue answers into
/// persisted canonical [`Order`]s.
pub struct OrderEngine {
    registry: ExchangeRegistry,
    orders: Arc<dyn OrderStore>,
    book: Arc<PositionBook>,
    settings: OrderSettings,
}

impl OrderEngine {
    pub fn new(
        registry: ExchangeRegistry,
        orders: Arc<dyn OrderStore>,
        book: Arc<PositionBook>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            registry,
            orders,
            book,
            settings,
        }
    }

    pub fn new_client_order_id() -> String {
        format!("tc-{}", Uuid::new_v4().simple())
    }

    fn validate(request: &OrderRequest) -> Result<()> {
        if request.quantity <= 0.0 || !request.quantity.is_finite() {
            return Err(TradeError::Validation(format!(
                "order quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit && request.price.map_or(true, |p| p <= 0.0) {
            return Err(TradeError::Validation(
                "limit orders need a positive price".to_string(),
            ));
        }
        Ok(())
    }

    /// Submit, persist, then update the position book from the fill.
    pub async fn place_order(&self, request: &OrderRequest, exchange: ExchangeId) -> Result<Order> {
        let order = self.submit(request, exchange).await?;
        let outcome = self.book.apply_fill(&order, request).await?;
        if let Some(p) = outcome.position() {
            tracing::debug!(order = %order.id, position = %p.id, "fill applied");
        }
        Ok(order)
    }

    /// Submit and persist without touching positions.
    ///
    /// Transient failures (empty body, timeout, 5xx) are retried up to
    /// `max_attempts` with a fixed delay. Anything else, including a body that
    /// cannot be parsed, fails on the spot. The client order id is fixed before
    /// the first attempt; a venue that rejects a retry as a duplicate id is
    /// asked for the order it already holds.
    pub async fn submit(&self, request: &OrderRequest, exchange: ExchangeId) -> Result<Order> {
        Self::validate(request)?;
        let adapter = self.registry.get(exchange)?;
        let client_order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(Self::new_client_order_id);

        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_err = None;
        let mut report = None;

        for attempt in 1..=max_attempts {
            match Self::submit_once(adapter.as_ref(), request, &client_order_id).await {
                Ok(r) => {
                    report = Some(r);
                    break;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        exchange = %exchange,
                        symbol = %request.symbol,
                        client_order_id = %client_order_id,
                        "Order attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.retry_delay()).await;
                    }
                }
                Err(e @ TradeError::DuplicateOrder { .. }) => {
                    // An earlier attempt reached the venue even though we never saw its answer
                    tracing::warn!(
                        exchange = %exchange,
                        symbol = %request.symbol,
                        client_order_id = %client_order_id,
                        "Order already on venue, fetching its state: {}",
                        e
                    );
                    match adapter
                        .query_order(&request.symbol, request.market_type, &client_order_id)
                        .await?
                    {
                        Some(existing) => {
                            report = Some(existing);
                            break;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        exchange = %exchange,
                        symbol = %request.symbol,
                        client_order_id = %client_order_id,
                        "Order failed without retry: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }

        let Some(report) = report else {
            let source = last_err
                .unwrap_or_else(|| TradeError::Transient("no attempt made".to_string()));
            return Err(TradeError::RetriesExhausted {
                attempts: max_attempts,
                source: Box::new(source),
            });
        };

        let report = self
            .refresh_if_pending(adapter.as_ref(), request, &client_order_id, report)
            .await;
        let order = self
            .normalize(adapter.as_ref(), request, exchange, &client_order_id, report, None)
            .await;

        self.orders.save(&order).await?;
        tracing::info!(
            exchange = %exchange,
            order = %order.id,
            client_order_id = %order.client_order_id,
            "{} {} {} {} -> {} (filled {} @ {})",
            order.order_type.as_str(),
            order.side.as_str(),
            order.quantity,
            order.symbol,
            order.status.as_str(),
            order.executed_qty,
            order
                .avg_fill_price
                .map(|p| format!("{p:.6}"))
                .unwrap_or_else(|| "?".to_string())
        );
        Ok(order)
    }

    async fn submit_once(
        adapter: &dyn ExchangeAdapter,
        request: &OrderRequest,
        client_order_id: &str,
    ) -> Result<OrderReport> {
        let raw = adapter.submit_order(request, client_order_id).await?;
        if raw.trim().is_empty() {
            return Err(TradeError::Transient("empty response body".to_string()));
        }
        adapter.parse_order_response(&raw)
    }

    /// MARKET orders usually fill before the ack; when the ack is not final,
    /// ask once more.
    async fn refresh_if_pending(
        &self,
        adapter: &dyn ExchangeAdapter,
        request: &OrderRequest,
        client_order_id: &str,
        report: OrderReport,
    ) -> OrderReport {
        if request.order_type != OrderType::Market || report.status.is_final() {
            return report;
        }
        match adapter
            .query_order(&request.symbol, request.market_type, client_order_id)
            .await
        {
            Ok(Some(fresh)) => fresh,
            Ok(None) => report,
            Err(e) => {
                tracing::warn!(client_order_id, "Order status refresh failed: {}", e);
                report
            }
        }
    }

    async fn normalize(
        &self,
        adapter: &dyn ExchangeAdapter,
        request: &OrderRequest,
        exchange: ExchangeId,
        client_order_id: &str,
        report: OrderReport,
        existing: Option<&Order>,
    ) -> Order {
        let now = Utc::now();
        let mut avg_fill_price = report.avg_price;
        let mut price_incomplete = false;

        if avg_fill_price.is_none() && report.executed_qty > 0.0 {
            avg_fill_price = match (report.cum_quote, request.order_type, request.price) {
                (Some(quote), _, _) if quote > 0.0 => Some(quote / report.executed_qty),
                (_, OrderType::Limit, Some(limit)) => Some(limit),
                _ => match adapter.ticker_price(&request.symbol, request.market_type).await {
                    Ok(p) => {
                        tracing::warn!(client_order_id, "Fill price missing, using ticker {:.6}", p);
                        Some(p)
                    }
                    Err(e) => {
                        tracing::warn!(client_order_id, "Fill price unavailable, order flagged: {}", e);
                        price_incomplete = true;
                        None
                    }
                },
            };
        }

        Order {
            id: existing.map_or_else(Uuid::new_v4, |o| o.id),
            exchange_order_id: report.exchange_order_id,
            client_order_id: client_order_id.to_string(),
            symbol: request.symbol.clone(),
            exchange,
            market_type: request.market_type,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            executed_qty: report.executed_qty,
            avg_fill_price,
            status: report.status,
            strategy_tag: request.strategy_tag.clone(),
            price_incomplete,
            created_at: existing.map_or(now, |o| o.created_at),
            updated_at: now,
        }
    }

    /// Re-drives a placement whose outcome is unknown (e.g. after
    /// `RetriesExhausted`) through the venue's order-status query.
    ///
    /// `Ok(None)` means the venue never saw the client order id, so placing
    /// again with the same id is safe. A newly discovered fill is applied to
    /// the position book.
    pub async fn recover_order(
        &self,
        request: &OrderRequest,
        exchange: ExchangeId,
    ) -> Result<Option<Order>> {
        let Some((previously_executed, order)) = self.refresh_record(request, exchange).await?
        else {
            return Ok(None);
        };

        if order.executed_qty > previously_executed {
            let mut delta = order.clone();
            delta.executed_qty = order.executed_qty - previously_executed;
            self.book.apply_fill(&delta, request).await?;
        }
        Ok(Some(order))
    }

    /// Current state of the order placed under `request.client_order_id`,
    /// recorded but not applied to positions.
    pub async fn lookup_order(
        &self,
        request: &OrderRequest,
        exchange: ExchangeId,
    ) -> Result<Option<Order>> {
        Ok(self
            .refresh_record(request, exchange)
            .await?
            .map(|(_, order)| order))
    }

    /// Returns the quantity already recorded locally alongside the refreshed order.
    async fn refresh_record(
        &self,
        request: &OrderRequest,
        exchange: ExchangeId,
    ) -> Result<Option<(f64, Order)>> {
        let client_order_id = request.client_order_id.as_deref().ok_or_else(|| {
            TradeError::Validation("recovery needs the original client order id".to_string())
        })?;
        let existing = self.orders.find_by_client_id(client_order_id).await?;
        if let Some(order) = existing.as_ref().filter(|o| o.status.is_final()) {
            return Ok(Some((order.executed_qty, order.clone())));
        }

        let adapter = self.registry.get(exchange)?;
        let Some(report) = adapter
            .query_order(&request.symbol, request.market_type, client_order_id)
            .await?
        else {
            tracing::info!(client_order_id, "Venue has no record of order; safe to resubmit");
            return Ok(None);
        };

        let order = self
            .normalize(
                adapter.as_ref(),
                request,
                exchange,
                client_order_id,
                report,
                existing.as_ref(),
            )
            .await;
        self.orders.save(&order).await?;

        tracing::info!(
            client_order_id,
            "Recovered order: {} (filled {})",
            order.status.as_str(),
            order.executed_qty
        );
        let previously_executed = existing.as_ref().map_or(0.0, |o| o.executed_qty);
        Ok(Some((previously_executed, order)))
    }

    /// Cancels a resting order and records the cancellation.
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        let mut order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| TradeError::Validation(format!("unknown order {order_id}")))?;
        if order.status.is_final() {
            return Err(TradeError::Validation(format!(
                "order {} is already {}",
                order.client_order_id,
                order.status.as_str()
            )));
        }

        let adapter = self.registry.get(order.exchange)?;
        adapter
            .cancel_order(&order.symbol, order.market_type, &order.client_order_id)
            .await?;

        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now();
        self.orders.save(&order).await?;
        tracing::info!(order = %order.id, client_order_id = %order.client_order_id, "Order canceled");
        Ok(order)
    }

    pub async fn orders_for_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        self.orders.find_by_symbol(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, PaperFault};
    use crate::execution::KeyedLocks;
    use crate::models::{MarketType, OrderSide};
    use crate::store::InMemoryStore;

    fn engine(venue: Arc<PaperExchange>, delay_ms: u64) -> (OrderEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let book = Arc::new(PositionBook::new(store.clone(), Arc::new(KeyedLocks::new()), 0.0));
        let registry = ExchangeRegistry::new().with(venue);
        let settings = OrderSettings {
            max_attempts: 3,
            retry_delay_ms: delay_ms,
            fee_bps: 0.0,
        };
        (OrderEngine::new(registry, store.clone(), book, settings), store)
    }

    fn venue() -> Arc<PaperExchange> {
        let venue = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
        venue.set_price("BTCUSDT", 100.0);
        venue
    }

    fn buy(qty: f64) -> OrderRequest {
        OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, qty)
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let venue = venue();
        venue.push_fault(PaperFault::EmptyBody);
        venue.push_fault(PaperFault::Timeout);
        let (engine, _) = engine(venue.clone(), 1);

        let order = engine.submit(&buy(1.0), ExchangeId::Paper).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(venue.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let venue = venue();
        venue.push_fault(PaperFault::Auth);
        let (engine, _) = engine(venue.clone(), 1);

        let err = engine.submit(&buy(1.0), ExchangeId::Paper).await.unwrap_err();
        assert!(matches!(err, TradeError::Authentication(_)));
        assert_eq!(venue.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_avg_price_from_cumulative_quote() {
        let venue = venue();
        venue.push_fault(PaperFault::OmitAvgPrice);
        let (engine, _) = engine(venue, 1);

        let order = engine.submit(&buy(2.0), ExchangeId::Paper).await.unwrap();
        assert_eq!(order.avg_fill_price, Some(100.0));
        assert!(!order.price_incomplete);
    }

    #[tokio::test]
    async fn test_price_incomplete_when_nothing_left_to_ask() {
        let venue = venue();
        venue.push_fault(PaperFault::OmitAvgAndQuote);
        venue.set_price_failure("BTCUSDT", true);
        let (engine, store) = engine(venue, 1);

        let order = engine.submit(&buy(1.0), ExchangeId::Paper).await.unwrap();
        assert!(order.price_incomplete);
        assert_eq!(order.avg_fill_price, None);
        assert!(OrderStore::find_by_id(store.as_ref(), order.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rejects_non_positive_quantity() {
        let (engine, _) = engine(venue(), 1);
        let err = engine.submit(&buy(0.0), ExchangeId::Paper).await.unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_recover_finds_order_the_venue_filled() {
        let venue = venue();
        let (engine, store) = engine(venue.clone(), 1);

        // Venue filled it, but we never recorded the answer
        let mut request = buy(1.0);
        request.client_order_id = Some("tc-lost".to_string());
        venue.submit_order(&request, "tc-lost").await.unwrap();

        let order = engine
            .recover_order(&request, ExchangeId::Paper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(store.position_count().await, 1);

        request.client_order_id = Some("tc-never-sent".to_string());
        assert!(engine
            .recover_order(&request, ExchangeId::Paper)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_resting_limit() {
        let (engine, _) = engine(venue(), 1);
        let limit = OrderRequest::limit("BTCUSDT", MarketType::Linear, OrderSide::Buy, 1.0, 90.0);
        let order = engine.place_order(&limit, ExchangeId::Paper).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);

        let canceled = engine.cancel_order(order.id).await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert!(engine.cancel_order(order.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_exchange() {
        let (engine, _) = engine(venue(), 1);
        let err = engine.submit(&buy(1.0), ExchangeId::Bybit).await.unwrap_err();
        assert!(matches!(err, TradeError::UnknownExchange(_)));
    }
}
