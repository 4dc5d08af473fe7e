mod common;

use async_trait::async_trait;
use common::{flaky_harness, harness, harness_over, market, reported, test_config};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::assert_ok;
use tradecore::exchange::{ExchangeAdapter, PaperExchange, Params};
use tradecore::store::PositionStore;
use tradecore::{
    ExchangeId, ExitReason, InstrumentInfo, MarketType, OrderReport, OrderRequest, OrderSide,
    PositionSide, PositionStatus, ReportedPosition, Result,
};

fn gated(paper: &Arc<PaperExchange>) -> Arc<GatedVenue> {
    Arc::new(GatedVenue {
        inner: paper.clone(),
        started: Notify::new(),
        release: Notify::new(),
    })
}

/// Paper venue whose position list is snapshotted, then held until released.
struct GatedVenue {
    inner: Arc<PaperExchange>,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl ExchangeAdapter for GatedVenue {
    fn id(&self) -> ExchangeId {
        self.inner.id()
    }
    fn reconciled_markets(&self) -> Vec<MarketType> {
        self.inner.reconciled_markets()
    }
    fn sign(&self, timestamp: i64, payload: &str) -> String {
        self.inner.sign(timestamp, payload)
    }
    fn format_symbol(&self, symbol: &str, market: MarketType) -> String {
        self.inner.format_symbol(symbol, market)
    }
    async fn server_time(&self) -> Result<i64> {
        self.inner.server_time().await
    }
    async fn request(&self, method: Method, path: &str, params: &Params, signed: bool) -> Result<String> {
        self.inner.request(method, path, params, signed).await
    }
    async fn submit_order(&self, request: &OrderRequest, client_order_id: &str) -> Result<String> {
        self.inner.submit_order(request, client_order_id).await
    }
    fn parse_order_response(&self, raw: &str) -> Result<OrderReport> {
        self.inner.parse_order_response(raw)
    }
    async fn query_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        self.inner.query_order(symbol, market, client_order_id).await
    }
    async fn cancel_order(&self, symbol: &str, market: MarketType, client_order_id: &str) -> Result<()> {
        self.inner.cancel_order(symbol, market, client_order_id).await
    }
    async fn fetch_positions(&self, market: MarketType) -> Result<Vec<ReportedPosition>> {
        let snapshot = self.inner.fetch_positions(market).await;
        self.started.notify_one();
        self.release.notified().await;
        snapshot
    }
    async fn ticker_price(&self, symbol: &str, market: MarketType) -> Result<f64> {
        self.inner.ticker_price(symbol, market).await
    }
    async fn daily_closes(&self, symbol: &str, market: MarketType, limit: usize) -> Result<Vec<f64>> {
        self.inner.daily_closes(symbol, market, limit).await
    }
    async fn instrument(&self, symbol: &str, market: MarketType) -> Result<InstrumentInfo> {
        self.inner.instrument(symbol, market).await
    }
    async fn wallet_balance(&self) -> Result<f64> {
        self.inner.wallet_balance().await
    }
}

#[tokio::test]
async fn test_adopts_reported_positions_and_second_cycle_is_idempotent() {
    let h = harness();
    h.venue.set_price("ETHUSDT", 2_000.0);
    h.venue.set_reported_position(reported("BTCUSDT", PositionSide::Long, 1.5, 95.0));
    h.venue.set_reported_position(reported("ETHUSDT", PositionSide::Short, 2.0, 2_100.0));

    let first = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(first.opened, 2);
    assert_eq!(first.closed, 0);
    assert_eq!(first.ok, vec![(ExchangeId::Paper, MarketType::Linear)]);

    let open = h.store.find_by_status(PositionStatus::Open).await.unwrap();
    assert_eq!(open.len(), 2);
    let btc = open.iter().find(|p| p.symbol == "BTCUSDT").unwrap();
    assert_eq!(btc.quantity, 1.5);
    assert_eq!(btc.entry_price, 95.0);
    assert!((btc.unrealized_pnl - 7.5).abs() < 1e-9);

    let second = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(second.transitions(), 0);
    assert_eq!(second.updated, 2);
    assert_eq!(h.store.position_count().await, 2);
}

#[tokio::test]
async fn test_missing_position_closes_with_last_unrealized_pnl() {
    let h = harness();
    let order = h.core.place_order(&market(OrderSide::Buy, 2.0), ExchangeId::Paper).await.unwrap();
    assert_eq!(order.avg_fill_price, Some(100.0));

    h.venue.set_price("BTCUSDT", 105.0);
    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.updated, 1);

    // Closed out on the venue behind our back
    h.venue.remove_reported_position("BTCUSDT", PositionSide::Long);
    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.closed, 1);

    let closed = h.store.find_by_status(PositionStatus::Closed).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, Some(ExitReason::NotFoundOnExchange));
    assert_eq!(closed[0].realized_pnl, Some(10.0));
    assert!(closed[0].close_time.is_some());
}

#[tokio::test]
async fn test_failed_fetch_never_closes_positions() {
    let h = harness();
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();
    h.venue.remove_reported_position("BTCUSDT", PositionSide::Long);
    h.venue.set_fail_positions(true);

    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.closed, 0);
    assert_eq!(h.store.find_by_status(PositionStatus::Open).await.unwrap().len(), 1);

    h.venue.set_fail_positions(false);
    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.closed, 1);
}

#[tokio::test]
async fn test_reported_positions_never_duplicate_open_keys() {
    let h = harness();
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();

    for _ in 0..3 {
        assert_ok!(h.core.reconcile_cycle().await);
    }

    let open = h.store.find_by_status(PositionStatus::Open).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].quantity, 2.0);
    assert!(open.iter().all(|p| p.quantity > 0.0));
}

#[tokio::test]
async fn test_slow_price_skips_only_that_position() {
    let h = harness();
    h.venue.set_price("ETHUSDT", 2_000.0);
    h.venue.set_reported_position(reported("BTCUSDT", PositionSide::Long, 1.0, 100.0));
    h.venue.set_reported_position(reported("ETHUSDT", PositionSide::Long, 1.0, 2_000.0));
    h.venue.set_price_failure("ETHUSDT", true);

    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.opened, 2);
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.price_skips, 1);
}

#[tokio::test]
async fn test_fill_during_cycle_survives_and_cycles_do_not_overlap() {
    let paper = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
    paper.set_price("BTCUSDT", 100.0);
    let gated = gated(&paper);
    let h = harness_over(test_config(), paper, gated.clone());

    let cycle = {
        let core = h.core.clone();
        tokio::spawn(async move { core.reconcile_cycle().await })
    };
    gated.started.notified().await;

    // Single-flight: a second cycle is refused while the first is running
    assert!(h.core.reconcile_cycle().await.unwrap().is_none());

    // Fill lands after the venue snapshot was taken
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();
    gated.release.notify_one();

    let report = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.closed, 0);
    assert_eq!(h.store.find_by_status(PositionStatus::Open).await.unwrap().len(), 1);

    // The next cycle sees the venue position and merges it
    let next = {
        let core = h.core.clone();
        tokio::spawn(async move { core.reconcile_cycle().await })
    };
    gated.started.notified().await;
    gated.release.notify_one();
    let report = next.await.unwrap().unwrap().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.transitions(), 0);
}

#[tokio::test]
async fn test_close_during_cycle_is_not_adopted_back() {
    let paper = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
    paper.set_price("BTCUSDT", 100.0);
    let gated = gated(&paper);
    let h = harness_over(test_config(), paper, gated.clone());
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();
    let position = h.store.find_by_status(PositionStatus::Open).await.unwrap().remove(0);

    let cycle = {
        let core = h.core.clone();
        tokio::spawn(async move { core.reconcile_cycle().await })
    };
    gated.started.notified().await;

    // The snapshot still lists the long; it is closed before the cycle merges
    h.core
        .close_position(position.id, ExitReason::Manual, ExchangeId::Paper)
        .await
        .unwrap();
    gated.release.notify_one();

    let report = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.opened, 0);
    assert!(h.store.find_by_status(PositionStatus::Open).await.unwrap().is_empty());

    let next = {
        let core = h.core.clone();
        tokio::spawn(async move { core.reconcile_cycle().await })
    };
    gated.started.notified().await;
    gated.release.notify_one();
    let report = next.await.unwrap().unwrap().unwrap();
    assert_eq!(report.transitions(), 0);

    let closed = h.store.find_by_status(PositionStatus::Closed).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, Some(ExitReason::Manual));
}

#[tokio::test]
async fn test_reduction_during_cycle_keeps_local_quantity() {
    let paper = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
    paper.set_price("BTCUSDT", 100.0);
    let gated = gated(&paper);
    let h = harness_over(test_config(), paper, gated.clone());
    h.core.place_order(&market(OrderSide::Buy, 2.0), ExchangeId::Paper).await.unwrap();

    let cycle = {
        let core = h.core.clone();
        tokio::spawn(async move { core.reconcile_cycle().await })
    };
    gated.started.notified().await;

    // Snapshot says 2.0; the book goes to 0.5 before the merge
    h.core.place_order(&market(OrderSide::Sell, 1.5), ExchangeId::Paper).await.unwrap();
    gated.release.notify_one();

    let report = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.updated, 1);

    let open = h.store.find_by_status(PositionStatus::Open).await.unwrap();
    assert_eq!(open.len(), 1);
    assert!((open[0].quantity - 0.5).abs() < 1e-9);
    assert_eq!(open[0].entry_price, 100.0);
}

#[tokio::test]
async fn test_failed_merge_does_not_close_a_reported_position() {
    let (h, positions) = flaky_harness();
    h.core.place_order(&market(OrderSide::Buy, 1.0), ExchangeId::Paper).await.unwrap();

    positions.set_failing(true);
    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.closed, 0);

    let open = h.store.find_by_status(PositionStatus::Open).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].quantity, 1.0);

    positions.set_failing(false);
    let report = h.core.reconcile_cycle().await.unwrap().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.closed, 0);
}
