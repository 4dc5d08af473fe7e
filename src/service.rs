use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AppConfig, RiskLimits};
use crate::exchange::ExchangeRegistry;
use crate::execution::{
    KeyedLocks, OrderEngine, PositionBook, PositionCloser, PositionMonitor, PositionReconciler,
    ReconcileReport,
};
use crate::models::{ExchangeId, ExitReason, MarketType, Order, OrderRequest, Position, PositionSide};
use crate::risk::{PortfolioTracker, RiskGate, TradeDecision, TradeProposal};
use crate::store::{OrderStore, PositionStore};
use crate::{Result, TradeError};

/// The trading core, wired once from config, a venue registry and stores.
///
/// Everything a strategy or operator needs goes through here; the scheduler
/// loops in `main` call [`TradingCore::reconcile_cycle`] and
/// [`TradingCore::refresh_portfolio`].
pub struct TradingCore {
    registry: ExchangeRegistry,
    positions: Arc<dyn PositionStore>,
    engine: Arc<OrderEngine>,
    closer: Arc<PositionCloser>,
    reconciler: Arc<PositionReconciler>,
    gate: RiskGate,
    tracker: Arc<PortfolioTracker>,
}

impl TradingCore {
    pub fn build(
        config: &AppConfig,
        registry: ExchangeRegistry,
        orders: Arc<dyn OrderStore>,
        positions: Arc<dyn PositionStore>,
    ) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        let fee_bps = config.orders.fee_bps;

        let book = Arc::new(PositionBook::new(positions.clone(), locks.clone(), fee_bps));
        let engine = Arc::new(OrderEngine::new(
            registry.clone(),
            orders,
            book,
            config.orders.clone(),
        ));
        let closer = Arc::new(PositionCloser::new(
            engine.clone(),
            positions.clone(),
            locks.clone(),
            fee_bps,
        ));
        let monitor = Arc::new(PositionMonitor::new(
            registry.clone(),
            positions.clone(),
            locks.clone(),
            closer.clone(),
            config.monitor.clone(),
        ));
        let reconciler = Arc::new(PositionReconciler::new(
            registry.clone(),
            positions.clone(),
            locks,
            monitor,
            config.scheduler.clone(),
        ));

        let tracker = Arc::new(PortfolioTracker::new());
        let gate = RiskGate::new(
            registry.clone(),
            positions.clone(),
            tracker.clone(),
            config.risk.clone(),
            config.volatility.clone(),
            Duration::from_secs(config.scheduler.risk_refresh_interval_secs),
        );

        tracing::info!(
            "Trading core ready: {} exchange(s)",
            registry.all().len()
        );

        Self {
            registry,
            positions,
            engine,
            closer,
            reconciler,
            gate,
            tracker,
        }
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<PortfolioTracker> {
        &self.tracker
    }

    pub fn risk_limits(&self) -> &RiskLimits {
        self.gate.limits()
    }

    pub async fn validate_trade(
        &self,
        proposal: &TradeProposal,
        exchange: ExchangeId,
        account_balance: f64,
    ) -> Result<TradeDecision> {
        self.gate.validate_trade(proposal, exchange, account_balance).await
    }

    pub async fn calculate_position_size(
        &self,
        symbol: &str,
        market: MarketType,
        side: PositionSide,
        exchange: ExchangeId,
        account_balance: f64,
        stop_loss: Option<f64>,
    ) -> Result<Option<f64>> {
        self.gate
            .calculate_position_size(symbol, market, side, exchange, account_balance, stop_loss)
            .await
    }

    /// Volatility-scaled stop-loss and take-profit for an entry.
    pub async fn default_exits(
        &self,
        symbol: &str,
        market: MarketType,
        side: PositionSide,
        exchange: ExchangeId,
        entry: f64,
    ) -> Result<(f64, f64)> {
        self.gate.default_exits(symbol, market, side, exchange, entry).await
    }

    pub async fn place_order(&self, request: &OrderRequest, exchange: ExchangeId) -> Result<Order> {
        self.engine.place_order(request, exchange).await
    }

    pub async fn recover_order(
        &self,
        request: &OrderRequest,
        exchange: ExchangeId,
    ) -> Result<Option<Order>> {
        self.engine.recover_order(request, exchange).await
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        self.engine.cancel_order(order_id).await
    }

    /// Closes a position with a market order on `exchange`.
    pub async fn close_position(
        &self,
        position_id: Uuid,
        reason: ExitReason,
        exchange: ExchangeId,
    ) -> Result<Position> {
        let position = self
            .positions
            .find_by_id(position_id)
            .await?
            .ok_or(TradeError::PositionNotFound(position_id))?;
        if position.exchange != exchange {
            return Err(TradeError::Validation(format!(
                "position {} lives on {}, not {}",
                position_id, position.exchange, exchange
            )));
        }
        self.closer.close(position_id, reason).await
    }

    /// One reconciliation cycle; `None` when a cycle is already running.
    pub async fn reconcile_cycle(&self) -> Result<Option<ReconcileReport>> {
        self.reconciler.run_cycle().await
    }

    /// Sums wallet equity across venues and feeds the circuit breakers.
    ///
    /// A venue that fails to answer makes the sum meaningless, so nothing is
    /// recorded for that round.
    pub async fn refresh_portfolio(&self) -> Result<Option<f64>> {
        let adapters = self.registry.all();
        let balances = join_all(adapters.iter().map(|a| a.wallet_balance())).await;

        let mut total = 0.0;
        for (adapter, balance) in adapters.iter().zip(balances) {
            match balance {
                Ok(b) => total += b,
                Err(e) => {
                    tracing::warn!(exchange = %adapter.id(), "Wallet balance unavailable, skipping refresh: {}", e);
                    return Ok(None);
                }
            }
        }

        self.tracker.observe(total, Utc::now()).await;
        tracing::debug!("Portfolio value {:.2}", total);
        Ok(Some(total))
    }
}
