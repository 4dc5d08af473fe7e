use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::locks::KeyedLocks;
use super::order_engine::OrderEngine;
use super::stats::close_stats;
use crate::models::{ExitReason, Order, OrderRequest, OrderStatus, Position, PositionStatus};
use crate::store::PositionStore;
use crate::{Result, TradeError};

/// Marks `position` CLOSED and persists it. The only place `realized_pnl` is set.
///
/// Callers hold the position's key lock.
pub async fn settle_close(
    store: &dyn PositionStore,
    position: &mut Position,
    exit_price: f64,
    realized: f64,
    reason: ExitReason,
    fee_bps: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    if !position.is_open() {
        return Err(TradeError::PositionClosed(position.id));
    }

    let history = match store
        .find_by_symbol_and_status(&position.symbol, PositionStatus::Closed)
        .await
    {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(symbol = %position.symbol, "closed history unavailable for stats: {}", e);
            Vec::new()
        }
    };

    position.stats = Some(close_stats(position, exit_price, realized, &history, fee_bps));
    position.status = PositionStatus::Closed;
    position.realized_pnl = Some(realized);
    position.exit_price = Some(exit_price);
    position.exit_reason = Some(reason);
    position.close_time = Some(now);
    position.current_price = exit_price;
    position.unrealized_pnl = 0.0;

    store.save(position).await?;

    tracing::info!(
        position = %position.id,
        key = %position.key(),
        reason = %reason,
        "Closed position @ {:.6}, realized {:+.4}",
        exit_price,
        realized
    );
    Ok(())
}

/// Exits positions by sending an opposite-side reduce-only MARKET order.
pub struct PositionCloser {
    engine: Arc<OrderEngine>,
    positions: Arc<dyn PositionStore>,
    locks: Arc<KeyedLocks>,
    fee_bps: f64,
}

impl PositionCloser {
    pub fn new(
        engine: Arc<OrderEngine>,
        positions: Arc<dyn PositionStore>,
        locks: Arc<KeyedLocks>,
        fee_bps: f64,
    ) -> Self {
        Self {
            engine,
            positions,
            locks,
            fee_bps,
        }
    }

    /// Closes the position for the full remaining quantity.
    ///
    /// On any order failure the position is left OPEN exactly as it was, so
    /// the next monitor pass can try again. An exit whose outcome is unknown
    /// stays recorded on the position and is looked up before anything new
    /// is sent.
    pub async fn close(&self, position_id: Uuid, reason: ExitReason) -> Result<Position> {
        let snapshot = self
            .positions
            .find_by_id(position_id)
            .await?
            .ok_or(TradeError::PositionNotFound(position_id))?;
        let _guard = self.locks.lock(&snapshot.key()).await;

        // Re-read under the lock; a concurrent fill may have closed it.
        let mut position = self
            .positions
            .find_by_id(position_id)
            .await?
            .ok_or(TradeError::PositionNotFound(position_id))?;
        if !position.is_open() {
            return Err(TradeError::PositionClosed(position_id));
        }

        let request = OrderRequest::market(
            &position.symbol,
            position.market_type,
            position.side.closing_side(),
            position.quantity,
        )
        .reduce_only()
        .tagged(&format!("exit:{}", reason.as_str().to_ascii_lowercase()));

        let pending = self.pending_exit(&mut position, &request).await?;
        let order = match pending {
            Some(order) => order,
            None => self.send_exit(&mut position, request, reason).await?,
        };

        if order.executed_qty <= 0.0 {
            return Err(TradeError::Transient(format!(
                "exit order {} not filled ({})",
                order.client_order_id,
                order.status.as_str()
            )));
        }

        let exit_price = order.avg_fill_price.unwrap_or_else(|| position.mark_price());
        position.exit_order_ids.push(order.id);
        position.pending_exit_client_id = None;

        if order.executed_qty + 1e-12 < position.quantity {
            // Book what filled; the remainder is retried on the next pass.
            let pnl = position.pnl_at(exit_price, order.executed_qty);
            position.quantity -= order.executed_qty;
            position.partial_realized_pnl += pnl;
            position.last_fill_at = Some(Utc::now());
            self.positions.save(&position).await?;
            return Err(TradeError::Transient(format!(
                "exit order {} {} filled {} of {}",
                order.client_order_id,
                order.status.as_str(),
                order.executed_qty,
                order.executed_qty + position.quantity
            )));
        }

        if order.status != OrderStatus::Filled {
            tracing::debug!(order = %order.id, "exit order fully executed but reported {}", order.status.as_str());
        }

        let realized = position.pnl_at(exit_price, position.quantity) + position.partial_realized_pnl;
        settle_close(
            self.positions.as_ref(),
            &mut position,
            exit_price,
            realized,
            reason,
            self.fee_bps,
            Utc::now(),
        )
        .await?;
        Ok(position)
    }

    /// Resolves an exit sent on an earlier pass. `Ok(None)` means nothing of
    /// it executed and a fresh exit may go out.
    async fn pending_exit(
        &self,
        position: &mut Position,
        request: &OrderRequest,
    ) -> Result<Option<Order>> {
        let Some(client_order_id) = position.pending_exit_client_id.clone() else {
            return Ok(None);
        };
        let mut lookup = request.clone();
        lookup.client_order_id = Some(client_order_id.clone());

        let found = match self.engine.lookup_order(&lookup, position.exchange).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    position = %position.id,
                    client_order_id = %client_order_id,
                    "Earlier exit order unresolved, not sending another: {}",
                    e
                );
                return Err(e);
            }
        };

        match found {
            Some(order) if !order.status.is_final() => Err(TradeError::Transient(format!(
                "exit order {} still {}",
                client_order_id,
                order.status.as_str()
            ))),
            Some(order) if order.executed_qty > 0.0 => {
                tracing::info!(
                    position = %position.id,
                    client_order_id = %client_order_id,
                    "Earlier exit order executed {}",
                    order.executed_qty
                );
                Ok(Some(order))
            }
            _ => {
                position.pending_exit_client_id = None;
                self.positions.save(position).await?;
                Ok(None)
            }
        }
    }

    async fn send_exit(
        &self,
        position: &mut Position,
        mut request: OrderRequest,
        reason: ExitReason,
    ) -> Result<Order> {
        let client_order_id = OrderEngine::new_client_order_id();
        request.client_order_id = Some(client_order_id.clone());
        position.pending_exit_client_id = Some(client_order_id);
        self.positions.save(position).await?;

        match self.engine.submit(&request, position.exchange).await {
            Ok(order) => Ok(order),
            Err(e) => {
                tracing::warn!(
                    position = %position.id,
                    key = %position.key(),
                    reason = %reason,
                    "Exit order failed, position stays open: {}",
                    e
                );
                Err(e)
            }
        }
    }
}
