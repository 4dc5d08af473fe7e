use chrono::Utc;
use std::sync::Arc;

use super::closer::settle_close;
use super::locks::KeyedLocks;
use crate::models::{
    ExitReason, Order, OrderRequest, Position, PositionKey, PositionSide, PositionStatus,
};
use crate::store::PositionStore;
use crate::Result;

const QTY_EPSILON: f64 = 1e-9;

/// What a fill did to the local book.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    Opened(Position),
    Increased(Position),
    Reduced(Position),
    Closed(Position),
    /// Nothing to apply: no execution, no price, or reduce-only with nothing to reduce.
    Ignored,
}

impl FillOutcome {
    pub fn position(&self) -> Option<&Position> {
        match self {
            FillOutcome::Opened(p)
            | FillOutcome::Increased(p)
            | FillOutcome::Reduced(p)
            | FillOutcome::Closed(p) => Some(p),
            FillOutcome::Ignored => None,
        }
    }
}

/// Applies order fills to positions: opposite side first, then same side,
/// and a new position only when no opposite position exists.
pub struct PositionBook {
    positions: Arc<dyn PositionStore>,
    locks: Arc<KeyedLocks>,
    fee_bps: f64,
}

impl PositionBook {
    pub fn new(positions: Arc<dyn PositionStore>, locks: Arc<KeyedLocks>, fee_bps: f64) -> Self {
        Self {
            positions,
            locks,
            fee_bps,
        }
    }

    async fn find_open(&self, key: &PositionKey) -> Result<Option<Position>> {
        let open = self
            .positions
            .find_by_symbol_and_status(&key.symbol, PositionStatus::Open)
            .await?;
        Ok(open.into_iter().find(|p| &p.key() == key))
    }

    pub async fn apply_fill(&self, order: &Order, request: &OrderRequest) -> Result<FillOutcome> {
        if order.executed_qty <= QTY_EPSILON {
            return Ok(FillOutcome::Ignored);
        }
        let Some(price) = order.avg_fill_price else {
            tracing::warn!(
                order = %order.id,
                symbol = %order.symbol,
                "Fill without a trustworthy price; leaving it to reconciliation"
            );
            return Ok(FillOutcome::Ignored);
        };

        let fill_side = PositionSide::opened_by(order.side);
        let same_key = PositionKey {
            exchange: order.exchange,
            market_type: order.market_type,
            symbol: order.symbol.clone(),
            side: fill_side,
        };
        let opposite_key = PositionKey {
            side: fill_side.opposite(),
            ..same_key.clone()
        };

        let _guards = self.locks.lock_both_sides(&same_key).await;
        let now = Utc::now();

        if let Some(mut opposite) = self.find_open(&opposite_key).await? {
            let closing = order.executed_qty.min(opposite.quantity);
            let pnl = opposite.pnl_at(price, closing);
            let remainder = order.executed_qty - closing;
            opposite.exit_order_ids.push(order.id);

            if remainder > QTY_EPSILON {
                tracing::warn!(
                    order = %order.id,
                    key = %opposite_key,
                    "Fill exceeds opposite position by {:.8}; remainder not reopened",
                    remainder
                );
            }

            if opposite.quantity - closing <= QTY_EPSILON {
                let realized = opposite.partial_realized_pnl + pnl;
                settle_close(
                    self.positions.as_ref(),
                    &mut opposite,
                    price,
                    realized,
                    ExitReason::OffsetByFill,
                    self.fee_bps,
                    now,
                )
                .await?;
                return Ok(FillOutcome::Closed(opposite));
            }

            opposite.quantity -= closing;
            opposite.partial_realized_pnl += pnl;
            opposite.last_fill_at = Some(now);
            opposite.mark_to_market(price);
            self.positions.save(&opposite).await?;
            tracing::info!(
                key = %opposite_key,
                "Reduced position by {} @ {:.6} (booked {:+.4}, {} left)",
                closing,
                price,
                pnl,
                opposite.quantity
            );
            return Ok(FillOutcome::Reduced(opposite));
        }

        if request.reduce_only {
            tracing::warn!(key = %opposite_key, order = %order.id, "Reduce-only fill with no position to reduce");
            return Ok(FillOutcome::Ignored);
        }

        if let Some(mut existing) = self.find_open(&same_key).await? {
            let total = existing.quantity + order.executed_qty;
            existing.entry_price =
                (existing.entry_price * existing.quantity + price * order.executed_qty) / total;
            existing.quantity = total;
            existing.last_fill_at = Some(now);
            existing.entry_order_ids.push(order.id);
            if request.stop_loss.is_some() {
                existing.stop_loss_price = request.stop_loss;
            }
            if request.take_profit.is_some() {
                existing.take_profit_price = request.take_profit;
            }
            existing.mark_to_market(price);
            self.positions.save(&existing).await?;
            tracing::info!(
                key = %same_key,
                "Added {} @ {:.6} (avg entry {:.6}, qty {})",
                order.executed_qty,
                price,
                existing.entry_price,
                existing.quantity
            );
            return Ok(FillOutcome::Increased(existing));
        }

        let mut position = Position::open(
            order.exchange,
            order.market_type,
            &order.symbol,
            fill_side,
            order.executed_qty,
            price,
            now,
        );
        position.stop_loss_price = request.stop_loss;
        position.take_profit_price = request.take_profit;
        position.entry_order_ids.push(order.id);
        self.positions.save(&position).await?;

        tracing::info!(
            position = %position.id,
            key = %same_key,
            "Opened position: {} @ {:.6}",
            position.quantity,
            price
        );
        Ok(FillOutcome::Opened(position))
    }
}
