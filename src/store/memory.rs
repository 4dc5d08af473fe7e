use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{OrderStore, PositionStore};
use crate::models::{Order, Position, PositionStatus};
use crate::{Result, TradeError};

/// Process-local store for paper trading and tests.
#[derive(Default)]
pub struct InMemoryStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    positions: RwLock<HashMap<Uuid, Position>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn position_count(&self) -> usize {
        self.positions.read().await.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn save(&self, order: &Order) -> Result<()> {
        self.orders.write().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn find_by_client_id(&self, client_order_id: &str) -> Result<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.client_order_id == client_order_id)
            .cloned())
    }

    async fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn save(&self, position: &Position) -> Result<()> {
        let mut positions = self.positions.write().await;

        if position.is_open() {
            let key = position.key();
            let clash = positions
                .values()
                .any(|p| p.id != position.id && p.is_open() && p.key() == key);
            if clash {
                return Err(TradeError::Store(format!(
                    "an open position already exists for {key}"
                )));
            }
            if position.quantity <= 0.0 {
                return Err(TradeError::Store(format!(
                    "open position {} with non-positive quantity",
                    position.id
                )));
            }
        }

        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn find_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        let mut found: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.open_time.cmp(&b.open_time));
        Ok(found)
    }

    async fn find_by_symbol_and_status(
        &self,
        symbol: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        let mut found: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.symbol == symbol && p.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.open_time.cmp(&b.open_time));
        Ok(found)
    }
}
