// Persistence seams. The store is the source of truth; caches sit in front.
pub mod cache;
pub mod memory;
pub mod postgres;

pub use cache::CachedPositionStore;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Order, Position, PositionStatus};
use crate::Result;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or replace by `id`.
    async fn save(&self, order: &Order) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>>;

    async fn find_by_client_id(&self, client_order_id: &str) -> Result<Option<Order>>;

    /// Newest first.
    async fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert or replace by `id`. Fails if the position is OPEN and another
    /// OPEN position already holds its key.
    async fn save(&self, position: &Position) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Position>>;

    /// Oldest first by open time.
    async fn find_by_status(&self, status: PositionStatus) -> Result<Vec<Position>>;

    async fn find_by_symbol_and_status(
        &self,
        symbol: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>>;
}
