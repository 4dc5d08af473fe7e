use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::PositionStore;
use crate::models::{Position, PositionStatus};
use crate::Result;

/// Write-through, read-through position cache.
///
/// The cache is only touched after the inner store accepted the write, so a
/// failed save never leaves a cached value the store does not have.
pub struct CachedPositionStore {
    inner: Arc<dyn PositionStore>,
    by_id: DashMap<Uuid, Position>,
}

impl CachedPositionStore {
    pub fn new(inner: Arc<dyn PositionStore>) -> Self {
        Self {
            inner,
            by_id: DashMap::new(),
        }
    }

    pub fn cached(&self, id: Uuid) -> Option<Position> {
        self.by_id.get(&id).map(|p| p.clone())
    }

    pub fn invalidate(&self, id: Uuid) {
        self.by_id.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn remember(&self, positions: &[Position]) {
        for p in positions {
            self.by_id.insert(p.id, p.clone());
        }
    }
}

#[async_trait]
impl PositionStore for CachedPositionStore {
    async fn save(&self, position: &Position) -> Result<()> {
        self.inner.save(position).await?;
        self.by_id.insert(position.id, position.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Position>> {
        if let Some(hit) = self.cached(id) {
            return Ok(Some(hit));
        }
        let found = self.inner.find_by_id(id).await?;
        if let Some(p) = &found {
            self.by_id.insert(p.id, p.clone());
        }
        Ok(found)
    }

    // Set queries always go to the store; the cache cannot know what it is missing.
    async fn find_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        let found = self.inner.find_by_status(status).await?;
        self.remember(&found);
        Ok(found)
    }

    async fn find_by_symbol_and_status(
        &self,
        symbol: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        let found = self.inner.find_by_symbol_and_status(symbol, status).await?;
        self.remember(&found);
        Ok(found)
    }
}
