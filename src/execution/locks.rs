use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{PositionKey, PositionSide};

/// One async mutex per position key. Writers to the same key queue up;
/// different keys proceed in parallel.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<PositionKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &PositionKey) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Locks both sides of a key, LONG first, so fills that may touch either
    /// side never acquire in opposite orders.
    pub async fn lock_both_sides(&self, key: &PositionKey) -> [OwnedMutexGuard<()>; 2] {
        let long = PositionKey {
            side: PositionSide::Long,
            ..key.clone()
        };
        let short = PositionKey {
            side: PositionSide::Short,
            ..key.clone()
        };
        let first = self.lock(&long).await;
        let second = self.lock(&short).await;
        [first, second]
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExchangeId, MarketType};
    use std::time::Duration;

    fn key(side: PositionSide) -> PositionKey {
        PositionKey {
            exchange: ExchangeId::Paper,
            market_type: MarketType::Linear,
            symbol: "BTCUSDT".to_string(),
            side,
        }
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(&key(PositionSide::Long)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key(PositionSide::Long)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_key_is_independent() {
        let locks = KeyedLocks::new();
        let _long = locks.lock(&key(PositionSide::Long)).await;
        let short = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(&key(PositionSide::Short)),
        )
        .await;
        assert!(short.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
