use chrono::Utc;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::Result;

/// Server-time offset cache.
///
/// Keeps `server - local` in milliseconds for at most `ttl`, so clock-skew
/// correction costs one venue call per TTL window.
pub struct ServerClock {
    ttl: Duration,
    offset: Mutex<Option<(Instant, i64)>>,
}

impl ServerClock {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            offset: Mutex::new(None),
        }
    }

    pub fn local_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn fresh_offset(&self) -> Option<i64> {
        let guard = self.offset.lock().ok()?;
        match *guard {
            Some((at, offset)) if at.elapsed() < self.ttl => Some(offset),
            _ => None,
        }
    }

    pub fn record(&self, server_ms: i64) {
        if let Ok(mut guard) = self.offset.lock() {
            *guard = Some((Instant::now(), server_ms - Self::local_ms()));
        }
    }

    /// Forces the next call to re-sync, e.g. after a recv-window rejection.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.offset.lock() {
            *guard = None;
        }
    }

    /// Server time from cache, or from `fetch` when the cache is stale.
    pub async fn now_or_sync<F, Fut>(&self, fetch: F) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        if let Some(offset) = self.fresh_offset() {
            return Ok(Self::local_ms() + offset);
        }
        let server_ms = fetch().await?;
        self.record(server_ms);
        Ok(server_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_fetches_once_within_ttl() {
        let clock = ServerClock::new(Duration::from_secs(300));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let t = clock
                .now_or_sync(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ServerClock::local_ms() + 1_000)
                })
                .await
                .unwrap();
            assert!(t >= ServerClock::local_ms() + 900);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_offset_refetches() {
        let clock = ServerClock::new(Duration::from_millis(0));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            clock
                .now_or_sync(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ServerClock::local_ms())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_offset() {
        let clock = ServerClock::new(Duration::from_secs(300));
        clock.record(ServerClock::local_ms());
        assert!(clock.fresh_offset().is_some());
        clock.invalidate();
        assert!(clock.fresh_offset().is_none());
    }
}
