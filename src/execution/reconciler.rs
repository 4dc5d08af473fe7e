use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::closer::settle_close;
use super::locks::KeyedLocks;
use super::monitor::{MonitorOutcome, PositionMonitor};
use crate::config::SchedulerSettings;
use crate::exchange::ExchangeRegistry;
use crate::models::{
    ExchangeId, ExitReason, MarketType, Position, PositionKey, PositionStatus, ReportedPosition,
};
use crate::store::PositionStore;
use crate::Result;

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    /// (exchange, market) pairs whose position list was fetched successfully.
    pub ok: Vec<(ExchangeId, MarketType)>,
    pub failed: Vec<(ExchangeId, MarketType, String)>,
    pub opened: usize,
    pub updated: usize,
    pub closed: usize,
    /// Positions handed to the monitor in the post-pass.
    pub evaluated: usize,
    pub exits: usize,
    pub price_skips: usize,
}

impl ReconcileReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ok: Vec::new(),
            failed: Vec::new(),
            opened: 0,
            updated: 0,
            closed: 0,
            evaluated: 0,
            exits: 0,
            price_skips: 0,
        }
    }

    /// Open/close transitions made this cycle.
    pub fn transitions(&self) -> usize {
        self.opened + self.closed + self.exits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Updated,
    Adopted,
    Skipped,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Makes the local OPEN set converge on what each venue reports.
pub struct PositionReconciler {
    registry: ExchangeRegistry,
    positions: Arc<dyn PositionStore>,
    locks: Arc<KeyedLocks>,
    monitor: Arc<PositionMonitor>,
    settings: SchedulerSettings,
    busy: AtomicBool,
}

impl PositionReconciler {
    pub fn new(
        registry: ExchangeRegistry,
        positions: Arc<dyn PositionStore>,
        locks: Arc<KeyedLocks>,
        monitor: Arc<PositionMonitor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            positions,
            locks,
            monitor,
            settings,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Runs one cycle. Returns `None` without doing anything when a cycle is
    /// already in progress.
    pub async fn run_cycle(&self) -> Result<Option<ReconcileReport>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Reconciliation still running, skipping this tick");
            return Ok(None);
        }
        let _busy = BusyGuard(&self.busy);

        let started_at = Utc::now();
        let mut report = ReconcileReport::new(started_at);

        let fetches = self.registry.all().into_iter().flat_map(|adapter| {
            adapter.reconciled_markets().into_iter().map(move |market| {
                let adapter = adapter.clone();
                async move {
                    let result = adapter.fetch_positions(market).await;
                    (adapter.id(), market, result)
                }
            })
        });

        let mut reported: Vec<(ExchangeId, MarketType, Vec<ReportedPosition>)> = Vec::new();
        for (exchange, market, result) in join_all(fetches).await {
            match result {
                Ok(list) => {
                    tracing::debug!(exchange = %exchange, market = %market, "{} positions reported", list.len());
                    report.ok.push((exchange, market));
                    reported.push((exchange, market, list));
                }
                Err(e) => {
                    tracing::warn!(
                        exchange = %exchange,
                        market = %market,
                        "Position fetch failed, skipping this cycle: {}",
                        e
                    );
                    report.failed.push((exchange, market, e.to_string()));
                }
            }
        }

        // Keys any venue still reports stay open even if their merge fails below
        let reported_keys: HashSet<PositionKey> = reported
            .iter()
            .flat_map(|(exchange, _, list)| {
                list.iter()
                    .filter(|item| item.quantity > 0.0)
                    .map(move |item| item.key(*exchange))
            })
            .collect();

        for (exchange, _, list) in &reported {
            for item in list {
                if item.quantity <= 0.0 {
                    continue;
                }
                match self.merge_one(*exchange, item, started_at).await {
                    Ok(MergeOutcome::Adopted) => report.opened += 1,
                    Ok(MergeOutcome::Updated) => report.updated += 1,
                    Ok(MergeOutcome::Skipped) => {}
                    Err(e) => tracing::warn!(
                        exchange = %exchange,
                        symbol = %item.symbol,
                        "Failed to merge reported position: {}",
                        e
                    ),
                }
            }
        }

        let queried: HashSet<(ExchangeId, MarketType)> = report.ok.iter().copied().collect();
        for position in self.positions.find_by_status(PositionStatus::Open).await? {
            if reported_keys.contains(&position.key())
                || !queried.contains(&(position.exchange, position.market_type))
            {
                continue;
            }
            // Opened after the fetch went out; the report cannot know about it.
            if position.open_time >= started_at {
                continue;
            }
            match self.close_missing(position.id, &position.key(), started_at).await {
                Ok(true) => report.closed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(position = %position.id, "Failed to close missing position: {}", e),
            }
        }

        self.evaluate_open(&mut report).await?;

        tracing::info!(
            "Reconciliation done: {} ok, {} failed, {} opened, {} updated, {} closed, {} exits",
            report.ok.len(),
            report.failed.len(),
            report.opened,
            report.updated,
            report.closed,
            report.exits
        );
        Ok(Some(report))
    }

    /// Merges one reported position under its key lock.
    ///
    /// The report was taken at `started_at`: a record a local fill has touched
    /// since then keeps its own size, and a key closed locally since then is
    /// not adopted back.
    async fn merge_one(
        &self,
        exchange: ExchangeId,
        item: &ReportedPosition,
        started_at: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let key = item.key(exchange);
        let _guard = self.locks.lock(&key).await;

        if let Some(mut local) = self.find_open(&key).await? {
            if local.last_fill_at.is_some_and(|t| t >= started_at) {
                tracing::debug!(key = %key, "Filled locally during the cycle, keeping local size");
                local.merge_marks(item);
            } else {
                local.merge_report(item);
            }
            self.positions.save(&local).await?;
            return Ok(MergeOutcome::Updated);
        }

        let closed_since = self
            .positions
            .find_by_symbol_and_status(&key.symbol, PositionStatus::Closed)
            .await?
            .into_iter()
            .any(|p| p.key() == key && p.close_time.is_some_and(|t| t >= started_at));
        if closed_since {
            tracing::info!(key = %key, "Closed locally while the report was in flight, not adopting");
            return Ok(MergeOutcome::Skipped);
        }

        let position = Position::from_report(exchange, item, Utc::now());
        self.positions.save(&position).await?;
        tracing::info!(
            position = %position.id,
            key = %key,
            "Adopted position reported by exchange: {} @ {:.6}",
            position.quantity,
            position.entry_price
        );
        Ok(MergeOutcome::Adopted)
    }

    async fn close_missing(
        &self,
        id: Uuid,
        key: &PositionKey,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.locks.lock(key).await;
        let Some(mut position) = self.positions.find_by_id(id).await? else {
            return Ok(false);
        };
        if !position.is_open() || position.open_time >= started_at {
            return Ok(false);
        }

        let realized = position.unrealized_pnl + position.partial_realized_pnl;
        let exit_price = position.mark_price();
        tracing::warn!(
            position = %position.id,
            key = %key,
            "Position missing from exchange report, closing"
        );
        settle_close(
            self.positions.as_ref(),
            &mut position,
            exit_price,
            realized,
            ExitReason::NotFoundOnExchange,
            0.0,
            Utc::now(),
        )
        .await?;
        Ok(true)
    }

    async fn find_open(&self, key: &PositionKey) -> Result<Option<Position>> {
        let open = self
            .positions
            .find_by_symbol_and_status(&key.symbol, PositionStatus::Open)
            .await?;
        Ok(open.into_iter().find(|p| &p.key() == key))
    }

    /// Prices every OPEN position and hands it to the monitor. A slow or
    /// failed price only skips that position.
    async fn evaluate_open(&self, report: &mut ReconcileReport) -> Result<()> {
        let open = self.positions.find_by_status(PositionStatus::Open).await?;
        let timeout = self.settings.price_timeout();
        let limit = self.settings.max_concurrent_price_fetches.max(1);

        let mut adapters = HashMap::new();
        for position in &open {
            if let std::collections::hash_map::Entry::Vacant(slot) = adapters.entry(position.exchange) {
                match self.registry.get(position.exchange) {
                    Ok(adapter) => {
                        slot.insert(adapter);
                    }
                    Err(e) => tracing::warn!(exchange = %position.exchange, "{}", e),
                }
            }
        }

        let prices: Vec<(Uuid, String, Option<f64>)> = stream::iter(open)
            .map(|position| {
                let adapter = adapters.get(&position.exchange).cloned();
                async move {
                    let Some(adapter) = adapter else {
                        return (position.id, position.symbol, None);
                    };
                    let fetch = adapter.ticker_price(&position.symbol, position.market_type);
                    let price = match tokio::time::timeout(timeout, fetch).await {
                        Ok(Ok(price)) if price > 0.0 => Some(price),
                        Ok(Ok(price)) => {
                            tracing::warn!(symbol = %position.symbol, "Ignoring non-positive price {}", price);
                            None
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(symbol = %position.symbol, "Price fetch failed: {}", e);
                            None
                        }
                        Err(_) => {
                            tracing::warn!(symbol = %position.symbol, "Price fetch timed out after {:?}", timeout);
                            None
                        }
                    };
                    (position.id, position.symbol, price)
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (id, symbol, price) in prices {
            let Some(price) = price else {
                report.price_skips += 1;
                continue;
            };
            report.evaluated += 1;
            match self.monitor.check(id, price).await {
                Ok(MonitorOutcome::Closed(reason)) => {
                    report.exits += 1;
                    tracing::info!(position = %id, symbol = %symbol, "Exited on {}", reason);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(position = %id, symbol = %symbol, "Monitor check failed: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_guard_releases_flag() {
        let flag = AtomicBool::new(true);
        {
            let _g = BusyGuard(&flag);
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_transitions_count_opens_closes_and_exits() {
        let mut report = ReconcileReport::new(Utc::now());
        report.opened = 1;
        report.updated = 5;
        report.closed = 2;
        report.exits = 1;
        assert_eq!(report.transitions(), 4);
    }
}
