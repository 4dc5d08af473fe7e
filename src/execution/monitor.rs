use std::sync::Arc;
use uuid::Uuid;

use super::closer::PositionCloser;
use super::locks::KeyedLocks;
use crate::config::MonitorSettings;
use crate::exchange::ExchangeRegistry;
use crate::models::{ExitReason, InstrumentInfo, Position, PositionSide};
use crate::store::PositionStore;
use crate::{Result, TradeError};

/// Result of running the exit rules against one price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleDecision {
    /// Close now for this reason.
    Exit(ExitReason),
    /// Stops moved; persist and keep holding.
    Updated,
    Hold,
}

/// What the monitor did with a position this pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorOutcome {
    Held,
    Tightened,
    Closed(ExitReason),
    /// An exit fired but the order failed; the position is still OPEN.
    ExitFailed(ExitReason),
    /// Gone or already closed by the time we looked.
    Skipped,
}

fn trailing_candidate(position: &Position, settings: &MonitorSettings) -> Option<f64> {
    let activation = settings.trailing_activation_pct?;
    match position.side {
        PositionSide::Long => {
            let best = position.highest_price;
            (position.profit_fraction(best) >= activation)
                .then(|| best * (1.0 - settings.trailing_distance_pct))
        }
        PositionSide::Short => {
            let best = position.lowest_price;
            (best > 0.0 && position.profit_fraction(best) >= activation)
                .then(|| best * (1.0 + settings.trailing_distance_pct))
        }
    }
}

/// True when the secure-profit ratchet would fire at `price`.
pub fn ratchet_due(position: &Position, price: f64, settings: &MonitorSettings) -> bool {
    !position.secure_profit_applied
        && position.profit_fraction(price) >= settings.secure_profit_trigger_pct
}

/// Evaluates exit rules in priority order; the first match wins.
///
/// Stop-loss, then take-profit, then a trailing-stop breach, then the
/// one-shot secure-profit ratchet. Expects `position` already marked to
/// `price` so its extremes are current.
pub fn evaluate_rules(
    position: &mut Position,
    price: f64,
    settings: &MonitorSettings,
    instrument: Option<&InstrumentInfo>,
) -> RuleDecision {
    let long = position.side == PositionSide::Long;
    let mut updated = false;

    if let Some(candidate) = trailing_candidate(position, settings) {
        let tighter = match (position.trailing_stop_price, long) {
            (None, _) => true,
            (Some(current), true) => candidate > current,
            (Some(current), false) => candidate < current,
        };
        if tighter {
            position.trailing_stop_price = Some(candidate);
            updated = true;
        }
    }

    if let Some(sl) = position.stop_loss_price {
        if (long && price <= sl) || (!long && price >= sl) {
            return RuleDecision::Exit(ExitReason::StopLoss);
        }
    }
    if let Some(tp) = position.take_profit_price {
        if (long && price >= tp) || (!long && price <= tp) {
            return RuleDecision::Exit(ExitReason::TakeProfit);
        }
    }
    if let Some(trail) = position.trailing_stop_price {
        if (long && price <= trail) || (!long && price >= trail) {
            return RuleDecision::Exit(ExitReason::TrailingStop);
        }
    }

    if ratchet_due(position, price, settings) {
        let lock = settings.secure_profit_lock_pct;
        let target = if long {
            let raw = position.entry_price * (1.0 + lock);
            instrument.map_or(raw, |i| i.ceil_price(raw))
        } else {
            let raw = position.entry_price * (1.0 - lock);
            instrument.map_or(raw, |i| i.floor_price(raw))
        };
        // Never loosen a stop that is already tighter
        let stop = match position.stop_loss_price {
            Some(current) if long => current.max(target),
            Some(current) => current.min(target),
            None => target,
        };
        position.stop_loss_price = Some(stop);
        position.secure_profit_applied = true;
        tracing::info!(
            position = %position.id,
            key = %position.key(),
            "Secure-profit ratchet: stop moved to {:.6} (entry {:.6}, price {:.6})",
            stop,
            position.entry_price,
            price
        );
        return RuleDecision::Updated;
    }

    if updated {
        RuleDecision::Updated
    } else {
        RuleDecision::Hold
    }
}

/// Applies exit rules to OPEN positions and closes the ones that trigger.
pub struct PositionMonitor {
    registry: ExchangeRegistry,
    positions: Arc<dyn PositionStore>,
    locks: Arc<KeyedLocks>,
    closer: Arc<PositionCloser>,
    settings: MonitorSettings,
}

impl PositionMonitor {
    pub fn new(
        registry: ExchangeRegistry,
        positions: Arc<dyn PositionStore>,
        locks: Arc<KeyedLocks>,
        closer: Arc<PositionCloser>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            positions,
            locks,
            closer,
            settings,
        }
    }

    /// Marks the position to `price`, runs the rules and, on an exit,
    /// closes it through the order engine.
    pub async fn check(&self, position_id: Uuid, price: f64) -> Result<MonitorOutcome> {
        let Some(snapshot) = self.positions.find_by_id(position_id).await? else {
            return Ok(MonitorOutcome::Skipped);
        };

        let decision = {
            let _guard = self.locks.lock(&snapshot.key()).await;
            let Some(mut position) = self.positions.find_by_id(position_id).await? else {
                return Ok(MonitorOutcome::Skipped);
            };
            if !position.is_open() {
                return Ok(MonitorOutcome::Skipped);
            }

            position.mark_to_market(price);

            let instrument = if ratchet_due(&position, price, &self.settings) {
                self.instrument_for(&position).await
            } else {
                None
            };
            let decision = evaluate_rules(&mut position, price, &self.settings, instrument.as_ref());
            self.positions.save(&position).await?;
            decision
        };

        match decision {
            RuleDecision::Hold => Ok(MonitorOutcome::Held),
            RuleDecision::Updated => Ok(MonitorOutcome::Tightened),
            RuleDecision::Exit(reason) => {
                tracing::info!(position = %position_id, reason = %reason, "Exit triggered @ {:.6}", price);
                match self.closer.close(position_id, reason).await {
                    Ok(_) => Ok(MonitorOutcome::Closed(reason)),
                    Err(TradeError::PositionClosed(_)) => Ok(MonitorOutcome::Skipped),
                    Err(e) => {
                        tracing::warn!(
                            position = %position_id,
                            reason = %reason,
                            "Exit failed, will re-evaluate next cycle: {}",
                            e
                        );
                        Ok(MonitorOutcome::ExitFailed(reason))
                    }
                }
            }
        }
    }

    async fn instrument_for(&self, position: &Position) -> Option<InstrumentInfo> {
        let adapter = self.registry.get(position.exchange).ok()?;
        match adapter.instrument(&position.symbol, position.market_type).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(symbol = %position.symbol, "No tick size for ratchet rounding: {}", e);
                None
            }
        }
    }
}
