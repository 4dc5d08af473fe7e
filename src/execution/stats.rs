use crate::models::{Position, TradeStats};

/// Figures for a position closing at `exit_price` with `realized` PnL.
///
/// `history` is the symbol's previously closed positions; the closing trade is
/// folded in, so `sample_size` is always at least one.
pub fn close_stats(
    position: &Position,
    exit_price: f64,
    realized: f64,
    history: &[Position],
    fee_bps: f64,
) -> TradeStats {
    let entry_notional = position.entry_price * position.quantity;
    let exit_notional = exit_price * position.quantity;
    let fees = (entry_notional + exit_notional) * fee_bps / 10_000.0;
    let net_profit = realized - fees;
    let return_pct = if entry_notional > 0.0 {
        net_profit / entry_notional * 100.0
    } else {
        0.0
    };

    let mut returns: Vec<f64> = history
        .iter()
        .filter(|p| p.id != position.id)
        .filter_map(trade_return)
        .collect();
    if entry_notional > 0.0 {
        returns.push(realized / entry_notional);
    }

    let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
    let gross_win: f64 = wins.iter().sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| -r).sum();

    TradeStats {
        fees,
        net_profit,
        return_pct,
        risk_reward: risk_reward(position),
        win_rate: (!returns.is_empty()).then(|| wins.len() as f64 / returns.len() as f64),
        profit_factor: (gross_loss > 0.0).then(|| gross_win / gross_loss),
        sharpe: sharpe(&returns),
        sample_size: returns.len(),
    }
}

/// Realized return of a closed position relative to its entry notional.
pub fn trade_return(position: &Position) -> Option<f64> {
    let notional = position.entry_price * position.quantity;
    match position.realized_pnl {
        Some(pnl) if notional > 0.0 => Some(pnl / notional),
        _ => None,
    }
}

/// Planned reward over planned risk, from the position's stops.
pub fn risk_reward(position: &Position) -> Option<f64> {
    let stop = position.stop_loss_price?;
    let target = position.take_profit_price?;
    let risk = (position.entry_price - stop).abs();
    if risk <= 0.0 {
        return None;
    }
    Some((target - position.entry_price).abs() / risk)
}

/// Mean over sample standard deviation of per-trade returns.
pub fn sharpe(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    (sd > 0.0).then(|| mean / sd)
}
