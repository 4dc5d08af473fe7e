use crate::config::VolatilitySettings;
use crate::models::{Position, PositionSide};
use crate::{Result, TradeError};

pub const KELLY_MIN: f64 = 0.01;
pub const KELLY_MAX: f64 = 0.25;

/// Closed trades needed before Kelly is trusted to cap a size.
pub const MIN_KELLY_TRADES: usize = 5;

/// Size that loses `balance * risk_pct` if `stop` is hit from `entry`.
pub fn fixed_fractional(balance: f64, risk_pct: f64, entry: f64, stop: f64) -> Result<f64> {
    let distance = (entry - stop).abs();
    if balance <= 0.0 || entry <= 0.0 || distance <= f64::EPSILON {
        return Err(TradeError::Validation(format!(
            "cannot size: balance {balance}, entry {entry}, stop {stop}"
        )));
    }
    Ok(balance * risk_pct / distance)
}

/// Kelly fraction `(b*p - q) / b`, clamped to [1%, 25%] of capital.
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 || avg_win <= 0.0 {
        return KELLY_MIN;
    }
    let b = avg_win / avg_loss;
    let p = win_rate.clamp(0.0, 1.0);
    let q = 1.0 - p;
    ((b * p - q) / b).clamp(KELLY_MIN, KELLY_MAX)
}

/// Win/loss figures for one symbol's closed positions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TradeHistory {
    pub trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
}

impl TradeHistory {
    pub fn from_closed(positions: &[Position]) -> Self {
        let pnls: Vec<f64> = positions.iter().filter_map(|p| p.realized_pnl).collect();
        if pnls.is_empty() {
            return Self::default();
        }
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).map(f64::abs).collect();
        let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
        Self {
            trades: pnls.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
        }
    }

    pub fn kelly(&self) -> Option<f64> {
        (self.trades >= MIN_KELLY_TRADES).then(|| kelly_fraction(self.win_rate, self.avg_win, self.avg_loss))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityTier {
    High,
    Medium,
    Low,
}

impl VolatilityTier {
    pub fn classify(volatility: f64, settings: &VolatilitySettings) -> Self {
        if volatility >= settings.high_threshold {
            VolatilityTier::High
        } else if volatility < settings.low_threshold {
            VolatilityTier::Low
        } else {
            VolatilityTier::Medium
        }
    }

    pub fn multiplier(&self, settings: &VolatilitySettings) -> f64 {
        match self {
            VolatilityTier::High => settings.high_multiplier,
            VolatilityTier::Medium => settings.medium_multiplier,
            VolatilityTier::Low => settings.low_multiplier,
        }
    }
}

/// Standard deviation of close-to-close returns.
pub fn volatility_from_closes(closes: &[f64]) -> Result<f64> {
    if closes.len() < 5 {
        return Err(TradeError::InsufficientData(format!(
            "{} closes, need at least 5",
            closes.len()
        )));
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return Err(TradeError::InsufficientData("not enough usable returns".to_string()));
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Ok(var.sqrt())
}

/// Default stop for an entry, widened or narrowed by the volatility tier.
pub fn default_stop_loss(
    entry: f64,
    side: PositionSide,
    volatility: f64,
    settings: &VolatilitySettings,
) -> f64 {
    let pct = settings.base_stop_pct * VolatilityTier::classify(volatility, settings).multiplier(settings);
    match side {
        PositionSide::Long => entry * (1.0 - pct),
        PositionSide::Short => entry * (1.0 + pct),
    }
}

/// Take-profit at `risk_reward` times the stop distance.
pub fn take_profit_from_stop(entry: f64, stop: f64, risk_reward: f64) -> f64 {
    let distance = (entry - stop).abs();
    if stop < entry {
        entry + distance * risk_reward
    } else {
        entry - distance * risk_reward
    }
}
