use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RiskLimits;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitBreakerTrip {
    /// Drawdown from today's peak (UTC), as a fraction.
    DailyDrawdown(f64),
    /// Drawdown from this ISO week's peak, as a fraction.
    WeeklyDrawdown(f64),
}

impl std::fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerTrip::DailyDrawdown(dd) => {
                write!(f, "daily drawdown {:.2}% hit the limit", dd * 100.0)
            }
            CircuitBreakerTrip::WeeklyDrawdown(dd) => {
                write!(f, "weekly drawdown {:.2}% hit the limit", dd * 100.0)
            }
        }
    }
}

/// Portfolio value peaks for the current UTC day and ISO week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub current_value: f64,
    pub start_of_day_value: f64,
    pub peak_today: f64,
    pub start_of_week_value: f64,
    pub peak_this_week: f64,
    pub day: NaiveDate,
    /// (ISO year, ISO week)
    pub week: (i32, u32),
}

fn iso_week(day: NaiveDate) -> (i32, u32) {
    let w = day.iso_week();
    (w.year(), w.week())
}

impl PortfolioSnapshot {
    pub fn new(value: f64, now: DateTime<Utc>) -> Self {
        let day = now.date_naive();
        Self {
            current_value: value,
            start_of_day_value: value,
            peak_today: value,
            start_of_week_value: value,
            peak_this_week: value,
            day,
            week: iso_week(day),
        }
    }

    /// Records a new portfolio value, rolling the day and week windows over
    /// at UTC midnight and ISO-week boundaries.
    pub fn observe(&mut self, value: f64, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.start_of_day_value = value;
            self.peak_today = value;
        }
        let week = iso_week(day);
        if week != self.week {
            self.week = week;
            self.start_of_week_value = value;
            self.peak_this_week = value;
        }
        self.current_value = value;
        self.peak_today = self.peak_today.max(value);
        self.peak_this_week = self.peak_this_week.max(value);
    }

    pub fn daily_drawdown(&self) -> f64 {
        drawdown(self.peak_today, self.current_value)
    }

    pub fn weekly_drawdown(&self) -> f64 {
        drawdown(self.peak_this_week, self.current_value)
    }

    pub fn check(&self, limits: &RiskLimits) -> Result<(), CircuitBreakerTrip> {
        let daily = self.daily_drawdown();
        if daily >= limits.daily_loss_limit_pct {
            return Err(CircuitBreakerTrip::DailyDrawdown(daily));
        }
        let weekly = self.weekly_drawdown();
        if weekly >= limits.weekly_drawdown_limit_pct {
            return Err(CircuitBreakerTrip::WeeklyDrawdown(weekly));
        }
        Ok(())
    }
}

fn drawdown(peak: f64, current: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - current) / peak).max(0.0)
}

/// Shared snapshot refreshed by the risk loop and read by the gate.
///
/// Until the first observation there is nothing to measure, so trades pass.
#[derive(Default)]
pub struct PortfolioTracker {
    snapshot: RwLock<Option<PortfolioSnapshot>>,
}

impl PortfolioTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observe(&self, value: f64, now: DateTime<Utc>) {
        let mut guard = self.snapshot.write().await;
        match guard.as_mut() {
            Some(snapshot) => snapshot.observe(value, now),
            None => *guard = Some(PortfolioSnapshot::new(value, now)),
        }
    }

    pub async fn snapshot(&self) -> Option<PortfolioSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn check(&self, limits: &RiskLimits) -> Result<(), CircuitBreakerTrip> {
        match self.snapshot.read().await.as_ref() {
            Some(snapshot) => snapshot.check(limits),
            None => Ok(()),
        }
    }
}
