use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Process-wide risk limits. Fractions, not percentages (0.05 == 5%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_account_risk_pct: f64,
    pub max_single_coin_pct: f64,
    pub max_portfolio_deployed_pct: f64,
    pub max_correlated_positions: usize,
    pub correlation_threshold: f64,
    pub daily_loss_limit_pct: f64,
    pub weekly_drawdown_limit_pct: f64,
    pub correlation_lookback_days: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_account_risk_pct: 0.01,       // 1% of balance at risk per trade
            max_single_coin_pct: 0.05,        // 5% notional per instrument
            max_portfolio_deployed_pct: 0.50, // 50% deployed per exchange
            max_correlated_positions: 3,
            correlation_threshold: 0.7,
            daily_loss_limit_pct: 0.05,
            weekly_drawdown_limit_pct: 0.10,
            correlation_lookback_days: 30,
        }
    }
}

/// Volatility tiers for default stop placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilitySettings {
    /// Daily return stdev at or above this is the high tier.
    pub high_threshold: f64,
    /// Daily return stdev below this is the low tier.
    pub low_threshold: f64,
    pub base_stop_pct: f64,
    pub default_volatility: f64,
    pub target_risk_reward: f64,
    pub high_multiplier: f64,
    pub medium_multiplier: f64,
    pub low_multiplier: f64,
}

impl Default for VolatilitySettings {
    fn default() -> Self {
        Self {
            high_threshold: 0.05,
            low_threshold: 0.02,
            base_stop_pct: 0.02,
            default_volatility: 0.02,
            target_risk_reward: 2.0,
            high_multiplier: 1.5,
            medium_multiplier: 1.0,
            low_multiplier: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub secure_profit_trigger_pct: f64,
    pub secure_profit_lock_pct: f64,
    /// Favourable excursion that arms the trailing stop. `None` disables it.
    pub trailing_activation_pct: Option<f64>,
    pub trailing_distance_pct: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            secure_profit_trigger_pct: 0.30,
            secure_profit_lock_pct: 0.001,
            trailing_activation_pct: Some(0.12),
            trailing_distance_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Per-side fee estimate in basis points.
    pub fee_bps: f64,
}

impl OrderSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2000,
            fee_bps: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub reconcile_interval_secs: u64,
    pub risk_refresh_interval_secs: u64,
    pub price_timeout_ms: u64,
    pub max_concurrent_price_fetches: usize,
}

impl SchedulerSettings {
    pub fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.price_timeout_ms)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            risk_refresh_interval_secs: 300,
            price_timeout_ms: 5000,
            max_concurrent_price_fetches: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_recv_window() -> u64 {
    5000
}

fn default_requests_per_second() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub bybit: Option<ExchangeCredentials>,
    pub mexc: Option<ExchangeCredentials>,
    pub paper: bool,
    pub paper_balance: f64,
    pub server_time_ttl_secs: u64,
    pub http_timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            bybit: None,
            mexc: None,
            paper: false,
            paper_balance: 10_000.0,
            server_time_ttl_secs: 300,
            http_timeout_ms: 10_000,
        }
    }
}

/// Everything loaded once at startup. Immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub risk: RiskLimits,
    pub volatility: VolatilitySettings,
    pub monitor: MonitorSettings,
    pub orders: OrderSettings,
    pub scheduler: SchedulerSettings,
    pub exchanges: ExchangeSettings,
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Defaults, then `tradecore.toml` (or `path`), then `TRADECORE__*` env vars.
    ///
    /// # Example
    /// ```text
    /// TRADECORE__RISK__MAX_SINGLE_COIN_PCT=0.03
    /// TRADECORE__EXCHANGES__BYBIT__API_KEY=...
    /// ```
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&AppConfig::default())?;
        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name("tradecore").required(false),
        };

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("TRADECORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: AppConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let r = &self.risk;
        for (name, v) in [
            ("max_account_risk_pct", r.max_account_risk_pct),
            ("max_single_coin_pct", r.max_single_coin_pct),
            ("max_portfolio_deployed_pct", r.max_portfolio_deployed_pct),
            ("daily_loss_limit_pct", r.daily_loss_limit_pct),
            ("weekly_drawdown_limit_pct", r.weekly_drawdown_limit_pct),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(crate::TradeError::Validation(format!(
                    "risk.{name} must be a fraction in [0, 1], got {v}"
                )));
            }
        }
        if self.orders.max_attempts == 0 {
            return Err(crate::TradeError::Validation(
                "orders.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.volatility.low_threshold > self.volatility.high_threshold {
            return Err(crate::TradeError::Validation(
                "volatility.low_threshold exceeds high_threshold".to_string(),
            ));
        }
        Ok(())
    }
}
