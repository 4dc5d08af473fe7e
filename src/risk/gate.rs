use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::circuit_breakers::PortfolioTracker;
use super::correlation::pearson;
use super::sizing::{
    default_stop_loss, fixed_fractional, take_profit_from_stop, volatility_from_closes,
    TradeHistory,
};
use crate::config::{RiskLimits, VolatilitySettings};
use crate::exchange::{ExchangeAdapter, ExchangeRegistry};
use crate::models::{ExchangeId, MarketType, PositionSide, PositionStatus};
use crate::store::PositionStore;
use crate::Result;

/// A trade a strategy wants to open.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub market_type: MarketType,
    pub side: PositionSide,
    pub size: f64,
}

impl TradeProposal {
    pub fn new(symbol: &str, market_type: MarketType, side: PositionSide, size: f64) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            market_type,
            side,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeDecision {
    Accept,
    Reject { reason: String },
}

impl TradeDecision {
    fn reject(reason: impl Into<String>) -> Self {
        TradeDecision::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, TradeDecision::Accept)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TradeDecision::Accept => None,
            TradeDecision::Reject { reason } => Some(reason),
        }
    }
}

type ClosesKey = (ExchangeId, MarketType, String);

/// Pre-trade checks and sizing helpers.
pub struct RiskGate {
    registry: ExchangeRegistry,
    positions: Arc<dyn PositionStore>,
    tracker: Arc<PortfolioTracker>,
    limits: RiskLimits,
    volatility: VolatilitySettings,
    closes: DashMap<ClosesKey, (Instant, Arc<Vec<f64>>)>,
    closes_ttl: Duration,
}

impl RiskGate {
    pub fn new(
        registry: ExchangeRegistry,
        positions: Arc<dyn PositionStore>,
        tracker: Arc<PortfolioTracker>,
        limits: RiskLimits,
        volatility: VolatilitySettings,
        closes_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            positions,
            tracker,
            limits,
            volatility,
            closes: DashMap::new(),
            closes_ttl,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn tracker(&self) -> &Arc<PortfolioTracker> {
        &self.tracker
    }

    /// Runs every pre-trade check; the first failing one names the reason.
    ///
    /// `Err` is reserved for failures to evaluate (unknown venue, no price).
    /// A trade that breaks a limit comes back as `Ok(Reject)`.
    pub async fn validate_trade(
        &self,
        proposal: &TradeProposal,
        exchange: ExchangeId,
        account_balance: f64,
    ) -> Result<TradeDecision> {
        let decision = self.evaluate(proposal, exchange, account_balance).await?;
        match &decision {
            TradeDecision::Accept => tracing::debug!(
                exchange = %exchange,
                symbol = %proposal.symbol,
                "Trade accepted: {} {}",
                proposal.side.as_str(),
                proposal.size
            ),
            TradeDecision::Reject { reason } => tracing::info!(
                exchange = %exchange,
                symbol = %proposal.symbol,
                "Trade rejected: {}",
                reason
            ),
        }
        Ok(decision)
    }

    async fn evaluate(
        &self,
        proposal: &TradeProposal,
        exchange: ExchangeId,
        balance: f64,
    ) -> Result<TradeDecision> {
        if let Err(trip) = self.tracker.check(&self.limits).await {
            return Ok(TradeDecision::reject(format!("circuit breaker: {trip}")));
        }
        if !proposal.size.is_finite() || proposal.size <= 0.0 {
            return Ok(TradeDecision::reject(format!("invalid size {}", proposal.size)));
        }
        if balance <= 0.0 {
            return Ok(TradeDecision::reject(format!("account balance {balance} is not positive")));
        }

        let adapter = self.registry.get(exchange)?;
        let instrument = adapter.instrument(&proposal.symbol, proposal.market_type).await?;
        let size = instrument.floor_qty(proposal.size);
        if size < instrument.min_qty || size <= 0.0 {
            return Ok(TradeDecision::reject(format!(
                "size {} is below minimum {} after rounding to step {}",
                proposal.size, instrument.min_qty, instrument.qty_step
            )));
        }

        let price = adapter.ticker_price(&proposal.symbol, proposal.market_type).await?;
        let notional = size * price;
        let coin_cap = balance * self.limits.max_single_coin_pct;
        if notional > coin_cap {
            return Ok(TradeDecision::reject(format!(
                "notional {notional:.2} exceeds single-coin cap {coin_cap:.2}"
            )));
        }

        let open = self.positions.find_by_status(PositionStatus::Open).await?;
        let deployed: f64 = open
            .iter()
            .filter(|p| p.exchange == exchange)
            .map(|p| p.notional())
            .sum();
        let portfolio_cap = balance * self.limits.max_portfolio_deployed_pct;
        if deployed + notional > portfolio_cap {
            return Ok(TradeDecision::reject(format!(
                "deployed {deployed:.2} + {notional:.2} exceeds portfolio cap {portfolio_cap:.2}"
            )));
        }

        if !open.is_empty() {
            let correlated = self
                .count_correlated(adapter.as_ref(), proposal, &open)
                .await;
            if correlated >= self.limits.max_correlated_positions {
                return Ok(TradeDecision::reject(format!(
                    "{} open positions correlated above {} (max {})",
                    correlated, self.limits.correlation_threshold, self.limits.max_correlated_positions
                )));
            }
        }

        Ok(TradeDecision::Accept)
    }

    async fn count_correlated(
        &self,
        adapter: &dyn ExchangeAdapter,
        proposal: &TradeProposal,
        open: &[crate::models::Position],
    ) -> usize {
        let candidate = match self
            .closes_for(adapter, &proposal.symbol, proposal.market_type)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(symbol = %proposal.symbol, "No closes for correlation check: {}", e);
                return 0;
            }
        };

        let mut count = 0;
        for position in open {
            let series = match self.registry.get(position.exchange) {
                Ok(venue) => {
                    self.closes_for(venue.as_ref(), &position.symbol, position.market_type)
                        .await
                }
                Err(e) => Err(e),
            };
            match series {
                Ok(series) => {
                    let r = pearson(&candidate, &series);
                    if r > self.limits.correlation_threshold {
                        tracing::debug!(
                            "{} ~ {} correlation {:.3}",
                            proposal.symbol,
                            position.symbol,
                            r
                        );
                        count += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol = %position.symbol, "Treating as uncorrelated: {}", e);
                }
            }
        }
        count
    }

    async fn closes_for(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        market: MarketType,
    ) -> Result<Arc<Vec<f64>>> {
        let key = (adapter.id(), market, symbol.to_string());
        if let Some(entry) = self.closes.get(&key) {
            let (fetched, series) = entry.value();
            if fetched.elapsed() < self.closes_ttl {
                return Ok(series.clone());
            }
        }
        let series = Arc::new(
            adapter
                .daily_closes(symbol, market, self.limits.correlation_lookback_days)
                .await?,
        );
        self.closes.insert(key, (Instant::now(), series.clone()));
        Ok(series)
    }

    /// Stop-loss and take-profit for an entry, scaled by recent volatility.
    pub async fn default_exits(
        &self,
        symbol: &str,
        market: MarketType,
        side: PositionSide,
        exchange: ExchangeId,
        entry: f64,
    ) -> Result<(f64, f64)> {
        let adapter = self.registry.get(exchange)?;
        let volatility = match self.closes_for(adapter.as_ref(), symbol, market).await {
            Ok(closes) => volatility_from_closes(&closes),
            Err(e) => Err(e),
        }
        .unwrap_or_else(|e| {
            tracing::debug!(symbol = %symbol, "Using default volatility: {}", e);
            self.volatility.default_volatility
        });

        let stop = default_stop_loss(entry, side, volatility, &self.volatility);
        let take_profit = take_profit_from_stop(entry, stop, self.volatility.target_risk_reward);
        Ok((stop, take_profit))
    }

    /// Suggested size for a new trade, or `None` when it would fall below the
    /// venue minimum.
    ///
    /// Fixed-fractional against `stop_loss` (or a volatility-based default),
    /// capped by the Kelly fraction once the symbol has enough closed trades.
    pub async fn calculate_position_size(
        &self,
        symbol: &str,
        market: MarketType,
        side: PositionSide,
        exchange: ExchangeId,
        account_balance: f64,
        stop_loss: Option<f64>,
    ) -> Result<Option<f64>> {
        let symbol = symbol.to_ascii_uppercase();
        let adapter = self.registry.get(exchange)?;
        let entry = adapter.ticker_price(&symbol, market).await?;
        let stop = match stop_loss {
            Some(stop) => stop,
            None => self.default_exits(&symbol, market, side, exchange, entry).await?.0,
        };

        let mut size = fixed_fractional(account_balance, self.limits.max_account_risk_pct, entry, stop)?;

        let closed = self
            .positions
            .find_by_symbol_and_status(&symbol, PositionStatus::Closed)
            .await?;
        if let Some(kelly) = TradeHistory::from_closed(&closed).kelly() {
            let cap = account_balance * kelly / entry;
            if size > cap {
                tracing::debug!(symbol = %symbol, "Kelly {:.3} caps size {:.6} -> {:.6}", kelly, size, cap);
                size = cap;
            }
        }

        let instrument = adapter.instrument(&symbol, market).await?;
        let size = instrument.floor_qty(size);
        if size < instrument.min_qty || size <= 0.0 {
            tracing::info!(symbol = %symbol, "Computed size below venue minimum {}", instrument.min_qty);
            return Ok(None);
        }
        Ok(Some(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::models::{InstrumentInfo, Position};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    struct Fixture {
        gate: RiskGate,
        paper: Arc<PaperExchange>,
        store: Arc<InMemoryStore>,
        tracker: Arc<PortfolioTracker>,
    }

    fn fixture() -> Fixture {
        let paper = Arc::new(PaperExchange::new(ExchangeId::Paper, 10_000.0));
        paper.set_price("BTCUSDT", 100.0);
        let store = Arc::new(InMemoryStore::new());
        let tracker = Arc::new(PortfolioTracker::new());
        let gate = RiskGate::new(
            ExchangeRegistry::new().with(paper.clone()),
            store.clone(),
            tracker.clone(),
            RiskLimits::default(),
            VolatilitySettings::default(),
            Duration::from_secs(60),
        );
        Fixture {
            gate,
            paper,
            store,
            tracker,
        }
    }

    fn long(symbol: &str, size: f64) -> TradeProposal {
        TradeProposal::new(symbol, MarketType::Linear, PositionSide::Long, size)
    }

    async fn open(store: &InMemoryStore, symbol: &str, qty: f64, price: f64) {
        let p = Position::open(
            ExchangeId::Paper,
            MarketType::Linear,
            symbol,
            PositionSide::Long,
            qty,
            price,
            Utc::now(),
        );
        store.save(&p).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_coin_cap() {
        let f = fixture();
        let six = f.gate.validate_trade(&long("BTCUSDT", 6.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(!six.is_accepted());
        assert!(six.reason().unwrap().contains("single-coin"));

        let four = f.gate.validate_trade(&long("BTCUSDT", 4.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert_eq!(four, TradeDecision::Accept);
    }

    #[tokio::test]
    async fn test_below_minimum_after_rounding() {
        let f = fixture();
        f.paper.set_instrument(InstrumentInfo {
            symbol: "BTCUSDT".to_string(),
            tick_size: 0.1,
            qty_step: 0.01,
            min_qty: 0.05,
        });
        let d = f.gate.validate_trade(&long("BTCUSDT", 0.049), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(d.reason().unwrap().contains("below minimum"));
    }

    #[tokio::test]
    async fn test_portfolio_cap_counts_same_exchange_only() {
        let f = fixture();
        f.paper.set_price("ETHUSDT", 100.0);
        open(&f.store, "ETHUSDT", 48.0, 100.0).await;

        // 4800 deployed + 400 > 5000
        let d = f.gate.validate_trade(&long("BTCUSDT", 4.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(d.reason().unwrap().contains("portfolio cap"));
    }

    #[tokio::test]
    async fn test_correlated_positions_block_new_trade() {
        let f = fixture();
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        for sym in ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"] {
            f.paper.set_price(sym, 1.0);
            f.paper.set_closes(sym, rising.clone());
        }
        f.paper.set_price("BTCUSDT", 100.0);
        for sym in ["ETHUSDT", "SOLUSDT", "XRPUSDT"] {
            open(&f.store, sym, 1.0, 1.0).await;
        }

        let d = f.gate.validate_trade(&long("BTCUSDT", 1.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(d.reason().unwrap().contains("correlated"));
    }

    #[tokio::test]
    async fn test_short_history_never_rejects_on_correlation() {
        let f = fixture();
        for sym in ["ETHUSDT", "SOLUSDT", "XRPUSDT"] {
            f.paper.set_price(sym, 1.0);
            f.paper.set_closes(sym, vec![1.0, 2.0, 3.0]);
            open(&f.store, sym, 1.0, 1.0).await;
        }
        f.paper.set_closes("BTCUSDT", vec![1.0, 2.0, 3.0]);

        let d = f.gate.validate_trade(&long("BTCUSDT", 1.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(d.is_accepted());
    }

    #[tokio::test]
    async fn test_circuit_breaker_rejects_everything() {
        let f = fixture();
        f.tracker.observe(10_000.0, Utc::now()).await;
        f.tracker.observe(9_000.0, Utc::now()).await;

        let d = f.gate.validate_trade(&long("BTCUSDT", 1.0), ExchangeId::Paper, 10_000.0).await.unwrap();
        assert!(d.reason().unwrap().contains("circuit breaker"));
    }

    #[tokio::test]
    async fn test_position_size_uses_stop_distance() {
        let f = fixture();
        // 1% of 10k over a $2 stop = 50 units, Kelly not yet applied
        let size = f
            .gate
            .calculate_position_size("BTCUSDT", MarketType::Linear, PositionSide::Long, ExchangeId::Paper, 10_000.0, Some(98.0))
            .await
            .unwrap();
        assert_eq!(size, Some(50.0));
    }

    #[tokio::test]
    async fn test_position_size_none_below_minimum() {
        let f = fixture();
        let size = f
            .gate
            .calculate_position_size("BTCUSDT", MarketType::Linear, PositionSide::Long, ExchangeId::Paper, 0.01, Some(50.0))
            .await
            .unwrap();
        assert_eq!(size, None);
    }

    #[tokio::test]
    async fn test_default_exits_fall_back_to_default_volatility() {
        let f = fixture();
        let (sl, tp) = f
            .gate
            .default_exits("BTCUSDT", MarketType::Linear, PositionSide::Long, ExchangeId::Paper, 100.0)
            .await
            .unwrap();
        // No closes: 2% default volatility is the medium tier
        assert!((sl - 98.0).abs() < 1e-9);
        assert!((tp - 104.0).abs() < 1e-9);
    }
}
