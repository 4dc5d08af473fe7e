use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TradeError;

/// Venue identifier; one adapter per variant lives in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeId {
    Bybit,
    Mexc,
    Paper,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Bybit => "BYBIT",
            ExchangeId::Mexc => "MEXC",
            ExchangeId::Paper => "PAPER",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BYBIT" => Ok(ExchangeId::Bybit),
            "MEXC" => Ok(ExchangeId::Mexc),
            "PAPER" => Ok(ExchangeId::Paper),
            other => Err(TradeError::UnknownExchange(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketType {
    Spot,
    Linear,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::Linear => "LINEAR",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPOT" => Ok(MarketType::Spot),
            "LINEAR" => Ok(MarketType::Linear),
            other => Err(TradeError::Validation(format!("unknown market type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl FromStr for OrderSide {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(TradeError::Validation(format!("unknown order side {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

impl FromStr for OrderType {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            other => Err(TradeError::Store(format!("invalid order type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

impl FromStr for OrderStatus {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELED" => Ok(OrderStatus::Canceled),
            other => Err(TradeError::Store(format!("invalid order status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side a fresh position takes when an order of `side` opens it.
    pub fn opened_by(side: OrderSide) -> PositionSide {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    /// Order side that reduces a position of this side.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl FromStr for PositionSide {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(PositionSide::Long),
            "SHORT" => Ok(PositionSide::Short),
            other => Err(TradeError::Store(format!("invalid position side {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => Err(TradeError::Store(format!("invalid position status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    NotFoundOnExchange,
    Manual,
    OffsetByFill,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::NotFoundOnExchange => "NOT_FOUND_ON_EXCHANGE",
            ExitReason::Manual => "MANUAL",
            ExitReason::OffsetByFill => "OFFSET_BY_FILL",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOP_LOSS" => Ok(ExitReason::StopLoss),
            "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
            "TRAILING_STOP" => Ok(ExitReason::TrailingStop),
            "NOT_FOUND_ON_EXCHANGE" => Ok(ExitReason::NotFoundOnExchange),
            "MANUAL" => Ok(ExitReason::Manual),
            "OFFSET_BY_FILL" => Ok(ExitReason::OffsetByFill),
            other => Err(TradeError::Store(format!("invalid exit reason {other}"))),
        }
    }
}

/// What a strategy asks the order engine to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub market_type: MarketType,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub strategy_tag: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, market_type: MarketType, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            market_type,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            client_order_id: None,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
            strategy_tag: None,
        }
    }

    pub fn limit(
        symbol: &str,
        market_type: MarketType,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, market_type, side, quantity)
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.strategy_tag = Some(tag.to_string());
        self
    }
}

/// Venue answer after translation, before it becomes a canonical [`Order`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
    pub cum_quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub exchange_order_id: Option<String>,
    pub client_order_id: String,
    pub symbol: String,
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub executed_qty: f64,
    pub avg_fill_price: Option<f64>,
    pub status: OrderStatus,
    pub strategy_tag: Option<String>,
    /// Filled, but no trustworthy fill price could be established.
    pub price_incomplete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Uniqueness key for OPEN positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
    pub side: PositionSide,
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.exchange,
            self.market_type,
            self.symbol,
            self.side.as_str()
        )
    }
}

/// Figures attached to a position when it closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub fees: f64,
    pub net_profit: f64,
    pub return_pct: f64,
    pub risk_reward: Option<f64>,
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub sharpe: Option<f64>,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    /// Set exactly once, when the position closes.
    pub realized_pnl: Option<f64>,
    /// PnL booked by partial reductions while still open.
    pub partial_realized_pnl: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub secure_profit_applied: bool,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub leverage: f64,
    pub status: PositionStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub entry_order_ids: Vec<Uuid>,
    pub exit_order_ids: Vec<Uuid>,
    pub stats: Option<TradeStats>,
    /// Client order id of an exit sent but not yet seen filled.
    #[serde(default)]
    pub pending_exit_client_id: Option<String>,
    /// Last local fill that changed quantity or entry.
    #[serde(default)]
    pub last_fill_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Fresh OPEN position at `entry_price`.
    pub fn open(
        exchange: ExchangeId,
        market_type: MarketType,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_ascii_uppercase(),
            exchange,
            market_type,
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            realized_pnl: None,
            partial_realized_pnl: 0.0,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_price: None,
            secure_profit_applied: false,
            highest_price: entry_price,
            lowest_price: entry_price,
            leverage: 1.0,
            status: PositionStatus::Open,
            open_time: now,
            close_time: None,
            exit_price: None,
            exit_reason: None,
            entry_order_ids: Vec::new(),
            exit_order_ids: Vec::new(),
            stats: None,
            pending_exit_client_id: None,
            last_fill_at: Some(now),
        }
    }

    /// Position discovered on a venue with no local counterpart.
    pub fn from_report(exchange: ExchangeId, report: &ReportedPosition, now: DateTime<Utc>) -> Self {
        let mut position = Position::open(
            exchange,
            report.market_type,
            &report.symbol,
            report.side,
            report.quantity,
            report.entry_price,
            now,
        );
        position.last_fill_at = None;
        position.merge_report(report);
        position
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            exchange: self.exchange,
            market_type: self.market_type,
            symbol: self.symbol.clone(),
            side: self.side,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Last known price, falling back to entry before the first mark.
    pub fn mark_price(&self) -> f64 {
        if self.current_price > 0.0 {
            self.current_price
        } else {
            self.entry_price
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.mark_price()
    }

    /// Signed PnL of closing `quantity` at `price`.
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * quantity
    }

    /// Favourable move relative to entry, as a fraction.
    pub fn profit_fraction(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }

    /// Reprices the position and widens its price extremes.
    pub fn mark_to_market(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price, self.quantity);
        self.unrealized_pnl_pct = self.profit_fraction(price) * 100.0;
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price || self.lowest_price <= 0.0 {
            self.lowest_price = price;
        }
    }

    /// Copies venue-reported fields onto the local record.
    pub fn merge_report(&mut self, report: &ReportedPosition) {
        self.quantity = report.quantity;
        if report.entry_price > 0.0 {
            self.entry_price = report.entry_price;
        }
        self.unrealized_pnl = report.unrealized_pnl;
        self.apply_report_marks(report);
    }

    /// Takes leverage and mark from the venue but keeps local size and entry,
    /// for a record a local fill has touched since the report was taken.
    pub fn merge_marks(&mut self, report: &ReportedPosition) {
        if let Some(mark) = report.mark_price.filter(|p| *p > 0.0) {
            self.unrealized_pnl = self.pnl_at(mark, self.quantity);
        }
        self.apply_report_marks(report);
    }

    fn apply_report_marks(&mut self, report: &ReportedPosition) {
        if report.leverage > 0.0 {
            self.leverage = report.leverage;
        }
        if let Some(mark) = report.mark_price.filter(|p| *p > 0.0) {
            self.current_price = mark;
            self.unrealized_pnl_pct = self.profit_fraction(mark) * 100.0;
            self.highest_price = self.highest_price.max(mark);
            self.lowest_price = if self.lowest_price > 0.0 {
                self.lowest_price.min(mark)
            } else {
                mark
            };
        }
    }
}

/// A position as a venue reports it, already in canonical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedPosition {
    pub symbol: String,
    pub market_type: MarketType,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

impl ReportedPosition {
    pub fn key(&self, exchange: ExchangeId) -> PositionKey {
        PositionKey {
            exchange,
            market_type: self.market_type,
            symbol: self.symbol.clone(),
            side: self.side,
        }
    }
}

/// Lot-size and tick metadata for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
}

impl InstrumentInfo {
    pub fn floor_qty(&self, qty: f64) -> f64 {
        snap(qty, self.qty_step, f64::floor)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        snap(price, self.tick_size, f64::round)
    }

    pub fn ceil_price(&self, price: f64) -> f64 {
        snap(price, self.tick_size, f64::ceil)
    }

    pub fn floor_price(&self, price: f64) -> f64 {
        snap(price, self.tick_size, f64::floor)
    }
}

// Epsilon keeps 0.3 / 0.1 from flooring to 2 steps.
fn snap(value: f64, step: f64, op: fn(f64) -> f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let units = value / step;
    let nearest = units.round();
    let whole = if (units - nearest).abs() < 1e-9 { nearest } else { op(units) };
    let snapped = whole * step;
    let decimals = (-step.log10()).ceil().max(0.0) as i32;
    let scale = 10f64.powi(decimals);
    (snapped * scale).round() / scale
}
