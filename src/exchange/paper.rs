use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::clock::ServerClock;
use super::signer::HmacSigner;
use super::{ExchangeAdapter, Params};
use crate::models::{
    ExchangeId, InstrumentInfo, MarketType, OrderReport, OrderRequest, OrderSide, OrderStatus,
    OrderType, PositionSide, ReportedPosition,
};
use crate::{Result, TradeError};

/// Scripted failure for the next `submit_order` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperFault {
    /// 200 with nothing in it.
    EmptyBody,
    Timeout,
    /// A body that is not the order schema.
    Malformed,
    Auth,
    /// Fills, but the report leaves out `avgPrice`.
    OmitAvgPrice,
    /// Fills, but leaves out both `avgPrice` and `cumQuote`.
    OmitAvgAndQuote,
    /// Fills, but the ack still says NEW with nothing executed.
    AckPending,
}

const PAPER_SECRET: &str = "paper-secret";

#[derive(Default)]
struct PaperState {
    prices: HashMap<String, f64>,
    closes: HashMap<String, Vec<f64>>,
    instruments: HashMap<String, InstrumentInfo>,
    positions: HashMap<(String, PositionSide), ReportedPosition>,
    orders: HashMap<String, Value>,
    faults: VecDeque<PaperFault>,
    failing_prices: HashSet<String>,
    fail_positions: bool,
    fail_queries: bool,
    balance: f64,
    submit_calls: u32,
    next_order_id: u64,
}

/// In-process venue: fills MARKET orders at the configured ticker price and
/// nets linear fills into a one-way position book.
pub struct PaperExchange {
    id: ExchangeId,
    signer: Option<HmacSigner>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(id: ExchangeId, balance: f64) -> Self {
        Self {
            id,
            signer: HmacSigner::new(PAPER_SECRET).ok(),
            state: Mutex::new(PaperState {
                balance,
                next_order_id: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_ascii_uppercase(), price);
    }

    pub fn set_closes(&self, symbol: &str, closes: Vec<f64>) {
        self.state().closes.insert(symbol.to_ascii_uppercase(), closes);
    }

    pub fn set_instrument(&self, info: InstrumentInfo) {
        self.state()
            .instruments
            .insert(info.symbol.to_ascii_uppercase(), info);
    }

    pub fn set_balance(&self, balance: f64) {
        self.state().balance = balance;
    }

    /// Places a position on the venue as if it had been opened elsewhere.
    pub fn set_reported_position(&self, position: ReportedPosition) {
        self.state()
            .positions
            .insert((position.symbol.to_ascii_uppercase(), position.side), position);
    }

    pub fn remove_reported_position(&self, symbol: &str, side: PositionSide) {
        self.state()
            .positions
            .remove(&(symbol.to_ascii_uppercase(), side));
    }

    pub fn reported_positions(&self) -> Vec<ReportedPosition> {
        self.state().positions.values().cloned().collect()
    }

    pub fn push_fault(&self, fault: PaperFault) {
        self.state().faults.push_back(fault);
    }

    pub fn set_fail_positions(&self, fail: bool) {
        self.state().fail_positions = fail;
    }

    /// Makes `query_order` fail as if the venue were unreachable.
    pub fn set_query_failure(&self, fail: bool) {
        self.state().fail_queries = fail;
    }

    pub fn set_price_failure(&self, symbol: &str, fail: bool) {
        let symbol = symbol.to_ascii_uppercase();
        let mut state = self.state();
        if fail {
            state.failing_prices.insert(symbol);
        } else {
            state.failing_prices.remove(&symbol);
        }
    }

    pub fn submit_calls(&self) -> u32 {
        self.state().submit_calls
    }

    pub fn balance(&self) -> f64 {
        self.state().balance
    }

    fn net_fill(state: &mut PaperState, symbol: &str, side: OrderSide, qty: f64, price: f64, reduce_only: bool) {
        let opposite_key = (symbol.to_string(), PositionSide::opened_by(side).opposite());
        let mut remaining = qty;

        if let Some(existing) = state.positions.get_mut(&opposite_key) {
            let closed = remaining.min(existing.quantity);
            let pnl = existing.side.sign() * (price - existing.entry_price) * closed;
            existing.quantity -= closed;
            remaining -= closed;
            state.balance += pnl;
            if existing.quantity <= 1e-12 {
                state.positions.remove(&opposite_key);
            }
        }

        if remaining <= 1e-12 || reduce_only {
            return;
        }

        let side = PositionSide::opened_by(side);
        let entry = state
            .positions
            .entry((symbol.to_string(), side))
            .or_insert_with(|| ReportedPosition {
                symbol: symbol.to_string(),
                market_type: MarketType::Linear,
                side,
                quantity: 0.0,
                entry_price: price,
                mark_price: None,
                unrealized_pnl: 0.0,
                leverage: 1.0,
            });
        let total = entry.quantity + remaining;
        entry.entry_price = (entry.entry_price * entry.quantity + price * remaining) / total;
        entry.quantity = total;
    }
}

fn order_json(
    order_id: &str,
    client_order_id: &str,
    status: OrderStatus,
    executed: f64,
    avg_price: Option<f64>,
    cum_quote: Option<f64>,
) -> Value {
    let mut body = json!({
        "orderId": order_id,
        "clientOrderId": client_order_id,
        "status": status.as_str(),
        "executedQty": executed.to_string(),
    });
    if let Some(avg) = avg_price {
        body["avgPrice"] = json!(avg.to_string());
    }
    if let Some(quote) = cum_quote {
        body["cumQuote"] = json!(quote.to_string());
    }
    body
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn id(&self) -> ExchangeId {
        self.id
    }

    fn reconciled_markets(&self) -> Vec<MarketType> {
        vec![MarketType::Linear]
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        self.signer
            .as_ref()
            .map(|s| s.sign_hex(&format!("{timestamp}{payload}")))
            .unwrap_or_default()
    }

    fn format_symbol(&self, symbol: &str, _market: MarketType) -> String {
        symbol.replace('_', "").to_ascii_uppercase()
    }

    async fn server_time(&self) -> Result<i64> {
        Ok(ServerClock::local_ms())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        _params: &Params,
        _signed: bool,
    ) -> Result<String> {
        Err(TradeError::Validation(format!(
            "paper exchange has no REST surface ({method} {path})"
        )))
    }

    async fn submit_order(&self, request: &OrderRequest, client_order_id: &str) -> Result<String> {
        let symbol = self.format_symbol(&request.symbol, request.market_type);
        let mut state = self.state();
        state.submit_calls += 1;

        let fault = state.faults.pop_front();
        match fault {
            Some(PaperFault::EmptyBody) => return Ok(String::new()),
            Some(PaperFault::Timeout) => {
                return Err(TradeError::Transient("paper: request timed out".to_string()))
            }
            Some(PaperFault::Malformed) => return Ok("<html>502 Bad Gateway</html>".to_string()),
            Some(PaperFault::Auth) => {
                return Err(TradeError::Authentication("paper: invalid api key".to_string()))
            }
            _ => {}
        }

        // Venue-side de-duplication by client order id
        if let Some(existing) = state.orders.get(client_order_id) {
            return Ok(existing.to_string());
        }

        let order_id = state.next_order_id.to_string();
        state.next_order_id += 1;

        let ack_pending = fault == Some(PaperFault::AckPending);
        let body = match request.order_type {
            OrderType::Limit => order_json(&order_id, client_order_id, OrderStatus::New, 0.0, None, None),
            OrderType::Market => {
                let price = *state.prices.get(&symbol).ok_or_else(|| {
                    TradeError::ExchangeRejected {
                        exchange: self.id.to_string(),
                        code: 404,
                        message: format!("no market for {symbol}"),
                    }
                })?;
                if request.market_type == MarketType::Linear {
                    Self::net_fill(
                        &mut state,
                        &symbol,
                        request.side,
                        request.quantity,
                        price,
                        request.reduce_only,
                    );
                }
                let quote = price * request.quantity;
                let (avg, cum) = match fault {
                    Some(PaperFault::OmitAvgPrice) => (None, Some(quote)),
                    Some(PaperFault::OmitAvgAndQuote) => (None, None),
                    _ => (Some(price), Some(quote)),
                };
                order_json(
                    &order_id,
                    client_order_id,
                    OrderStatus::Filled,
                    request.quantity,
                    avg,
                    cum,
                )
            }
        };

        state.orders.insert(client_order_id.to_string(), body.clone());
        if ack_pending {
            let ack = order_json(&order_id, client_order_id, OrderStatus::New, 0.0, None, None);
            return Ok(ack.to_string());
        }
        Ok(body.to_string())
    }

    fn parse_order_response(&self, raw: &str) -> Result<OrderReport> {
        if raw.trim().is_empty() {
            return Err(TradeError::Transient("paper returned an empty body".to_string()));
        }
        let body: Value =
            serde_json::from_str(raw).map_err(|e| TradeError::malformed(self.id, e))?;

        let field = |key: &str| body.get(key).and_then(Value::as_str);
        let order_id = field("orderId")
            .ok_or_else(|| TradeError::malformed(self.id, "missing orderId"))?;
        let status = field("status")
            .ok_or_else(|| TradeError::malformed(self.id, "missing status"))?
            .parse::<OrderStatus>()
            .map_err(|e| TradeError::malformed(self.id, e))?;
        let executed = field("executedQty")
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| TradeError::malformed(self.id, "missing executedQty"))?;

        Ok(OrderReport {
            exchange_order_id: Some(order_id.to_string()),
            client_order_id: field("clientOrderId").map(str::to_string),
            status,
            executed_qty: executed,
            avg_price: field("avgPrice").and_then(|s| s.parse().ok()),
            cum_quote: field("cumQuote").and_then(|s| s.parse().ok()),
        })
    }

    async fn query_order(
        &self,
        _symbol: &str,
        _market: MarketType,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        let state = self.state();
        if state.fail_queries {
            return Err(TradeError::Transient("paper: order query unavailable".to_string()));
        }
        let body = state.orders.get(client_order_id).cloned();
        drop(state);
        match body {
            Some(body) => self.parse_order_response(&body.to_string()).map(Some),
            None => Ok(None),
        }
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        _market: MarketType,
        client_order_id: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let order = state.orders.get_mut(client_order_id).ok_or_else(|| {
            TradeError::ExchangeRejected {
                exchange: self.id.to_string(),
                code: 404,
                message: format!("unknown order {client_order_id}"),
            }
        })?;
        if order["status"] == OrderStatus::Filled.as_str() {
            return Err(TradeError::ExchangeRejected {
                exchange: self.id.to_string(),
                code: 409,
                message: format!("order {client_order_id} already filled"),
            });
        }
        order["status"] = json!(OrderStatus::Canceled.as_str());
        Ok(())
    }

    async fn fetch_positions(&self, market: MarketType) -> Result<Vec<ReportedPosition>> {
        let state = self.state();
        if state.fail_positions {
            return Err(TradeError::Transient("paper: position list unavailable".to_string()));
        }
        if market != MarketType::Linear {
            return Ok(Vec::new());
        }
        let mut positions: Vec<ReportedPosition> = state
            .positions
            .values()
            .map(|p| {
                let mut p = p.clone();
                if let Some(mark) = state.prices.get(&p.symbol) {
                    p.mark_price = Some(*mark);
                    p.unrealized_pnl = p.side.sign() * (mark - p.entry_price) * p.quantity;
                }
                p
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn ticker_price(&self, symbol: &str, market: MarketType) -> Result<f64> {
        let symbol = self.format_symbol(symbol, market);
        let state = self.state();
        if state.failing_prices.contains(&symbol) {
            return Err(TradeError::Transient(format!("paper: ticker {symbol} unavailable")));
        }
        state.prices.get(&symbol).copied().ok_or_else(|| {
            TradeError::ExchangeRejected {
                exchange: self.id.to_string(),
                code: 404,
                message: format!("no ticker for {symbol}"),
            }
        })
    }

    async fn daily_closes(
        &self,
        symbol: &str,
        market: MarketType,
        limit: usize,
    ) -> Result<Vec<f64>> {
        let symbol = self.format_symbol(symbol, market);
        let closes = self.state().closes.get(&symbol).cloned().unwrap_or_default();
        let skip = closes.len().saturating_sub(limit);
        Ok(closes.into_iter().skip(skip).collect())
    }

    async fn instrument(&self, symbol: &str, market: MarketType) -> Result<InstrumentInfo> {
        let symbol = self.format_symbol(symbol, market);
        Ok(self
            .state()
            .instruments
            .get(&symbol)
            .cloned()
            .unwrap_or(InstrumentInfo {
                symbol,
                tick_size: 0.01,
                qty_step: 0.001,
                min_qty: 0.001,
            }))
    }

    async fn wallet_balance(&self) -> Result<f64> {
        Ok(self.state().balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperExchange {
        let venue = PaperExchange::new(ExchangeId::Paper, 10_000.0);
        venue.set_price("BTCUSDT", 100.0);
        venue
    }

    #[tokio::test]
    async fn test_market_order_fills_at_ticker() {
        let venue = venue();
        let req = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, 2.0);
        let raw = venue.submit_order(&req, "tc-1").await.unwrap();
        let report = venue.parse_order_response(&raw).unwrap();

        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.avg_price, Some(100.0));
        assert_eq!(report.cum_quote, Some(200.0));

        let positions = venue.fetch_positions(MarketType::Linear).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].quantity, 2.0);
    }

    #[tokio::test]
    async fn test_opposite_fill_nets_and_books_pnl() {
        let venue = venue();
        let buy = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, 2.0);
        venue.submit_order(&buy, "tc-1").await.unwrap();

        venue.set_price("BTCUSDT", 110.0);
        let sell = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Sell, 2.0)
            .reduce_only();
        venue.submit_order(&sell, "tc-2").await.unwrap();

        assert!(venue.fetch_positions(MarketType::Linear).await.unwrap().is_empty());
        assert_eq!(venue.balance(), 10_020.0);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_does_not_refill() {
        let venue = venue();
        let req = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, 1.0);
        venue.submit_order(&req, "tc-dup").await.unwrap();
        venue.submit_order(&req, "tc-dup").await.unwrap();

        let positions = venue.fetch_positions(MarketType::Linear).await.unwrap();
        assert_eq!(positions[0].quantity, 1.0);
        assert_eq!(venue.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let venue = venue();
        venue.push_fault(PaperFault::EmptyBody);
        venue.push_fault(PaperFault::Timeout);
        let req = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, 1.0);

        assert_eq!(venue.submit_order(&req, "a").await.unwrap(), "");
        assert!(venue.submit_order(&req, "a").await.unwrap_err().is_transient());
        assert!(venue.submit_order(&req, "a").await.is_ok());
    }

    #[tokio::test]
    async fn test_pending_ack_is_filled_on_query() {
        let venue = venue();
        venue.push_fault(PaperFault::AckPending);
        let req = OrderRequest::market("BTCUSDT", MarketType::Linear, OrderSide::Buy, 1.0);
        let ack = venue.parse_order_response(&venue.submit_order(&req, "tc-p").await.unwrap()).unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(ack.executed_qty, 0.0);

        venue.set_query_failure(true);
        assert!(venue.query_order("BTCUSDT", MarketType::Linear, "tc-p").await.unwrap_err().is_transient());

        venue.set_query_failure(false);
        let report = venue
            .query_order("BTCUSDT", MarketType::Linear, "tc-p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.executed_qty, 1.0);
    }

    #[test]
    fn test_signature_is_hmac_of_timestamp_and_payload() {
        let venue = venue();
        let expected = HmacSigner::new(PAPER_SECRET).unwrap().sign_hex("1700000000000a=1");

        let sig = venue.sign(1_700_000_000_000, "a=1");
        assert_eq!(sig, expected);
        assert_eq!(sig.len(), 64);
        assert_ne!(sig, venue.sign(1_700_000_000_001, "a=1"));
    }

    #[tokio::test]
    async fn test_limit_order_rests_and_cancels() {
        let venue = venue();
        let req = OrderRequest::limit("BTCUSDT", MarketType::Linear, OrderSide::Buy, 1.0, 90.0);
        venue.submit_order(&req, "tc-l").await.unwrap();
        venue
            .cancel_order("BTCUSDT", MarketType::Linear, "tc-l")
            .await
            .unwrap();

        let report = venue
            .query_order("BTCUSDT", MarketType::Linear, "tc-l")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, OrderStatus::Canceled);
    }
}
