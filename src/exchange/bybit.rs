use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::clock::ServerClock;
use super::http::{BackoffPolicy, RestClient};
use super::signer::{build_query, header_prehash, HmacSigner};
use super::{parse_num, parse_opt, value_to_param, ExchangeAdapter, Params};
use crate::config::ExchangeCredentials;
use crate::models::{
    ExchangeId, InstrumentInfo, MarketType, OrderReport, OrderRequest, OrderSide, OrderStatus,
    OrderType, PositionSide, ReportedPosition,
};
use crate::{Result, TradeError};

const BYBIT_API_BASE: &str = "https://api.bybit.com";
const POSITION_PAGE_LIMIT: usize = 200;

// retCodes: invalid key / sign / timestamp family
const AUTH_CODES: [i64; 4] = [10003, 10004, 10005, 33004];
// Rate limit and server busy
const TRANSIENT_CODES: [i64; 2] = [10006, 10016];
// orderLinkId already used on this account
const DUPLICATE_ORDER_CODE: i64 = 110072;
// Request timestamp outside recv window
const RECV_WINDOW_CODE: i64 = 10002;

/// Bybit v5 unified account: spot and USDT linear perpetuals.
pub struct BybitAdapter {
    api_key: String,
    recv_window: u64,
    signer: HmacSigner,
    http: RestClient,
    clock: ServerClock,
    instruments: DashMap<(String, MarketType), InstrumentInfo>,
}

impl BybitAdapter {
    pub fn new(creds: &ExchangeCredentials, timeout: Duration, time_ttl: Duration) -> Result<Self> {
        let base_url = creds.base_url.as_deref().unwrap_or(BYBIT_API_BASE);
        Ok(Self {
            api_key: creds.api_key.clone(),
            recv_window: creds.recv_window_ms,
            signer: HmacSigner::new(&creds.api_secret)?,
            http: RestClient::new(ExchangeId::Bybit, base_url, timeout, creds.requests_per_second)?,
            clock: ServerClock::new(time_ttl),
            instruments: DashMap::new(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.http = self.http.with_backoff(backoff);
        self
    }

    fn category(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "spot",
            MarketType::Linear => "linear",
        }
    }

    /// Strips the `{retCode, retMsg, result}` envelope.
    fn unwrap_envelope(&self, raw: &str) -> Result<Value> {
        let envelope: Value = serde_json::from_str(raw)
            .map_err(|e| TradeError::malformed(ExchangeId::Bybit, e))?;

        let code = envelope
            .get("retCode")
            .and_then(Value::as_i64)
            .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, "missing retCode"))?;
        let message = envelope
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match code {
            0 => Ok(envelope.get("result").cloned().unwrap_or(Value::Null)),
            RECV_WINDOW_CODE => {
                self.clock.invalidate();
                Err(TradeError::Transient(format!("bybit timestamp rejected: {message}")))
            }
            c if AUTH_CODES.contains(&c) => {
                Err(TradeError::Authentication(format!("bybit {c}: {message}")))
            }
            DUPLICATE_ORDER_CODE => Err(TradeError::DuplicateOrder {
                exchange: ExchangeId::Bybit.to_string(),
                message,
            }),
            c if TRANSIENT_CODES.contains(&c) => {
                Err(TradeError::Transient(format!("bybit {c}: {message}")))
            }
            c => Err(TradeError::ExchangeRejected {
                exchange: ExchangeId::Bybit.to_string(),
                code: c,
                message,
            }),
        }
    }

    async fn call(&self, method: Method, path: &str, params: &Params, signed: bool) -> Result<Value> {
        let raw = self.request(method, path, params, signed).await?;
        self.unwrap_envelope(&raw)
    }

    async fn fetch_server_time(&self) -> Result<i64> {
        let raw = self
            .http
            .send(Method::GET, "/v5/market/time", None, None, Vec::new)
            .await?;
        let result = self.unwrap_envelope(&raw)?;

        if let Some(nanos) = result.get("timeNano").and_then(Value::as_str) {
            let nanos: i64 = nanos
                .parse()
                .map_err(|_| TradeError::malformed(ExchangeId::Bybit, "timeNano"))?;
            return Ok(nanos / 1_000_000);
        }
        let secs = result
            .get("timeSecond")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, "missing server time"))?;
        Ok(secs * 1000)
    }

    fn first_in_list(result: &Value) -> Option<&Value> {
        result.get("list").and_then(Value::as_array)?.first()
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn map_status(raw: &str) -> Result<OrderStatus> {
    match raw {
        "" | "New" | "Created" | "Untriggered" | "Triggered" => Ok(OrderStatus::New),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" | "Rejected" | "Deactivated" | "PartiallyFilledCanceled" => {
            Ok(OrderStatus::Canceled)
        }
        other => Err(TradeError::malformed(
            ExchangeId::Bybit,
            format!("unknown orderStatus {other}"),
        )),
    }
}

/// Reads an order object from `order/create` or `order/realtime`.
fn parse_order_object(order: &Value) -> Result<OrderReport> {
    let order_id = str_field(order, "orderId");
    if order_id.is_empty() {
        return Err(TradeError::malformed(ExchangeId::Bybit, "order without orderId"));
    }
    let link_id = str_field(order, "orderLinkId");
    let executed = match str_field(order, "cumExecQty") {
        "" => 0.0,
        raw => parse_num(ExchangeId::Bybit, "cumExecQty", raw)?,
    };

    Ok(OrderReport {
        exchange_order_id: Some(order_id.to_string()),
        client_order_id: (!link_id.is_empty()).then(|| link_id.to_string()),
        status: map_status(str_field(order, "orderStatus"))?,
        executed_qty: executed,
        avg_price: parse_opt(str_field(order, "avgPrice")),
        cum_quote: parse_opt(str_field(order, "cumExecValue")),
    })
}

/// Reads `position/list`. Zero-size rows are slots, not positions.
pub(crate) fn parse_positions(result: &Value) -> Result<Vec<ReportedPosition>> {
    let list = result
        .get("list")
        .and_then(Value::as_array)
        .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, "position list missing"))?;

    let cursor = str_field(result, "nextPageCursor");
    if !cursor.is_empty() && list.len() >= POSITION_PAGE_LIMIT {
        return Err(TradeError::IncompleteReport {
            exchange: ExchangeId::Bybit.to_string(),
            detail: format!("{} positions with more pages pending", list.len()),
        });
    }

    let mut positions = Vec::with_capacity(list.len());
    for row in list {
        let size = parse_num(ExchangeId::Bybit, "size", str_field(row, "size"))?;
        if size <= 0.0 {
            continue;
        }
        let side = match str_field(row, "side") {
            "Buy" => PositionSide::Long,
            "Sell" => PositionSide::Short,
            other => {
                return Err(TradeError::malformed(
                    ExchangeId::Bybit,
                    format!("position side {other:?} with size {size}"),
                ))
            }
        };
        positions.push(ReportedPosition {
            symbol: str_field(row, "symbol").to_string(),
            market_type: MarketType::Linear,
            side,
            quantity: size,
            entry_price: parse_num(ExchangeId::Bybit, "avgPrice", str_field(row, "avgPrice"))?,
            mark_price: parse_opt(str_field(row, "markPrice")),
            unrealized_pnl: str_field(row, "unrealisedPnl").parse().unwrap_or(0.0),
            leverage: str_field(row, "leverage").parse().unwrap_or(1.0),
        });
    }
    Ok(positions)
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn reconciled_markets(&self) -> Vec<MarketType> {
        vec![MarketType::Linear]
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        self.signer
            .sign_hex(&header_prehash(timestamp, &self.api_key, self.recv_window, payload))
    }

    fn format_symbol(&self, symbol: &str, _market: MarketType) -> String {
        symbol
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | '/'))
            .collect::<String>()
            .to_ascii_uppercase()
    }

    async fn server_time(&self) -> Result<i64> {
        self.clock.now_or_sync(|| self.fetch_server_time()).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &Params,
        signed: bool,
    ) -> Result<String> {
        let (query, body) = if method == Method::GET {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), value_to_param(v)))
                .collect();
            (Some(build_query(&pairs)), None)
        } else {
            let object: Map<String, Value> = params.iter().cloned().collect();
            (None, Some(Value::Object(object).to_string()))
        };

        if !signed {
            return self
                .http
                .send(method, path, query.as_deref(), body.as_deref(), Vec::new)
                .await;
        }

        self.server_time().await?;
        let offset = self.clock.fresh_offset().unwrap_or(0);
        let payload = body.clone().or_else(|| query.clone()).unwrap_or_default();

        self.http
            .send(method, path, query.as_deref(), body.as_deref(), || {
                let ts = ServerClock::local_ms() + offset;
                vec![
                    ("X-BAPI-API-KEY", self.api_key.clone()),
                    ("X-BAPI-TIMESTAMP", ts.to_string()),
                    ("X-BAPI-RECV-WINDOW", self.recv_window.to_string()),
                    ("X-BAPI-SIGN", self.sign(ts, &payload)),
                ]
            })
            .await
    }

    async fn submit_order(&self, request: &OrderRequest, client_order_id: &str) -> Result<String> {
        let mut params: Params = vec![
            ("category".into(), json!(Self::category(request.market_type))),
            (
                "symbol".into(),
                json!(self.format_symbol(&request.symbol, request.market_type)),
            ),
            (
                "side".into(),
                json!(match request.side {
                    OrderSide::Buy => "Buy",
                    OrderSide::Sell => "Sell",
                }),
            ),
            (
                "orderType".into(),
                json!(match request.order_type {
                    OrderType::Market => "Market",
                    OrderType::Limit => "Limit",
                }),
            ),
            ("qty".into(), json!(request.quantity.to_string())),
            ("orderLinkId".into(), json!(client_order_id)),
        ];
        if request.market_type == MarketType::Spot && request.order_type == OrderType::Market {
            params.push(("marketUnit".into(), json!("baseCoin")));
        }
        if let Some(price) = request.price {
            params.push(("price".into(), json!(price.to_string())));
        }
        if let Some(tif) = request.time_in_force {
            params.push(("timeInForce".into(), json!(tif.as_str())));
        }
        if let Some(sl) = request.stop_loss {
            params.push(("stopLoss".into(), json!(sl.to_string())));
        }
        if let Some(tp) = request.take_profit {
            params.push(("takeProfit".into(), json!(tp.to_string())));
        }
        if request.reduce_only && request.market_type == MarketType::Linear {
            params.push(("reduceOnly".into(), json!(true)));
        }

        self.request(Method::POST, "/v5/order/create", &params, true)
            .await
    }

    fn parse_order_response(&self, raw: &str) -> Result<OrderReport> {
        if raw.trim().is_empty() {
            return Err(TradeError::Transient("bybit returned an empty body".to_string()));
        }
        let result = self.unwrap_envelope(raw)?;
        match Self::first_in_list(&result) {
            Some(order) => parse_order_object(order),
            None => parse_order_object(&result),
        }
    }

    async fn query_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        let params: Params = vec![
            ("category".into(), json!(Self::category(market))),
            ("symbol".into(), json!(self.format_symbol(symbol, market))),
            ("orderLinkId".into(), json!(client_order_id)),
        ];

        // Filled market orders leave the realtime book quickly
        for path in ["/v5/order/realtime", "/v5/order/history"] {
            let result = self.call(Method::GET, path, &params, true).await?;
            if let Some(order) = Self::first_in_list(&result) {
                return parse_order_object(order).map(Some);
            }
        }
        Ok(None)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<()> {
        let params: Params = vec![
            ("category".into(), json!(Self::category(market))),
            ("symbol".into(), json!(self.format_symbol(symbol, market))),
            ("orderLinkId".into(), json!(client_order_id)),
        ];
        self.call(Method::POST, "/v5/order/cancel", &params, true)
            .await?;
        Ok(())
    }

    async fn fetch_positions(&self, market: MarketType) -> Result<Vec<ReportedPosition>> {
        if market != MarketType::Linear {
            return Err(TradeError::Validation(
                "bybit positions are only listed for linear contracts".to_string(),
            ));
        }
        let params: Params = vec![
            ("category".into(), json!("linear")),
            ("settleCoin".into(), json!("USDT")),
            ("limit".into(), json!(POSITION_PAGE_LIMIT)),
        ];
        let result = self
            .call(Method::GET, "/v5/position/list", &params, true)
            .await?;
        parse_positions(&result)
    }

    async fn ticker_price(&self, symbol: &str, market: MarketType) -> Result<f64> {
        let params: Params = vec![
            ("category".into(), json!(Self::category(market))),
            ("symbol".into(), json!(self.format_symbol(symbol, market))),
        ];
        let result = self
            .call(Method::GET, "/v5/market/tickers", &params, false)
            .await?;
        let ticker = Self::first_in_list(&result)
            .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, format!("no ticker for {symbol}")))?;
        parse_num(ExchangeId::Bybit, "lastPrice", str_field(ticker, "lastPrice"))
    }

    async fn daily_closes(
        &self,
        symbol: &str,
        market: MarketType,
        limit: usize,
    ) -> Result<Vec<f64>> {
        let params: Params = vec![
            ("category".into(), json!(Self::category(market))),
            ("symbol".into(), json!(self.format_symbol(symbol, market))),
            ("interval".into(), json!("D")),
            ("limit".into(), json!(limit)),
        ];
        let result = self
            .call(Method::GET, "/v5/market/kline", &params, false)
            .await?;
        let rows = result
            .get("list")
            .and_then(Value::as_array)
            .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, "kline list missing"))?;

        // [start, open, high, low, close, volume, turnover], newest first
        let mut closes = rows
            .iter()
            .map(|row| {
                let close = row.get(4).and_then(Value::as_str).unwrap_or_default();
                parse_num(ExchangeId::Bybit, "close", close)
            })
            .collect::<Result<Vec<f64>>>()?;
        closes.reverse();
        Ok(closes)
    }

    async fn instrument(&self, symbol: &str, market: MarketType) -> Result<InstrumentInfo> {
        let symbol = self.format_symbol(symbol, market);
        if let Some(info) = self.instruments.get(&(symbol.clone(), market)) {
            return Ok(info.clone());
        }

        let params: Params = vec![
            ("category".into(), json!(Self::category(market))),
            ("symbol".into(), json!(symbol)),
        ];
        let result = self
            .call(Method::GET, "/v5/market/instruments-info", &params, false)
            .await?;
        let row = Self::first_in_list(&result).ok_or_else(|| {
            TradeError::Validation(format!("bybit does not list {symbol} ({market})"))
        })?;

        let price_filter = row.get("priceFilter").cloned().unwrap_or(Value::Null);
        let lot = row.get("lotSizeFilter").cloned().unwrap_or(Value::Null);
        let step_key = match market {
            MarketType::Spot => "basePrecision",
            MarketType::Linear => "qtyStep",
        };
        let info = InstrumentInfo {
            symbol: symbol.clone(),
            tick_size: parse_num(ExchangeId::Bybit, "tickSize", str_field(&price_filter, "tickSize"))?,
            qty_step: parse_num(ExchangeId::Bybit, step_key, str_field(&lot, step_key))?,
            min_qty: parse_num(ExchangeId::Bybit, "minOrderQty", str_field(&lot, "minOrderQty"))?,
        };

        self.instruments.insert((symbol, market), info.clone());
        Ok(info)
    }

    async fn wallet_balance(&self) -> Result<f64> {
        let params: Params = vec![("accountType".into(), json!("UNIFIED"))];
        let result = self
            .call(Method::GET, "/v5/account/wallet-balance", &params, true)
            .await?;
        let account = Self::first_in_list(&result)
            .ok_or_else(|| TradeError::malformed(ExchangeId::Bybit, "no wallet account"))?;
        parse_num(ExchangeId::Bybit, "totalEquity", str_field(account, "totalEquity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        let creds = ExchangeCredentials {
            api_key: "KEY".to_string(),
            api_secret: "SECRET".to_string(),
            base_url: Some("http://127.0.0.1:9".to_string()),
            recv_window_ms: 5000,
            requests_per_second: 50,
        };
        BybitAdapter::new(&creds, Duration::from_secs(1), Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn test_symbol_format() {
        let a = adapter();
        assert_eq!(a.format_symbol("btc_usdt", MarketType::Linear), "BTCUSDT");
        assert_eq!(a.format_symbol("ETH/USDT", MarketType::Spot), "ETHUSDT");
    }

    #[test]
    fn test_sign_uses_header_prehash() {
        let a = adapter();
        let expected = HmacSigner::new("SECRET")
            .unwrap()
            .sign_hex("1700000000000KEY5000category=linear");
        assert_eq!(a.sign(1_700_000_000_000, "category=linear"), expected);
    }

    #[test]
    fn test_parse_create_response() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"1321003749386327552","orderLinkId":"tc-1"}}"#;
        let report = adapter().parse_order_response(raw).unwrap();
        assert_eq!(report.status, OrderStatus::New);
        assert_eq!(report.client_order_id.as_deref(), Some("tc-1"));
        assert_eq!(report.executed_qty, 0.0);
        assert_eq!(report.avg_price, None);
    }

    #[test]
    fn test_parse_filled_order_from_list() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{
            "orderId":"9","orderLinkId":"tc-2","orderStatus":"Filled",
            "cumExecQty":"0.5","avgPrice":"","cumExecValue":"50.5"}]}}"#;
        let report = adapter().parse_order_response(raw).unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.executed_qty, 0.5);
        assert_eq!(report.avg_price, None);
        assert_eq!(report.cum_quote, Some(50.5));
    }

    #[test]
    fn test_envelope_error_classes() {
        let a = adapter();
        let auth = a.parse_order_response(r#"{"retCode":10003,"retMsg":"invalid api key"}"#);
        assert!(matches!(auth, Err(TradeError::Authentication(_))));

        let busy = a.parse_order_response(r#"{"retCode":10006,"retMsg":"too many visits"}"#);
        assert!(matches!(busy, Err(TradeError::Transient(_))));

        let rejected = a.parse_order_response(r#"{"retCode":110007,"retMsg":"insufficient balance"}"#);
        assert!(matches!(
            rejected,
            Err(TradeError::ExchangeRejected { code: 110007, .. })
        ));

        let dup = a.parse_order_response(r#"{"retCode":110072,"retMsg":"OrderLinkedID is duplicate"}"#);
        assert!(matches!(dup, Err(TradeError::DuplicateOrder { .. })));

        let html = a.parse_order_response("<html>gateway</html>");
        assert!(matches!(html, Err(TradeError::MalformedResponse { .. })));

        assert!(a.parse_order_response("").unwrap_err().is_transient());
    }

    #[test]
    fn test_recv_window_rejection_drops_clock() {
        let a = adapter();
        a.clock.record(ServerClock::local_ms());
        let res = a.parse_order_response(r#"{"retCode":10002,"retMsg":"timestamp"}"#);
        assert!(res.unwrap_err().is_transient());
        assert!(a.clock.fresh_offset().is_none());
    }

    #[test]
    fn test_parse_positions_skips_empty_slots() {
        let result = json!({
            "list": [
                {"symbol":"BTCUSDT","side":"Buy","size":"0.01","avgPrice":"60000",
                 "markPrice":"61000","unrealisedPnl":"10","leverage":"5"},
                {"symbol":"ETHUSDT","side":"","size":"0","avgPrice":"0",
                 "markPrice":"3000","unrealisedPnl":"0","leverage":"10"}
            ],
            "nextPageCursor": ""
        });
        let positions = parse_positions(&result).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].mark_price, Some(61000.0));
        assert_eq!(positions[0].leverage, 5.0);
    }

    #[test]
    fn test_full_page_with_cursor_is_incomplete() {
        let row = json!({"symbol":"BTCUSDT","side":"Sell","size":"1","avgPrice":"1",
                         "markPrice":"1","unrealisedPnl":"0","leverage":"1"});
        let rows = vec![row; POSITION_PAGE_LIMIT];
        let result = json!({ "list": rows, "nextPageCursor": "page2" });
        assert!(matches!(
            parse_positions(&result),
            Err(TradeError::IncompleteReport { .. })
        ));
    }
}
