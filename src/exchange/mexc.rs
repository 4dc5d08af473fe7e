use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;

use super::clock::ServerClock;
use super::http::{BackoffPolicy, RestClient};
use super::signer::{build_query, HmacSigner};
use super::{value_to_param, ExchangeAdapter, Params};
use crate::config::ExchangeCredentials;
use crate::models::{
    ExchangeId, InstrumentInfo, MarketType, OrderReport, OrderRequest, OrderSide, OrderStatus,
    OrderType, PositionSide, ReportedPosition,
};
use crate::{Result, TradeError};

const MEXC_CONTRACT_BASE: &str = "https://contract.mexc.com";
const QUOTE_ASSETS: [&str; 3] = ["USDT", "USDC", "USD"];

const AUTH_CODES: [i64; 3] = [401, 402, 602];
const TRANSIENT_CODES: [i64; 2] = [510, 9999];

/// Instrument metadata plus the contract multiplier. MEXC sizes orders and
/// positions in contracts; everything past this adapter uses base units.
#[derive(Debug, Clone)]
struct ContractSpec {
    info: InstrumentInfo,
    contract_size: f64,
}

/// MEXC USDT-margined perpetual contracts.
pub struct MexcAdapter {
    api_key: String,
    recv_window: u64,
    signer: HmacSigner,
    http: RestClient,
    clock: ServerClock,
    contracts: DashMap<String, ContractSpec>,
}

impl MexcAdapter {
    pub fn new(creds: &ExchangeCredentials, timeout: Duration, time_ttl: Duration) -> Result<Self> {
        let base_url = creds.base_url.as_deref().unwrap_or(MEXC_CONTRACT_BASE);
        Ok(Self {
            api_key: creds.api_key.clone(),
            recv_window: creds.recv_window_ms,
            signer: HmacSigner::new(&creds.api_secret)?,
            http: RestClient::new(ExchangeId::Mexc, base_url, timeout, creds.requests_per_second)?,
            clock: ServerClock::new(time_ttl),
            contracts: DashMap::new(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.http = self.http.with_backoff(backoff);
        self
    }

    fn ensure_linear(market: MarketType) -> Result<()> {
        match market {
            MarketType::Linear => Ok(()),
            MarketType::Spot => Err(TradeError::Validation(
                "mexc adapter only trades linear contracts".to_string(),
            )),
        }
    }

    /// `BTC_USDT` -> `BTCUSDT`.
    fn canonical_symbol(venue_symbol: &str) -> String {
        venue_symbol.replace('_', "")
    }

    /// Strips the `{success, code, data}` envelope.
    fn unwrap_envelope(&self, raw: &str) -> Result<Value> {
        let envelope: Value =
            serde_json::from_str(raw).map_err(|e| TradeError::malformed(ExchangeId::Mexc, e))?;

        let success = envelope.get("success").and_then(Value::as_bool);
        let code = envelope.get("code").and_then(Value::as_i64);
        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match (success, code) {
            (Some(true), _) | (None, Some(0)) => {
                Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
            }
            (_, Some(c)) if AUTH_CODES.contains(&c) => {
                Err(TradeError::Authentication(format!("mexc {c}: {message}")))
            }
            (_, Some(c)) if TRANSIENT_CODES.contains(&c) => {
                Err(TradeError::Transient(format!("mexc {c}: {message}")))
            }
            (_, Some(_)) if is_duplicate_oid(&message) => Err(TradeError::DuplicateOrder {
                exchange: ExchangeId::Mexc.to_string(),
                message,
            }),
            (_, Some(c)) => Err(TradeError::ExchangeRejected {
                exchange: ExchangeId::Mexc.to_string(),
                code: c,
                message,
            }),
            (_, None) => Err(TradeError::malformed(ExchangeId::Mexc, "missing success/code")),
        }
    }

    async fn call(&self, method: Method, path: &str, params: &Params, signed: bool) -> Result<Value> {
        let raw = self.request(method, path, params, signed).await?;
        self.unwrap_envelope(&raw)
    }

    async fn fetch_server_time(&self) -> Result<i64> {
        let raw = self
            .http
            .send(Method::GET, "/api/v1/contract/ping", None, None, Vec::new)
            .await?;
        self.unwrap_envelope(&raw)?
            .as_i64()
            .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "ping without timestamp"))
    }

    async fn contract(&self, symbol: &str) -> Result<ContractSpec> {
        let venue_symbol = self.format_symbol(symbol, MarketType::Linear);
        if let Some(spec) = self.contracts.get(&venue_symbol) {
            return Ok(spec.clone());
        }

        let params: Params = vec![("symbol".into(), json!(venue_symbol))];
        let data = self
            .call(Method::GET, "/api/v1/contract/detail", &params, false)
            .await?;

        let contract_size = num_field(&data, "contractSize")?;
        let spec = ContractSpec {
            info: InstrumentInfo {
                symbol: Self::canonical_symbol(&venue_symbol),
                tick_size: num_field(&data, "priceUnit")?,
                qty_step: num_field(&data, "volUnit")? * contract_size,
                min_qty: num_field(&data, "minVol")? * contract_size,
            },
            contract_size,
        };
        self.contracts.insert(venue_symbol, spec.clone());
        Ok(spec)
    }

    fn contract_size_for(&self, venue_symbol: &str) -> Result<f64> {
        self.contracts
            .get(venue_symbol)
            .map(|spec| spec.contract_size)
            .ok_or_else(|| {
                TradeError::malformed(
                    ExchangeId::Mexc,
                    format!("contract size unknown for {venue_symbol}"),
                )
            })
    }

    fn parse_order_data(&self, order: &Value) -> Result<OrderReport> {
        let order_id = match order.get("orderId") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(TradeError::malformed(ExchangeId::Mexc, "order without orderId")),
        };
        let symbol = order.get("symbol").and_then(Value::as_str).unwrap_or_default();
        let size = self.contract_size_for(symbol)?;
        let deal_vol = order.get("dealVol").and_then(Value::as_f64).unwrap_or(0.0);

        let status = match order.get("state").and_then(Value::as_i64) {
            Some(1) | Some(2) if deal_vol > 0.0 => OrderStatus::PartiallyFilled,
            Some(1) | Some(2) => OrderStatus::New,
            Some(3) => OrderStatus::Filled,
            Some(4) | Some(5) => OrderStatus::Canceled,
            other => {
                return Err(TradeError::malformed(
                    ExchangeId::Mexc,
                    format!("unknown order state {other:?}"),
                ))
            }
        };

        Ok(OrderReport {
            exchange_order_id: Some(order_id),
            client_order_id: order
                .get("externalOid")
                .and_then(Value::as_str)
                .map(str::to_string),
            status,
            executed_qty: deal_vol * size,
            avg_price: order
                .get("dealAvgPrice")
                .and_then(Value::as_f64)
                .filter(|p| *p > 0.0),
            cum_quote: None,
        })
    }
}

fn num_field(v: &Value, key: &str) -> Result<f64> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, format!("{key} missing or invalid")))
}

/// MEXC has no stable code for a reused `externalOid`; only the message says so.
fn is_duplicate_oid(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    (message.contains("duplicate") || message.contains("repeat"))
        && (message.contains("externaloid") || message.contains("order"))
}

/// Order side code: 1 open long, 2 close short, 3 open short, 4 close long.
fn side_code(side: OrderSide, reduce_only: bool) -> i64 {
    match (side, reduce_only) {
        (OrderSide::Buy, false) => 1,
        (OrderSide::Buy, true) => 2,
        (OrderSide::Sell, false) => 3,
        (OrderSide::Sell, true) => 4,
    }
}

#[async_trait]
impl ExchangeAdapter for MexcAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Mexc
    }

    fn reconciled_markets(&self) -> Vec<MarketType> {
        vec![MarketType::Linear]
    }

    fn sign(&self, _timestamp: i64, payload: &str) -> String {
        // timestamp is already part of the signed query string
        self.signer.sign_hex(payload)
    }

    fn format_symbol(&self, symbol: &str, _market: MarketType) -> String {
        let upper = symbol.to_ascii_uppercase().replace(['-', '/'], "_");
        if upper.contains('_') {
            return upper;
        }
        for quote in QUOTE_ASSETS {
            if let Some(base) = upper.strip_suffix(quote) {
                if !base.is_empty() {
                    return format!("{base}_{quote}");
                }
            }
        }
        upper
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
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), value_to_param(v)))
            .collect();

        if !signed {
            let query = build_query(&pairs);
            return self
                .http
                .send(method, path, Some(&query), None, Vec::new)
                .await;
        }

        let ts = self.server_time().await?;
        pairs.push(("timestamp".to_string(), ts.to_string()));
        pairs.push(("recvWindow".to_string(), self.recv_window.to_string()));
        let query = build_query(&pairs);
        let signed_query = format!("{}&signature={}", query, self.sign(ts, &query));

        self.http
            .send(method, path, Some(&signed_query), None, || {
                vec![("ApiKey", self.api_key.clone())]
            })
            .await
    }

    async fn submit_order(&self, request: &OrderRequest, client_order_id: &str) -> Result<String> {
        Self::ensure_linear(request.market_type)?;
        let spec = self.contract(&request.symbol).await?;
        let vol = (request.quantity / spec.contract_size).round();
        if vol < 1.0 {
            return Err(TradeError::Validation(format!(
                "{} {} is below one contract ({})",
                request.symbol, request.quantity, spec.contract_size
            )));
        }

        let mut params: Params = vec![
            (
                "symbol".into(),
                json!(self.format_symbol(&request.symbol, MarketType::Linear)),
            ),
            ("price".into(), json!(request.price.unwrap_or(0.0))),
            ("vol".into(), json!(vol)),
            ("side".into(), json!(side_code(request.side, request.reduce_only))),
            (
                "type".into(),
                json!(match request.order_type {
                    OrderType::Market => 5,
                    OrderType::Limit => 1,
                }),
            ),
            ("openType".into(), json!(2)),
            ("externalOid".into(), json!(client_order_id)),
        ];
        if let Some(sl) = request.stop_loss {
            params.push(("stopLossPrice".into(), json!(sl)));
        }
        if let Some(tp) = request.take_profit {
            params.push(("takeProfitPrice".into(), json!(tp)));
        }

        self.request(Method::POST, "/api/v1/private/order/submit", &params, true)
            .await
    }

    fn parse_order_response(&self, raw: &str) -> Result<OrderReport> {
        if raw.trim().is_empty() {
            return Err(TradeError::Transient("mexc returned an empty body".to_string()));
        }
        match self.unwrap_envelope(raw)? {
            // submit answers with the bare order id
            Value::String(id) => Ok(OrderReport {
                exchange_order_id: Some(id),
                client_order_id: None,
                status: OrderStatus::New,
                executed_qty: 0.0,
                avg_price: None,
                cum_quote: None,
            }),
            Value::Number(id) => Ok(OrderReport {
                exchange_order_id: Some(id.to_string()),
                client_order_id: None,
                status: OrderStatus::New,
                executed_qty: 0.0,
                avg_price: None,
                cum_quote: None,
            }),
            order @ Value::Object(_) => self.parse_order_data(&order),
            other => Err(TradeError::malformed(
                ExchangeId::Mexc,
                format!("unexpected order payload {other}"),
            )),
        }
    }

    async fn query_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        Self::ensure_linear(market)?;
        self.contract(symbol).await?;
        let path = format!(
            "/api/v1/private/order/external/{}/{}",
            self.format_symbol(symbol, market),
            urlencoding::encode(client_order_id)
        );
        match self.call(Method::GET, &path, &Vec::new(), true).await? {
            Value::Null => Ok(None),
            order => self.parse_order_data(&order).map(Some),
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        market: MarketType,
        client_order_id: &str,
    ) -> Result<()> {
        Self::ensure_linear(market)?;
        let params: Params = vec![
            ("symbol".into(), json!(self.format_symbol(symbol, market))),
            ("externalOid".into(), json!(client_order_id)),
        ];
        self.call(
            Method::POST,
            "/api/v1/private/order/cancel_with_external",
            &params,
            true,
        )
        .await?;
        Ok(())
    }

    async fn fetch_positions(&self, market: MarketType) -> Result<Vec<ReportedPosition>> {
        Self::ensure_linear(market)?;
        let data = self
            .call(Method::GET, "/api/v1/private/position/open_positions", &Vec::new(), true)
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "positions is not a list"))?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let hold_vol = num_field(row, "holdVol")?;
            if hold_vol <= 0.0 {
                continue;
            }
            let venue_symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default();
            let spec = self.contract(venue_symbol).await?;
            let side = match row.get("positionType").and_then(Value::as_i64) {
                Some(1) => PositionSide::Long,
                Some(2) => PositionSide::Short,
                other => {
                    return Err(TradeError::malformed(
                        ExchangeId::Mexc,
                        format!("positionType {other:?}"),
                    ))
                }
            };
            positions.push(ReportedPosition {
                symbol: Self::canonical_symbol(venue_symbol),
                market_type: MarketType::Linear,
                side,
                quantity: hold_vol * spec.contract_size,
                entry_price: num_field(row, "holdAvgPrice")?,
                mark_price: None,
                unrealized_pnl: 0.0,
                leverage: num_field(row, "leverage").unwrap_or(1.0),
            });
        }
        Ok(positions)
    }

    async fn ticker_price(&self, symbol: &str, market: MarketType) -> Result<f64> {
        Self::ensure_linear(market)?;
        let params: Params = vec![("symbol".into(), json!(self.format_symbol(symbol, market)))];
        let data = self
            .call(Method::GET, "/api/v1/contract/ticker", &params, false)
            .await?;
        num_field(&data, "lastPrice")
    }

    async fn daily_closes(
        &self,
        symbol: &str,
        market: MarketType,
        limit: usize,
    ) -> Result<Vec<f64>> {
        Self::ensure_linear(market)?;
        let start = (ServerClock::local_ms() / 1000) - (limit as i64 + 1) * 86_400;
        let path = format!(
            "/api/v1/contract/kline/{}",
            self.format_symbol(symbol, market)
        );
        let params: Params = vec![
            ("interval".into(), json!("Day1")),
            ("start".into(), json!(start)),
        ];
        let data = self.call(Method::GET, &path, &params, false).await?;

        // Column arrays, oldest first
        let closes = data
            .get("close")
            .and_then(Value::as_array)
            .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "kline close column missing"))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "non-numeric close"))
            })
            .collect::<Result<Vec<f64>>>()?;

        let skip = closes.len().saturating_sub(limit);
        Ok(closes.into_iter().skip(skip).collect())
    }

    async fn instrument(&self, symbol: &str, market: MarketType) -> Result<InstrumentInfo> {
        Self::ensure_linear(market)?;
        Ok(self.contract(symbol).await?.info)
    }

    async fn wallet_balance(&self) -> Result<f64> {
        let data = self
            .call(Method::GET, "/api/v1/private/account/assets", &Vec::new(), true)
            .await?;
        let assets = data
            .as_array()
            .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "assets is not a list"))?;
        let usdt = assets
            .iter()
            .find(|a| a.get("currency").and_then(Value::as_str) == Some("USDT"))
            .ok_or_else(|| TradeError::malformed(ExchangeId::Mexc, "no USDT asset"))?;
        num_field(usdt, "equity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MexcAdapter {
        let creds = ExchangeCredentials {
            api_key: "KEY".to_string(),
            api_secret: "SECRET".to_string(),
            base_url: Some("http://127.0.0.1:9".to_string()),
            recv_window_ms: 5000,
            requests_per_second: 50,
        };
        MexcAdapter::new(&creds, Duration::from_secs(1), Duration::from_secs(300)).unwrap()
    }

    fn with_btc_contract(a: &MexcAdapter) {
        a.contracts.insert(
            "BTC_USDT".to_string(),
            ContractSpec {
                info: InstrumentInfo {
                    symbol: "BTCUSDT".to_string(),
                    tick_size: 0.1,
                    qty_step: 0.0001,
                    min_qty: 0.0001,
                },
                contract_size: 0.0001,
            },
        );
    }

    #[test]
    fn test_symbol_format() {
        let a = adapter();
        assert_eq!(a.format_symbol("BTCUSDT", MarketType::Linear), "BTC_USDT");
        assert_eq!(a.format_symbol("eth-usdc", MarketType::Linear), "ETH_USDC");
        assert_eq!(a.format_symbol("SOL_USDT", MarketType::Linear), "SOL_USDT");
        assert_eq!(MexcAdapter::canonical_symbol("BTC_USDT"), "BTCUSDT");
    }

    #[test]
    fn test_side_codes() {
        assert_eq!(side_code(OrderSide::Buy, false), 1);
        assert_eq!(side_code(OrderSide::Sell, true), 4);
        assert_eq!(side_code(OrderSide::Sell, false), 3);
        assert_eq!(side_code(OrderSide::Buy, true), 2);
    }

    #[test]
    fn test_submit_ack_is_new() {
        let report = adapter()
            .parse_order_response(r#"{"success":true,"code":0,"data":"7391"}"#)
            .unwrap();
        assert_eq!(report.exchange_order_id.as_deref(), Some("7391"));
        assert_eq!(report.status, OrderStatus::New);
    }

    #[test]
    fn test_order_volume_scaled_by_contract_size() {
        let a = adapter();
        with_btc_contract(&a);
        let raw = r#"{"success":true,"code":0,"data":{"orderId":"55","symbol":"BTC_USDT",
            "externalOid":"tc-9","state":3,"dealVol":25,"dealAvgPrice":64000.5}}"#;
        let report = a.parse_order_response(raw).unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert!((report.executed_qty - 0.0025).abs() < 1e-12);
        assert_eq!(report.avg_price, Some(64000.5));
        assert_eq!(report.client_order_id.as_deref(), Some("tc-9"));
    }

    #[test]
    fn test_envelope_error_classes() {
        let a = adapter();
        assert!(matches!(
            a.parse_order_response(r#"{"success":false,"code":602,"message":"sign error"}"#),
            Err(TradeError::Authentication(_))
        ));
        assert!(a
            .parse_order_response(r#"{"success":false,"code":510,"message":"busy"}"#)
            .unwrap_err()
            .is_transient());
        assert!(matches!(
            a.parse_order_response(r#"{"success":false,"code":2005,"message":"balance"}"#),
            Err(TradeError::ExchangeRejected { code: 2005, .. })
        ));
        assert!(matches!(
            a.parse_order_response(r#"{"success":false,"code":2011,"message":"Duplicate externalOid"}"#),
            Err(TradeError::DuplicateOrder { .. })
        ));
        assert!(matches!(
            a.parse_order_response(r#"{"data":{}}"#),
            Err(TradeError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_unknown_contract_is_malformed() {
        let raw = r#"{"success":true,"code":0,"data":{"orderId":"1","symbol":"DOGE_USDT","state":3,"dealVol":1}}"#;
        assert!(matches!(
            adapter().parse_order_response(raw),
            Err(TradeError::MalformedResponse { .. })
        ));
    }
}
