//! Binance USDT-M perpetual futures REST client. HMAC-SHA256 signed
//! requests, grounded on the teacher's spot client (`binance/client.rs`)
//! and generalized to the futures endpoints a perp copy-trading engine
//! needs: balance, symbol filters, mark price, leverage, market and
//! reduce-only (TP/SL) orders, cancellation, and position lookup.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::domain::models::{PlaintextCredential, PositionSide, SymbolRules};
use crate::error::ExchangeError;
use crate::ports::{AccountBalance, ExchangePositionSnapshot, ExchangeAdapter, MarketFillResult, OrderSide, ReduceOrderKind, ReduceOrderResult};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

pub struct BinanceAdapter {
    exchange_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new(exchange_id: impl Into<String>, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(request_timeout).build().expect("failed to build reqwest client");
        BinanceAdapter { exchange_id: exchange_id.into(), base_url: base_url.into(), client }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before UNIX epoch").as_millis() as u64
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(credential: &PlaintextCredential, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() { format!("timestamp={ts}&recvWindow={RECV_WINDOW}") } else { format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}") };
        let sig = Self::sign(&credential.api_secret, &base);
        format!("{base}&signature={sig}")
    }

    async fn get_signed(&self, path: &str, credential: &PlaintextCredential, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = Self::signed_query(credential, params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.get(&url).header("X-MBX-APIKEY", &credential.api_key)).await
    }

    async fn post_signed(&self, path: &str, credential: &PlaintextCredential, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = Self::signed_query(credential, params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.post(&url).header("X-MBX-APIKEY", &credential.api_key)).await
    }

    async fn delete_signed(&self, path: &str, credential: &PlaintextCredential, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = Self::signed_query(credential, params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.delete(&url).header("X-MBX-APIKEY", &credential.api_key)).await
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = if query.is_empty() { format!("{}{}", self.base_url, path) } else { format!("{}{}?{}", self.base_url, path, query) };
        self.send(self.client.get(&url)).await
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, ExchangeError> {
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() { ExchangeError::Transport(format!("request timed out: {e}")) } else { ExchangeError::Transport(e.to_string()) }
        })?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::Transport(format!("failed to parse response body: {e}")))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExchangeError::Auth(body.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimit { retry_after_ms: 1000 });
        }
        if !status.is_success() {
            let code = body.get("code").map(|v| v.to_string()).unwrap_or_default();
            let message = body.get("msg").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string();
            return Err(ExchangeError::ExchangeReject { code, message });
        }
        Ok(body)
    }

    fn parse_str_f64(value: &serde_json::Value) -> Result<f64, ExchangeError> {
        value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| value.as_f64())
            .ok_or_else(|| ExchangeError::Transport(format!("expected numeric field, got {value}")))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn fetch_balance(&self, credential: &PlaintextCredential) -> Result<AccountBalance, ExchangeError> {
        let body = self.get_signed("/fapi/v2/balance", credential, "").await?;
        let entries = body.as_array().ok_or_else(|| ExchangeError::Transport("balance response is not an array".to_string()))?;
        for entry in entries {
            if entry.get("asset").and_then(|v| v.as_str()) == Some("USDT") {
                let equity = Self::parse_str_f64(entry.get("balance").unwrap_or(&serde_json::Value::Null))?;
                let available = Self::parse_str_f64(entry.get("availableBalance").unwrap_or(&serde_json::Value::Null))?;
                return Ok(AccountBalance { equity, available });
            }
        }
        warn!("USDT not present in futures balance response, defaulting to zero");
        Ok(AccountBalance { equity: 0.0, available: 0.0 })
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_id))]
    async fn fetch_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let body = self.get_public("/fapi/v1/exchangeInfo", &format!("symbol={symbol}")).await?;
        let symbols = body.get("symbols").and_then(|v| v.as_array()).ok_or_else(|| ExchangeError::Symbol(symbol.to_string()))?;
        let entry = symbols.first().ok_or_else(|| ExchangeError::Symbol(symbol.to_string()))?;
        let filters = entry.get("filters").and_then(|v| v.as_array()).ok_or_else(|| ExchangeError::Transport("exchangeInfo missing filters".to_string()))?;

        let mut min_notional = 0.0;
        let mut min_quantity = 0.0;
        let mut quantity_step = 0.0;
        let mut price_tick = 0.0;

        for filter in filters {
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                    if let Some(v) = filter.get("notional") {
                        min_notional = Self::parse_str_f64(v).unwrap_or(0.0);
                    }
                }
                Some("LOT_SIZE") => {
                    min_quantity = Self::parse_str_f64(filter.get("minQty").unwrap_or(&serde_json::Value::Null)).unwrap_or(0.0);
                    quantity_step = Self::parse_str_f64(filter.get("stepSize").unwrap_or(&serde_json::Value::Null)).unwrap_or(0.0);
                }
                Some("PRICE_FILTER") => {
                    price_tick = Self::parse_str_f64(filter.get("tickSize").unwrap_or(&serde_json::Value::Null)).unwrap_or(0.0);
                }
                _ => {}
            }
        }

        let max_leverage = entry.get("maxLeverage" ).and_then(|v| v.as_str()).and_then(|s| s.parse::<u32>().ok()).unwrap_or(20);

        Ok(SymbolRules { min_notional, min_quantity, quantity_step, price_tick, max_leverage })
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_id))]
    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self.get_public("/fapi/v1/ticker/price", &format!("symbol={symbol}")).await?;
        Self::parse_str_f64(body.get("price").unwrap_or(&serde_json::Value::Null))
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn set_leverage(&self, credential: &PlaintextCredential, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.post_signed("/fapi/v1/leverage", credential, &format!("symbol={symbol}&leverage={leverage}")).await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn submit_market(
        &self,
        credential: &PlaintextCredential,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<MarketFillResult, ExchangeError> {
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params = format!("symbol={symbol}&side={side_str}&type=MARKET&quantity={quantity}");
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        let body = self.post_signed("/fapi/v1/order", credential, &params).await?;
        let order_id = body.get("orderId").map(|v| v.to_string()).unwrap_or_default();
        let avg_price = Self::parse_str_f64(body.get("avgPrice").unwrap_or(&serde_json::Value::Null)).unwrap_or(0.0);
        let executed_qty = Self::parse_str_f64(body.get("executedQty").unwrap_or(&serde_json::Value::Null)).unwrap_or(quantity);
        Ok(MarketFillResult { order_id, fill_price: avg_price, filled_qty: executed_qty })
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn submit_reduce_order(
        &self,
        credential: &PlaintextCredential,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        kind: ReduceOrderKind,
    ) -> Result<ReduceOrderResult, ExchangeError> {
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let order_type = match kind {
            ReduceOrderKind::TakeProfit => "TAKE_PROFIT_MARKET",
            ReduceOrderKind::StopLoss => "STOP_MARKET",
        };
        let params = format!(
            "symbol={symbol}&side={side_str}&type={order_type}&stopPrice={trigger_price}&quantity={quantity}&reduceOnly=true&workingType=MARK_PRICE"
        );
        let body = self.post_signed("/fapi/v1/order", credential, &params).await?;
        let order_id = body.get("orderId").map(|v| v.to_string()).unwrap_or_default();
        Ok(ReduceOrderResult { order_id })
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn cancel_order(&self, credential: &PlaintextCredential, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.delete_signed("/fapi/v1/order", credential, &format!("symbol={symbol}&orderId={order_id}")).await?;
        Ok(())
    }

    #[instrument(skip(self, credential), fields(exchange = %self.exchange_id))]
    async fn fetch_position(&self, credential: &PlaintextCredential, symbol: &str) -> Result<Option<ExchangePositionSnapshot>, ExchangeError> {
        let body = self.get_signed("/fapi/v2/positionRisk", credential, &format!("symbol={symbol}")).await?;
        let entries = body.as_array().ok_or_else(|| ExchangeError::Transport("positionRisk response is not an array".to_string()))?;
        for entry in entries {
            let amount = Self::parse_str_f64(entry.get("positionAmt").unwrap_or(&serde_json::Value::Null))?;
            if amount == 0.0 {
                continue;
            }
            let entry_price = Self::parse_str_f64(entry.get("entryPrice").unwrap_or(&serde_json::Value::Null))?;
            let side = if amount > 0.0 { PositionSide::Long } else { PositionSide::Short };
            return Ok(Some(ExchangePositionSnapshot { side, quantity: amount.abs(), entry_price }));
        }
        Ok(None)
    }
}
