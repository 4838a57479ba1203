use crate::core::Clock;
use crate::exchange::{
    build_query_string, bytes_to_hex, select_last_closed, value_to_decimal, value_to_i64,
    AdapterError, AdapterResult, Exchange,
};
use crate::models::{Balance, BuyFill, Candle, FillStatus, Interval, OpenOrder, OrderAck, SymbolFilters};
use crate::{Error, Result};
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug)]
pub struct BybitConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub timeout_secs: u64,
    pub category: String,
    pub account_type: String,
}

pub struct BybitExchange {
    client: Client,
    config: BybitConfig,
    clock: Arc<dyn Clock>,
}

impl BybitExchange {
    pub fn new(config: BybitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::new("base_url must be set"));
        }
        if config.api_key.trim().is_empty() {
            return Err(Error::new("api_key must be set"));
        }
        if config.api_secret.trim().is_empty() {
            return Err(Error::new("api_secret must be set"));
        }
        if config.category.trim().is_empty() {
            return Err(Error::new("category must be set"));
        }
        if config.account_type.trim().is_empty() {
            return Err(Error::new("account_type must be set"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| Error::new(format!("http client build failed: {err}")))?;
        Ok(Self {
            client,
            config,
            clock,
        })
    }

    fn hmac_sha256_hex(secret: &str, payload: &str) -> AdapterResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AdapterError::Auth("invalid key".to_string()))?;
        mac.update(payload.as_bytes());
        let result = mac.finalize().into_bytes();
        Ok(bytes_to_hex(&result))
    }

    fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        body: Option<Value>,
    ) -> AdapterResult<Value> {
        let timestamp = self.clock.now_ms().to_string();
        let recv_window = self.config.recv_window.to_string();
        let query = build_query_string(&params);
        let body_str = if let Some(body) = body {
            serde_json::to_string(&body)
                .map_err(|err| AdapterError::Unavailable(format!("json encode failed: {err}")))?
        } else {
            String::new()
        };
        let sign_payload = if method == Method::GET {
            format!("{}{}{}{}", timestamp, self.config.api_key, recv_window, query)
        } else {
            format!(
                "{}{}{}{}",
                timestamp, self.config.api_key, recv_window, body_str
            )
        };
        let signature = Self::hmac_sha256_hex(&self.config.api_secret, &sign_payload)?;

        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };

        let mut request = self
            .client
            .request(method, url)
            .header("X-BAPI-API-KEY", self.config.api_key.as_str())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", recv_window)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request
            .send()
            .map_err(|err| AdapterError::Transient(format!("http request failed: {err}")))?;
        let json = read_response(response)?;
        ensure_bybit_ok(&json)?;
        Ok(json)
    }

    fn public_request(&self, path: &str, params: Vec<(String, String)>) -> AdapterResult<Value> {
        let query = build_query_string(&params);
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AdapterError::Transient(format!("http request failed: {err}")))?;
        let json = read_response(response)?;
        ensure_bybit_ok(&json)?;
        Ok(json)
    }

    fn create_order(&self, body: Value) -> AdapterResult<String> {
        let json = self.signed_request(Method::POST, "/v5/order/create", Vec::new(), Some(body))?;
        json.get("result")
            .and_then(|value| value.get("orderId"))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .ok_or_else(|| AdapterError::Unavailable("orderId missing".to_string()))
    }
}

impl Exchange for BybitExchange {
    fn spot_price(&self, symbol: &str) -> AdapterResult<Decimal> {
        let params = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let json = self.public_request("/v5/market/tickers", params)?;
        let price = json
            .get("result")
            .and_then(|value| value.get("list"))
            .and_then(|value| value.as_array())
            .and_then(|list| list.first())
            .and_then(|entry| entry.get("lastPrice"))
            .ok_or_else(|| AdapterError::Unavailable("lastPrice missing".to_string()))?;
        let price = value_to_decimal(price)?;
        if price <= Decimal::ZERO {
            return Err(AdapterError::Unavailable(format!(
                "non-positive price for {symbol}"
            )));
        }
        Ok(price)
    }

    fn balance(&self, asset: &str) -> AdapterResult<Balance> {
        let balances = self.all_assets()?;
        Ok(balances
            .into_iter()
            .find(|balance| balance.asset == asset)
            .unwrap_or(Balance {
                asset: asset.to_string(),
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            }))
    }

    fn last_closed_candle(&self, symbol: &str, interval: Interval) -> AdapterResult<Candle> {
        let params = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.bybit_code().to_string()),
            ("limit".to_string(), "3".to_string()),
        ];
        let json = self.public_request("/v5/market/kline", params)?;
        let candles = parse_bybit_klines(&json)?;
        select_last_closed(&candles, interval, self.clock.now_ms())
    }

    fn place_market_buy(&self, symbol: &str, qty: Decimal) -> AdapterResult<BuyFill> {
        if qty <= Decimal::ZERO {
            return Err(AdapterError::FilterViolation(
                "quantity must be positive".to_string(),
            ));
        }
        let body = json!({
            "category": self.config.category,
            "symbol": symbol,
            "side": "Buy",
            "orderType": "Market",
            "qty": qty.to_string(),
            "marketUnit": "baseCoin",
        });
        let order_id = self.create_order(body)?;
        // Bybit acks without fill detail; the engine falls back to the spot
        // price for the executed price.
        Ok(BuyFill {
            order_id,
            filled_qty: qty,
            avg_fill_price: None,
            status: FillStatus::New,
        })
    }

    fn place_market_sell(&self, symbol: &str, qty: Decimal) -> AdapterResult<OrderAck> {
        if qty <= Decimal::ZERO {
            return Err(AdapterError::FilterViolation(
                "quantity must be positive".to_string(),
            ));
        }
        let body = json!({
            "category": self.config.category,
            "symbol": symbol,
            "side": "Sell",
            "orderType": "Market",
            "qty": qty.to_string(),
            "marketUnit": "baseCoin",
        });
        let order_id = self.create_order(body)?;
        Ok(OrderAck {
            order_id,
            status: FillStatus::New,
        })
    }

    fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> AdapterResult<OrderAck> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(AdapterError::FilterViolation(
                "quantity and price must be positive".to_string(),
            ));
        }
        let body = json!({
            "category": self.config.category,
            "symbol": symbol,
            "side": "Sell",
            "orderType": "Limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "timeInForce": "GTC",
        });
        let order_id = self.create_order(body)?;
        Ok(OrderAck {
            order_id,
            status: FillStatus::New,
        })
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<bool> {
        let body = json!({
            "category": self.config.category,
            "symbol": symbol,
            "orderId": order_id,
        });
        match self.signed_request(Method::POST, "/v5/order/cancel", Vec::new(), Some(body)) {
            Ok(_) => Ok(true),
            Err(AdapterError::NotFound(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let params = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let json = self.signed_request(Method::GET, "/v5/order/realtime", params, None)?;
        parse_open_orders(&json)
    }

    fn symbol_filters(&self, symbol: &str) -> AdapterResult<SymbolFilters> {
        let params = vec![
            ("category".to_string(), self.config.category.clone()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let json = self.public_request("/v5/market/instruments-info", params)?;
        parse_instrument_filters(&json, symbol)
    }

    fn all_assets(&self) -> AdapterResult<Vec<Balance>> {
        let params = vec![("accountType".to_string(), self.config.account_type.clone())];
        let json = self.signed_request(Method::GET, "/v5/account/wallet-balance", params, None)?;
        parse_wallet_balances(&json)
    }
}

fn read_response(response: reqwest::blocking::Response) -> AdapterResult<Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response
        .text()
        .map_err(|err| AdapterError::Transient(format!("response read failed: {err}")))?;
    if !status.is_success() {
        return Err(match status.as_u16() {
            401 | 403 => AdapterError::Auth(format!("bybit response status: {status}")),
            429 => AdapterError::RateLimited {
                retry_after_secs: retry_after,
            },
            code if code >= 500 => {
                AdapterError::Transient(format!("bybit response status: {status}"))
            }
            _ => AdapterError::Unavailable(format!("bybit response status: {status}")),
        });
    }
    serde_json::from_str::<Value>(&body)
        .map_err(|err| AdapterError::Unavailable(format!("json parse failed: {err}")))
}

fn ensure_bybit_ok(json: &Value) -> AdapterResult<()> {
    let ret_code = json
        .get("retCode")
        .and_then(|value| value.as_i64())
        .unwrap_or(-1);
    if ret_code == 0 {
        return Ok(());
    }
    let msg = json
        .get("retMsg")
        .and_then(|value| value.as_str())
        .unwrap_or("bybit retCode is not 0");
    Err(map_bybit_error(ret_code, msg))
}

pub fn map_bybit_error(ret_code: i64, msg: &str) -> AdapterError {
    match ret_code {
        10003 | 10004 | 10005 | 33004 => AdapterError::Auth(msg.to_string()),
        10006 | 10018 => AdapterError::RateLimited {
            retry_after_secs: None,
        },
        110001 => AdapterError::NotFound(msg.to_string()),
        110007 | 170131 => AdapterError::InsufficientBalance(msg.to_string()),
        110003 | 170135 | 170136 | 170140 => AdapterError::FilterViolation(msg.to_string()),
        10002 => AdapterError::Transient(msg.to_string()),
        _ => AdapterError::Unavailable(format!("bybit error {ret_code}: {msg}")),
    }
}

/// Bybit returns klines newest-first; callers get them oldest-first.
pub fn parse_bybit_klines(json: &Value) -> AdapterResult<Vec<Candle>> {
    let list = json
        .get("result")
        .and_then(|value| value.get("list"))
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::Unavailable("kline result.list missing".to_string()))?;
    let mut result = Vec::with_capacity(list.len());
    for row in list {
        let row = row
            .as_array()
            .ok_or_else(|| AdapterError::Unavailable("kline row is not array".to_string()))?;
        if row.len() < 6 {
            return Err(AdapterError::Unavailable(
                "kline row has insufficient fields".to_string(),
            ));
        }
        result.push(Candle {
            open_time: value_to_i64(&row[0])?,
            open: value_to_decimal(&row[1])?,
            high: value_to_decimal(&row[2])?,
            low: value_to_decimal(&row[3])?,
            close: value_to_decimal(&row[4])?,
            volume: value_to_decimal(&row[5])?,
        });
    }
    result.sort_by_key(|candle| candle.open_time);
    Ok(result)
}

pub fn parse_open_orders(json: &Value) -> AdapterResult<Vec<OpenOrder>> {
    let list = json
        .get("result")
        .and_then(|value| value.get("list"))
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::Unavailable("order result.list missing".to_string()))?;
    let mut result = Vec::new();
    for item in list {
        let order_id = match item.get("orderId").and_then(|value| value.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => continue,
        };
        let side = item
            .get("side")
            .and_then(|value| value.as_str())
            .unwrap_or("")
            .to_uppercase();
        let price = item
            .get("price")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let qty = item
            .get("qty")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let order_type = item
            .get("orderType")
            .and_then(|value| value.as_str())
            .unwrap_or("")
            .to_uppercase();
        result.push(OpenOrder {
            order_id,
            side,
            price,
            qty,
            order_type,
        });
    }
    Ok(result)
}

pub fn parse_instrument_filters(json: &Value, symbol: &str) -> AdapterResult<SymbolFilters> {
    let info = json
        .get("result")
        .and_then(|value| value.get("list"))
        .and_then(|value| value.as_array())
        .and_then(|list| list.first())
        .ok_or_else(|| AdapterError::NotFound(format!("unknown symbol {symbol}")))?;
    let lot = info
        .get("lotSizeFilter")
        .ok_or_else(|| AdapterError::NotFound(format!("no lotSizeFilter for {symbol}")))?;
    let lot_step = lot
        .get("basePrecision")
        .or_else(|| lot.get("qtyStep"))
        .map(value_to_decimal)
        .transpose()?
        .ok_or_else(|| AdapterError::NotFound(format!("no qty step for {symbol}")))?;
    let min_notional = lot
        .get("minOrderAmt")
        .map(value_to_decimal)
        .transpose()?
        .unwrap_or(Decimal::ZERO);
    let tick_size = info
        .get("priceFilter")
        .and_then(|value| value.get("tickSize"))
        .map(value_to_decimal)
        .transpose()?
        .ok_or_else(|| AdapterError::NotFound(format!("no tickSize for {symbol}")))?;
    Ok(SymbolFilters {
        lot_step,
        tick_size,
        min_notional,
    })
}

fn parse_wallet_balances(json: &Value) -> AdapterResult<Vec<Balance>> {
    let list = json
        .get("result")
        .and_then(|value| value.get("list"))
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::Unavailable("wallet result.list missing".to_string()))?;
    let mut balances = Vec::new();
    for entry in list {
        let coins = match entry.get("coin").and_then(|value| value.as_array()) {
            Some(coins) => coins,
            None => continue,
        };
        for coin in coins {
            let asset = coin
                .get("coin")
                .and_then(|value| value.as_str())
                .unwrap_or("")
                .to_string();
            if asset.is_empty() {
                continue;
            }
            let wallet = coin
                .get("walletBalance")
                .map(value_to_decimal)
                .transpose()?
                .unwrap_or(Decimal::ZERO);
            let locked = coin
                .get("locked")
                .map(value_to_decimal)
                .transpose()?
                .unwrap_or(Decimal::ZERO);
            let free = match coin
                .get("availableToWithdraw")
                .or_else(|| coin.get("availableBalance"))
                .or_else(|| coin.get("free"))
            {
                Some(value) => {
                    let parsed = value_to_decimal(value);
                    match parsed {
                        Ok(free) => free,
                        Err(_) => (wallet - locked).max(Decimal::ZERO),
                    }
                }
                None => (wallet - locked).max(Decimal::ZERO),
            };
            balances.push(Balance {
                asset,
                free,
                locked,
            });
        }
    }
    Ok(balances)
}
