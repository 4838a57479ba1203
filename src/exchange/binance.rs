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
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub timeout_secs: u64,
}

pub struct BinanceExchange {
    client: Client,
    config: BinanceConfig,
    clock: Arc<dyn Clock>,
}

impl BinanceExchange {
    pub fn new(config: BinanceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::new("base_url must be set"));
        }
        if config.api_key.trim().is_empty() {
            return Err(Error::new("api_key must be set"));
        }
        if config.api_secret.trim().is_empty() {
            return Err(Error::new("api_secret must be set"));
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

    pub fn hmac_sha256_hex(secret: &str, message: &str) -> AdapterResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AdapterError::Auth("invalid key".to_string()))?;
        mac.update(message.as_bytes());
        let result = mac.finalize().into_bytes();
        Ok(bytes_to_hex(&result))
    }

    fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> AdapterResult<Value> {
        params.push(("timestamp".to_string(), self.clock.now_ms().to_string()));
        if self.config.recv_window > 0 {
            params.push(("recvWindow".to_string(), self.config.recv_window.to_string()));
        }
        let query = build_query_string(&params);
        let signature = Self::hmac_sha256_hex(&self.config.api_secret, &query)?;
        let signed_query = format!("{query}&signature={signature}");
        let url = format!("{}{}?{}", self.config.base_url, path, signed_query);

        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", self.config.api_key.as_str())
            .send()
            .map_err(|err| AdapterError::Transient(format!("http request failed: {err}")))?;
        read_response(response)
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
        read_response(response)
    }
}

impl Exchange for BinanceExchange {
    fn spot_price(&self, symbol: &str) -> AdapterResult<Decimal> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let json = self.public_request("/api/v3/ticker/price", params)?;
        let price = json
            .get("price")
            .ok_or_else(|| AdapterError::Unavailable("price missing".to_string()))?;
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
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.binance_code().to_string()),
            ("limit".to_string(), "3".to_string()),
        ];
        let json = self.public_request("/api/v3/klines", params)?;
        let candles = parse_klines(&json)?;
        select_last_closed(&candles, interval, self.clock.now_ms())
    }

    fn place_market_buy(&self, symbol: &str, qty: Decimal) -> AdapterResult<BuyFill> {
        if qty <= Decimal::ZERO {
            return Err(AdapterError::FilterViolation(
                "quantity must be positive".to_string(),
            ));
        }
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), "BUY".to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), qty.to_string()),
            ("newOrderRespType".to_string(), "FULL".to_string()),
        ];
        let json = self.signed_request(Method::POST, "/api/v3/order", params)?;
        parse_market_buy(&json, qty)
    }

    fn place_market_sell(&self, symbol: &str, qty: Decimal) -> AdapterResult<OrderAck> {
        if qty <= Decimal::ZERO {
            return Err(AdapterError::FilterViolation(
                "quantity must be positive".to_string(),
            ));
        }
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), "SELL".to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), qty.to_string()),
            ("newOrderRespType".to_string(), "RESULT".to_string()),
        ];
        let json = self.signed_request(Method::POST, "/api/v3/order", params)?;
        parse_order_ack(&json)
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
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), "SELL".to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("quantity".to_string(), qty.to_string()),
            ("price".to_string(), price.to_string()),
            ("newOrderRespType".to_string(), "ACK".to_string()),
        ];
        let json = self.signed_request(Method::POST, "/api/v3/order", params)?;
        parse_order_ack(&json)
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<bool> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        match self.signed_request(Method::DELETE, "/api/v3/order", params) {
            Ok(_) => Ok(true),
            // The order is already gone; that is what a cancel wants.
            Err(AdapterError::NotFound(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let json = self.signed_request(Method::GET, "/api/v3/openOrders", params)?;
        parse_open_orders(&json)
    }

    fn symbol_filters(&self, symbol: &str) -> AdapterResult<SymbolFilters> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let json = self.public_request("/api/v3/exchangeInfo", params)?;
        parse_symbol_filters(&json, symbol)
    }

    fn all_assets(&self) -> AdapterResult<Vec<Balance>> {
        let json = self.signed_request(Method::GET, "/api/v3/account", Vec::new())?;
        parse_balances(&json)
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
        let code = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|json| json.get("code").and_then(|value| value.as_i64()));
        let msg = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|json| {
                json.get("msg")
                    .and_then(|value| value.as_str())
                    .map(|value| value.to_string())
            })
            .unwrap_or_else(|| format!("binance response status: {status}"));
        return Err(map_binance_error(status.as_u16(), code, &msg, retry_after));
    }
    serde_json::from_str::<Value>(&body)
        .map_err(|err| AdapterError::Unavailable(format!("json parse failed: {err}")))
}

pub fn map_binance_error(
    status: u16,
    code: Option<i64>,
    msg: &str,
    retry_after_secs: Option<u64>,
) -> AdapterError {
    match code {
        Some(-2010) => AdapterError::InsufficientBalance(msg.to_string()),
        Some(-2011) | Some(-2013) => AdapterError::NotFound(msg.to_string()),
        Some(-1013) | Some(-1111) => AdapterError::FilterViolation(msg.to_string()),
        Some(-1121) => AdapterError::NotFound(msg.to_string()),
        Some(-1022) | Some(-2014) | Some(-2015) => AdapterError::Auth(msg.to_string()),
        _ => match status {
            401 | 403 => AdapterError::Auth(msg.to_string()),
            418 | 429 => AdapterError::RateLimited { retry_after_secs },
            status if status >= 500 => AdapterError::Transient(msg.to_string()),
            _ => AdapterError::Unavailable(msg.to_string()),
        },
    }
}

pub fn parse_klines(json: &Value) -> AdapterResult<Vec<Candle>> {
    let array = json
        .as_array()
        .ok_or_else(|| AdapterError::Unavailable("klines response should be array".to_string()))?;
    let mut result = Vec::with_capacity(array.len());
    for row in array {
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

fn parse_fill_status(status: &str) -> FillStatus {
    match status {
        "FILLED" => FillStatus::Filled,
        "PARTIALLY_FILLED" => FillStatus::Partial,
        _ => FillStatus::New,
    }
}

pub fn parse_market_buy(json: &Value, requested_qty: Decimal) -> AdapterResult<BuyFill> {
    let order_id = json
        .get("orderId")
        .map(value_to_i64)
        .transpose()?
        .ok_or_else(|| AdapterError::Unavailable("orderId missing".to_string()))?
        .to_string();
    let status = json
        .get("status")
        .and_then(|value| value.as_str())
        .map(parse_fill_status)
        .unwrap_or(FillStatus::New);
    let filled_qty = match json.get("executedQty") {
        Some(value) => {
            let qty = value_to_decimal(value)?;
            if qty > Decimal::ZERO {
                qty
            } else {
                requested_qty
            }
        }
        None => requested_qty,
    };
    let avg_fill_price = average_fill_price(json)?;
    Ok(BuyFill {
        order_id,
        filled_qty,
        avg_fill_price,
        status,
    })
}

fn average_fill_price(json: &Value) -> AdapterResult<Option<Decimal>> {
    let fills = match json.get("fills").and_then(|value| value.as_array()) {
        Some(fills) if !fills.is_empty() => fills,
        _ => return Ok(None),
    };
    let mut notional = Decimal::ZERO;
    let mut quantity = Decimal::ZERO;
    for fill in fills {
        let price = fill
            .get("price")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let qty = fill
            .get("qty")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        notional += price * qty;
        quantity += qty;
    }
    if quantity <= Decimal::ZERO {
        return Ok(None);
    }
    Ok(Some(notional / quantity))
}

fn parse_order_ack(json: &Value) -> AdapterResult<OrderAck> {
    let order_id = json
        .get("orderId")
        .map(value_to_i64)
        .transpose()?
        .ok_or_else(|| AdapterError::Unavailable("orderId missing".to_string()))?
        .to_string();
    let status = json
        .get("status")
        .and_then(|value| value.as_str())
        .map(parse_fill_status)
        .unwrap_or(FillStatus::New);
    Ok(OrderAck { order_id, status })
}

pub fn parse_open_orders(json: &Value) -> AdapterResult<Vec<OpenOrder>> {
    let array = json
        .as_array()
        .ok_or_else(|| AdapterError::Unavailable("openOrders should be array".to_string()))?;
    let mut result = Vec::new();
    for item in array {
        let order_id = match item.get("orderId") {
            Some(value) => value_to_i64(value)?.to_string(),
            None => continue,
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
            .get("origQty")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let order_type = item
            .get("type")
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

pub fn parse_symbol_filters(json: &Value, symbol: &str) -> AdapterResult<SymbolFilters> {
    let symbols = json
        .get("symbols")
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::NotFound(format!("no exchange info for {symbol}")))?;
    let info = symbols
        .iter()
        .find(|item| item.get("symbol").and_then(|value| value.as_str()) == Some(symbol))
        .ok_or_else(|| AdapterError::NotFound(format!("unknown symbol {symbol}")))?;
    let filters = info
        .get("filters")
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::NotFound(format!("no filters for {symbol}")))?;

    let mut lot_step = None;
    let mut tick_size = None;
    let mut min_notional = None;
    for filter in filters {
        match filter.get("filterType").and_then(|value| value.as_str()) {
            Some("LOT_SIZE") => {
                lot_step = filter.get("stepSize").map(value_to_decimal).transpose()?;
            }
            Some("PRICE_FILTER") => {
                tick_size = filter.get("tickSize").map(value_to_decimal).transpose()?;
            }
            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                let value = filter
                    .get("minNotional")
                    .or_else(|| filter.get("notional"))
                    .map(value_to_decimal)
                    .transpose()?;
                if value.is_some() {
                    min_notional = value;
                }
            }
            _ => {}
        }
    }

    Ok(SymbolFilters {
        lot_step: lot_step
            .ok_or_else(|| AdapterError::NotFound(format!("no LOT_SIZE filter for {symbol}")))?,
        tick_size: tick_size
            .ok_or_else(|| AdapterError::NotFound(format!("no PRICE_FILTER for {symbol}")))?,
        min_notional: min_notional.unwrap_or(Decimal::ZERO),
    })
}

fn parse_balances(json: &Value) -> AdapterResult<Vec<Balance>> {
    let balances = json
        .get("balances")
        .and_then(|value| value.as_array())
        .ok_or_else(|| AdapterError::Unavailable("balances missing".to_string()))?;
    let mut result = Vec::new();
    for balance in balances {
        let asset = balance
            .get("asset")
            .and_then(|value| value.as_str())
            .unwrap_or("")
            .to_string();
        if asset.is_empty() {
            continue;
        }
        let free = balance
            .get("free")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let locked = balance
            .get("locked")
            .map(value_to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        result.push(Balance {
            asset,
            free,
            locked,
        });
    }
    Ok(result)
}
