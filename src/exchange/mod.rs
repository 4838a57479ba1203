pub mod binance;
pub mod bybit;
pub mod filters;
pub mod registry;

use crate::models::{Balance, BuyFill, Candle, Interval, OpenOrder, OrderAck, SymbolFilters};
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure taxonomy every adapter must map its venue errors onto. The
/// engine's per-order policy dispatches on the variant, never on message
/// text.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("rate limited{}", retry_after_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("filter violation: {0}")]
    FilterViolation(String),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("not found: {0}")]
    NotFound(String),
}

fn retry_after_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(" (retry after {secs}s)"),
        None => String::new(),
    }
}

impl AdapterError {
    /// Transient and rate-limit failures are retried on the next tick with
    /// the prior status restored; everything else is handled per kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Transient(_)
                | AdapterError::Unavailable(_)
                | AdapterError::RateLimited { .. }
        )
    }
}

impl From<AdapterError> for crate::Error {
    fn from(err: AdapterError) -> Self {
        crate::Error::new(err.to_string())
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Uniform view of one spot venue for one credential set. Implementations
/// are thread-safe and every call is bounded by the HTTP client timeout.
pub trait Exchange: Send + Sync {
    fn spot_price(&self, symbol: &str) -> AdapterResult<Decimal>;
    fn balance(&self, asset: &str) -> AdapterResult<Balance>;
    /// Most recent candle whose interval boundary has passed; candles still
    /// forming are never returned.
    fn last_closed_candle(&self, symbol: &str, interval: Interval) -> AdapterResult<Candle>;
    fn place_market_buy(&self, symbol: &str, qty: Decimal) -> AdapterResult<BuyFill>;
    fn place_market_sell(&self, symbol: &str, qty: Decimal) -> AdapterResult<OrderAck>;
    fn place_limit_sell(&self, symbol: &str, qty: Decimal, price: Decimal)
        -> AdapterResult<OrderAck>;
    /// Ok(true) when the order is gone, whether or not this call removed it.
    fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<bool>;
    fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>>;
    fn symbol_filters(&self, symbol: &str) -> AdapterResult<SymbolFilters>;
    fn all_assets(&self) -> AdapterResult<Vec<Balance>>;
}

pub(crate) fn build_query_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join("&")
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{:02x}", byte));
    }
    output
}

pub(crate) fn value_to_decimal(value: &serde_json::Value) -> AdapterResult<Decimal> {
    match value {
        serde_json::Value::String(text) => text
            .parse::<Decimal>()
            .map_err(|err| AdapterError::Unavailable(format!("invalid decimal: {err}"))),
        serde_json::Value::Number(number) => number
            .to_string()
            .parse::<Decimal>()
            .map_err(|err| AdapterError::Unavailable(format!("invalid decimal: {err}"))),
        _ => Err(AdapterError::Unavailable(
            "unexpected value type for decimal".to_string(),
        )),
    }
}

pub(crate) fn value_to_i64(value: &serde_json::Value) -> AdapterResult<i64> {
    match value {
        serde_json::Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| AdapterError::Unavailable("number is not i64".to_string())),
        serde_json::Value::String(text) => text
            .parse::<i64>()
            .map_err(|err| AdapterError::Unavailable(format!("invalid i64: {err}"))),
        _ => Err(AdapterError::Unavailable(
            "unexpected value type for i64".to_string(),
        )),
    }
}

/// Ascending candles in, the newest fully closed one out.
pub fn select_last_closed(
    candles: &[Candle],
    interval: Interval,
    now_ms: i64,
) -> AdapterResult<Candle> {
    candles
        .iter()
        .filter(|candle| candle.open_time + interval.candle_ms() <= now_ms)
        .max_by_key(|candle| candle.open_time)
        .cloned()
        .ok_or_else(|| AdapterError::Unavailable("no closed candle in window".to_string()))
}
