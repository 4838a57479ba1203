use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Long,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "LONG" => Ok(Side::Long),
            other => Err(Error::new(format!("unsupported side: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interval {
    Market,
    M5,
    M15,
    H1,
    H4,
    Daily,
}

impl Interval {
    /// Nominal duration used for plan arithmetic; Market has no candle of
    /// its own and reports zero.
    pub fn duration_ms(self) -> i64 {
        match self {
            Interval::Market => 0,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::Daily => 86_400_000,
        }
    }

    /// Candle span used when fetching klines. Market plans fall back to the
    /// one-minute series so stop checks still have a candle to read.
    pub fn candle_ms(self) -> i64 {
        match self {
            Interval::Market => 60_000,
            other => other.duration_ms(),
        }
    }

    pub fn binance_code(self) -> &'static str {
        match self {
            Interval::Market => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::Daily => "1d",
        }
    }

    pub fn bybit_code(self) -> &'static str {
        match self {
            Interval::Market => "1",
            Interval::M5 => "5",
            Interval::M15 => "15",
            Interval::H1 => "60",
            Interval::H4 => "240",
            Interval::Daily => "D",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Market => "Market",
            Interval::M5 => "M5",
            Interval::M15 => "M15",
            Interval::H1 => "H1",
            Interval::H4 => "H4",
            Interval::Daily => "Daily",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Market" => Ok(Interval::Market),
            "M5" => Ok(Interval::M5),
            "M15" => Ok(Interval::M15),
            "H1" => Ok(Interval::H1),
            "H4" => Ok(Interval::H4),
            "Daily" => Ok(Interval::Daily),
            other => Err(Error::new(format!("unknown interval: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    InExecution,
    Executed,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedExternally,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::ClosedTp
                | OrderStatus::ClosedSl
                | OrderStatus::ClosedManual
                | OrderStatus::ClosedExternally
                | OrderStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::InExecution => "IN_EXECUTION",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::ClosedTp => "CLOSED_TP",
            OrderStatus::ClosedSl => "CLOSED_SL",
            OrderStatus::ClosedManual => "CLOSED_MANUAL",
            OrderStatus::ClosedExternally => "CLOSED_EXTERNALLY",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(OrderStatus::Pending),
            "IN_EXECUTION" => Ok(OrderStatus::InExecution),
            "EXECUTED" => Ok(OrderStatus::Executed),
            "CLOSED_TP" => Ok(OrderStatus::ClosedTp),
            "CLOSED_SL" => Ok(OrderStatus::ClosedSl),
            "CLOSED_MANUAL" => Ok(OrderStatus::ClosedManual),
            "CLOSED_EXTERNALLY" => Ok(OrderStatus::ClosedExternally),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(Error::new(format!("unknown order status: {other}"))),
        }
    }
}

const QUOTE_ASSETS: [&str; 5] = ["USDC", "USDT", "BUSD", "USD", "EUR"];

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub exchange_id: i32,
    pub api_key_id: i64,
    pub is_testnet: bool,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub entry_price: Decimal,
    pub max_entry: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub entry_interval: Interval,
    pub stop_interval: Interval,
    pub executed_price: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sl_updated_at: Option<DateTime<Utc>>,
    pub tp_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn base_asset(&self) -> &str {
        for quote in QUOTE_ASSETS {
            if let Some(base) = self.symbol.strip_suffix(quote) {
                if !base.is_empty() {
                    return base;
                }
            }
        }
        &self.symbol
    }

    pub fn quote_asset(&self) -> &str {
        for quote in QUOTE_ASSETS {
            if self.symbol.ends_with(quote) && self.symbol.len() > quote.len() {
                return quote;
            }
        }
        "USDC"
    }

    /// Candles that closed before this instant never count for the stop
    /// trigger; the plan cannot be stopped out by history that predates it.
    pub fn stop_reference(&self) -> DateTime<Utc> {
        self.sl_updated_at
            .or(self.executed_at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Result<Self> {
        if free < Decimal::ZERO || locked < Decimal::ZERO {
            return Err(Error::new("balance values must be non-negative"));
        }
        Ok(Self {
            asset: asset.into(),
            free,
            locked,
        })
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SymbolFilters {
    pub lot_step: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillStatus {
    Filled,
    Partial,
    New,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BuyFill {
    pub order_id: String,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: FillStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: FillStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_type: String,
}
