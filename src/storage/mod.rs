pub mod memory;
pub mod postgres;

use crate::models::{Interval, Order, OrderStatus, Side};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub struct NewOrder {
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
    pub tp_order_id: Option<String>,
}

/// Mutations applied together with a status change. `Option<Option<_>>`
/// fields distinguish "leave alone" from "clear".
#[derive(Clone, Debug)]
pub struct OrderChanges {
    pub status: OrderStatus,
    pub quantity: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub max_entry: Option<Decimal>,
    pub take_profit: Option<Option<Decimal>>,
    pub stop_loss: Option<Option<Decimal>>,
    pub entry_interval: Option<Interval>,
    pub stop_interval: Option<Interval>,
    pub executed_price: Option<Decimal>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sl_updated_at: Option<DateTime<Utc>>,
    pub tp_order_id: Option<Option<String>>,
}

impl OrderChanges {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status,
            quantity: None,
            entry_price: None,
            max_entry: None,
            take_profit: None,
            stop_loss: None,
            entry_interval: None,
            stop_interval: None,
            executed_price: None,
            executed_at: None,
            closed_at: None,
            sl_updated_at: None,
            tp_order_id: None,
        }
    }

    pub fn quantity(mut self, value: Decimal) -> Self {
        self.quantity = Some(value);
        self
    }

    pub fn entry_price(mut self, value: Decimal) -> Self {
        self.entry_price = Some(value);
        self
    }

    pub fn max_entry(mut self, value: Decimal) -> Self {
        self.max_entry = Some(value);
        self
    }

    pub fn take_profit(mut self, value: Option<Decimal>) -> Self {
        self.take_profit = Some(value);
        self
    }

    pub fn stop_loss(mut self, value: Option<Decimal>) -> Self {
        self.stop_loss = Some(value);
        self
    }

    pub fn entry_interval(mut self, value: Interval) -> Self {
        self.entry_interval = Some(value);
        self
    }

    pub fn stop_interval(mut self, value: Interval) -> Self {
        self.stop_interval = Some(value);
        self
    }

    pub fn executed_price(mut self, value: Decimal) -> Self {
        self.executed_price = Some(value);
        self
    }

    pub fn executed_at(mut self, value: DateTime<Utc>) -> Self {
        self.executed_at = Some(value);
        self
    }

    pub fn closed_at(mut self, value: DateTime<Utc>) -> Self {
        self.closed_at = Some(value);
        self
    }

    pub fn sl_updated_at(mut self, value: DateTime<Utc>) -> Self {
        self.sl_updated_at = Some(value);
        self
    }

    pub fn tp_order_id(mut self, value: Option<String>) -> Self {
        self.tp_order_id = Some(value);
        self
    }
}

/// User-driven edits to plans the engine is not currently acting on.
#[derive(Clone, Debug, Default)]
pub struct OrderPatch {
    pub entry_price: Option<Decimal>,
    pub max_entry: Option<Decimal>,
    pub take_profit: Option<Option<Decimal>>,
    pub stop_loss: Option<Option<Decimal>>,
    pub entry_interval: Option<Interval>,
    pub stop_interval: Option<Interval>,
    pub sl_updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub exchange_id: Option<i32>,
    pub is_testnet: Option<bool>,
    pub symbol: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRef {
    pub id: i32,
    pub name: String,
}

/// Durable store of plans and their evolving state. `atomic_transition` is
/// the only way a status changes: it succeeds only when the stored status
/// matches one of `expected`, and `None` means another worker holds the
/// order (Conflict).
pub trait OrderRepository: Send + Sync {
    fn insert(&self, order: NewOrder) -> Result<Order>;
    fn load(&self, id: i64) -> Result<Option<Order>>;
    fn list_non_terminal(&self) -> Result<Vec<Order>>;
    fn list_by(&self, filter: &OrderFilter) -> Result<Vec<Order>>;
    fn atomic_transition(
        &self,
        id: i64,
        expected: &[OrderStatus],
        changes: OrderChanges,
    ) -> Result<Option<Order>>;
    /// Applies only when the order is neither terminal nor IN_EXECUTION;
    /// `None` otherwise.
    fn patch(&self, id: i64, patch: OrderPatch) -> Result<Option<Order>>;
    /// Rewrites the original order and inserts its sibling in one
    /// transaction; `None` when the status precondition fails.
    fn split(
        &self,
        id: i64,
        expected: OrderStatus,
        original: OrderChanges,
        sibling: NewOrder,
    ) -> Result<Option<(Order, Order)>>;
    fn list_exchanges(&self) -> Result<Vec<ExchangeRef>>;
}

pub(crate) fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn apply_changes(order: &mut Order, changes: &OrderChanges, updated_at: DateTime<Utc>) {
    order.status = changes.status;
    if let Some(value) = changes.quantity {
        order.quantity = value;
    }
    if let Some(value) = changes.entry_price {
        order.entry_price = value;
    }
    if let Some(value) = changes.max_entry {
        order.max_entry = value;
    }
    if let Some(value) = &changes.take_profit {
        order.take_profit = *value;
    }
    if let Some(value) = &changes.stop_loss {
        order.stop_loss = *value;
    }
    if let Some(value) = changes.entry_interval {
        order.entry_interval = value;
    }
    if let Some(value) = changes.stop_interval {
        order.stop_interval = value;
    }
    if let Some(value) = changes.executed_price {
        order.executed_price = Some(value);
    }
    if let Some(value) = changes.executed_at {
        order.executed_at = Some(value);
    }
    if let Some(value) = changes.closed_at {
        order.closed_at = Some(value);
    }
    if let Some(value) = changes.sl_updated_at {
        order.sl_updated_at = Some(value);
    }
    if let Some(value) = &changes.tp_order_id {
        order.tp_order_id = value.clone();
    }
    order.updated_at = updated_at;
}

pub(crate) fn apply_patch(order: &mut Order, patch: &OrderPatch, updated_at: DateTime<Utc>) {
    if let Some(value) = patch.entry_price {
        order.entry_price = value;
    }
    if let Some(value) = patch.max_entry {
        order.max_entry = value;
    }
    if let Some(value) = &patch.take_profit {
        order.take_profit = *value;
    }
    if let Some(value) = &patch.stop_loss {
        order.stop_loss = *value;
    }
    if let Some(value) = patch.entry_interval {
        order.entry_interval = value;
    }
    if let Some(value) = patch.stop_interval {
        order.stop_interval = value;
    }
    if let Some(value) = patch.sl_updated_at {
        order.sl_updated_at = Some(value);
    }
    order.updated_at = updated_at;
}
