use crate::core::Clock;
use crate::models::{Order, OrderStatus};
use crate::storage::{
    apply_changes, apply_patch, datetime_from_ms, ExchangeRef, NewOrder, OrderChanges, OrderFilter,
    OrderPatch, OrderRepository,
};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};

struct Inner {
    next_id: i64,
    orders: Vec<Order>,
    exchanges: Vec<ExchangeRef>,
}

/// Same contract as the Postgres store, held in a mutex. Used by the test
/// suite and as an ephemeral dev store.
pub struct MemoryRepository {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_exchanges(
            clock,
            vec![
                ExchangeRef {
                    id: 1,
                    name: "binance".to_string(),
                },
                ExchangeRef {
                    id: 2,
                    name: "bybit".to_string(),
                },
            ],
        )
    }

    pub fn with_exchanges(clock: Arc<dyn Clock>, exchanges: Vec<ExchangeRef>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                next_id: 1,
                orders: Vec::new(),
                exchanges,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::new("memory repository lock poisoned"))
    }

    fn materialize(&self, order: NewOrder, id: i64) -> Order {
        let now = datetime_from_ms(self.clock.now_ms());
        Order {
            id,
            user_id: order.user_id,
            exchange_id: order.exchange_id,
            api_key_id: order.api_key_id,
            is_testnet: order.is_testnet,
            symbol: order.symbol,
            side: order.side,
            quantity: order.quantity,
            status: order.status,
            entry_price: order.entry_price,
            max_entry: order.max_entry,
            take_profit: order.take_profit,
            stop_loss: order.stop_loss,
            entry_interval: order.entry_interval,
            stop_interval: order.stop_interval,
            executed_price: order.executed_price,
            executed_at: order.executed_at,
            closed_at: None,
            sl_updated_at: None,
            tp_order_id: order.tp_order_id,
            created_at: now,
            updated_at: now,
        }
    }
}

impl OrderRepository for MemoryRepository {
    fn insert(&self, order: NewOrder) -> Result<Order> {
        let mut inner = self.lock()?;
        let id = inner.next_id;
        inner.next_id += 1;
        let row = self.materialize(order, id);
        inner.orders.push(row.clone());
        Ok(row)
    }

    fn load(&self, id: i64) -> Result<Option<Order>> {
        let inner = self.lock()?;
        Ok(inner.orders.iter().find(|order| order.id == id).cloned())
    }

    fn list_non_terminal(&self) -> Result<Vec<Order>> {
        let inner = self.lock()?;
        Ok(inner
            .orders
            .iter()
            .filter(|order| !order.status.is_terminal())
            .cloned()
            .collect())
    }

    fn list_by(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let inner = self.lock()?;
        Ok(inner
            .orders
            .iter()
            .filter(|order| {
                filter.user_id.map_or(true, |id| order.user_id == id)
                    && filter.status.map_or(true, |status| order.status == status)
                    && filter.exchange_id.map_or(true, |id| order.exchange_id == id)
                    && filter
                        .is_testnet
                        .map_or(true, |testnet| order.is_testnet == testnet)
                    && filter
                        .symbol
                        .as_ref()
                        .map_or(true, |symbol| &order.symbol == symbol)
            })
            .cloned()
            .collect())
    }

    fn atomic_transition(
        &self,
        id: i64,
        expected: &[OrderStatus],
        changes: OrderChanges,
    ) -> Result<Option<Order>> {
        let now = datetime_from_ms(self.clock.now_ms());
        let mut inner = self.lock()?;
        let order = match inner.orders.iter_mut().find(|order| order.id == id) {
            Some(order) => order,
            None => return Err(Error::new(format!("order {id} not found"))),
        };
        if !expected.contains(&order.status) {
            return Ok(None);
        }
        apply_changes(order, &changes, now);
        Ok(Some(order.clone()))
    }

    fn patch(&self, id: i64, patch: OrderPatch) -> Result<Option<Order>> {
        let now = datetime_from_ms(self.clock.now_ms());
        let mut inner = self.lock()?;
        let order = match inner.orders.iter_mut().find(|order| order.id == id) {
            Some(order) => order,
            None => return Err(Error::new(format!("order {id} not found"))),
        };
        if order.status.is_terminal() || order.status == OrderStatus::InExecution {
            return Ok(None);
        }
        apply_patch(order, &patch, now);
        Ok(Some(order.clone()))
    }

    fn split(
        &self,
        id: i64,
        expected: OrderStatus,
        original: OrderChanges,
        sibling: NewOrder,
    ) -> Result<Option<(Order, Order)>> {
        let now = datetime_from_ms(self.clock.now_ms());
        let mut inner = self.lock()?;
        let index = match inner.orders.iter().position(|order| order.id == id) {
            Some(index) => index,
            None => return Err(Error::new(format!("order {id} not found"))),
        };
        if inner.orders[index].status != expected {
            return Ok(None);
        }
        apply_changes(&mut inner.orders[index], &original, now);
        let updated = inner.orders[index].clone();

        let sibling_id = inner.next_id;
        inner.next_id += 1;
        let sibling_row = self.materialize(sibling, sibling_id);
        inner.orders.push(sibling_row.clone());
        Ok(Some((updated, sibling_row)))
    }

    fn list_exchanges(&self) -> Result<Vec<ExchangeRef>> {
        let inner = self.lock()?;
        Ok(inner.exchanges.clone())
    }
}
