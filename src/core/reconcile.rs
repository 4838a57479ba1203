use crate::app::metrics;
use crate::core::notify::{format_transition, Notifier};
use crate::core::rounding::{floor_to_step, meets_min_notional, round_to_tick};
use crate::core::Clock;
use crate::exchange::filters::{FilterCache, FilterKey};
use crate::exchange::registry::AdapterProvider;
use crate::exchange::Exchange;
use crate::models::{Balance, Order, OrderStatus};
use crate::storage::{datetime_from_ms, OrderChanges, OrderRepository};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ReconcilerParams {
    pub stale_threshold_secs: u64,
    pub sell_epsilon: Decimal,
}

/// Slow-tick worker that corrects drift between stored state and the
/// exchange: stale critical sections, take-profits that filled or were
/// cancelled behind our back, positions sold outside the engine.
pub struct Reconciler {
    params: ReconcilerParams,
    repository: Arc<dyn OrderRepository>,
    adapters: Arc<dyn AdapterProvider>,
    filters: Arc<FilterCache>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        params: ReconcilerParams,
        repository: Arc<dyn OrderRepository>,
        adapters: Arc<dyn AdapterProvider>,
        filters: Arc<FilterCache>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            params,
            repository,
            adapters,
            filters,
            notifier,
            clock,
        }
    }

    pub fn sweep(&self) {
        metrics::inc_reconcile_sweep();
        let orders = match self.repository.list_non_terminal() {
            Ok(orders) => orders,
            Err(err) => {
                warn!(error = %err, "sweep suspended: repository unavailable");
                return;
            }
        };
        for order in orders {
            let result = match order.status {
                OrderStatus::InExecution => self.sweep_stale(&order),
                OrderStatus::Executed => self.sweep_executed(&order),
                _ => Ok(()),
            };
            if let Err(err) = result {
                warn!(order_id = order.id, error = %err, "reconciliation deferred");
            }
        }
    }

    /// An order stuck IN_EXECUTION past the threshold was abandoned by a
    /// crashed or failed worker. The wallet decides which way it resolves.
    fn sweep_stale(&self, order: &Order) -> Result<()> {
        let age_ms = self
            .clock
            .now_ms()
            .saturating_sub(order.updated_at.timestamp_millis());
        if age_ms < (self.params.stale_threshold_secs as i64).saturating_mul(1000) {
            return Ok(());
        }
        let adapter = self.adapters.adapter_for(order)?;
        let base = adapter.balance(order.base_asset()).map_err(Error::from)?;
        let expected_min = order.quantity * (Decimal::ONE - self.params.sell_epsilon);

        if base.total() >= expected_min {
            let executed_price = match order.executed_price {
                Some(price) => price,
                None => adapter.spot_price(&order.symbol).map_err(Error::from)?,
            };
            let mut changes = OrderChanges::to(OrderStatus::Executed).executed_price(executed_price);
            if order.executed_at.is_none() {
                changes = changes.executed_at(datetime_from_ms(self.clock.now_ms()));
            }
            if let Some(recovered) =
                self.repository
                    .atomic_transition(order.id, &[OrderStatus::InExecution], changes)?
            {
                info!(order_id = order.id, "stale order recovered as EXECUTED");
                self.notify(&recovered, "EXECUTED (reconciled)", Some(executed_price));
            }
        } else if self
            .repository
            .atomic_transition(
                order.id,
                &[OrderStatus::InExecution],
                OrderChanges::to(OrderStatus::Pending),
            )?
            .is_some()
        {
            info!(order_id = order.id, "stale order restored to PENDING");
        }
        Ok(())
    }

    fn sweep_executed(&self, order: &Order) -> Result<()> {
        let adapter = self.adapters.adapter_for(order)?;
        let base = adapter.balance(order.base_asset()).map_err(Error::from)?;
        let expected_min = order.quantity * (Decimal::ONE - self.params.sell_epsilon);

        if let Some(tp_order_id) = &order.tp_order_id {
            let open_orders = adapter
                .list_open_orders(&order.symbol)
                .map_err(Error::from)?;
            let still_open = open_orders.iter().any(|open| &open.order_id == tp_order_id);
            if !still_open {
                if base.total() < expected_min {
                    if let Some(closed) = self.repository.atomic_transition(
                        order.id,
                        &[OrderStatus::Executed],
                        OrderChanges::to(OrderStatus::ClosedTp)
                            .closed_at(datetime_from_ms(self.clock.now_ms())),
                    )? {
                        metrics::inc_closed();
                        self.notify(&closed, "CLOSED_TP", order.take_profit);
                    }
                    return Ok(());
                }
                return self.replace_tp(order, adapter.as_ref(), &base);
            }
        }

        if base.total() < expected_min {
            if let Some(tp_order_id) = &order.tp_order_id {
                let _ = adapter.cancel_order(&order.symbol, tp_order_id);
            }
            if let Some(closed) = self.repository.atomic_transition(
                order.id,
                &[OrderStatus::Executed],
                OrderChanges::to(OrderStatus::ClosedExternally)
                    .closed_at(datetime_from_ms(self.clock.now_ms())),
            )? {
                metrics::inc_closed();
                self.notify(&closed, "CLOSED_EXTERNALLY", None);
            }
        }
        Ok(())
    }

    /// The position is intact but its resting sell is gone: someone
    /// cancelled it on the exchange. Put it back, validated the same way
    /// an edit would be.
    fn replace_tp(&self, order: &Order, adapter: &dyn Exchange, base: &Balance) -> Result<()> {
        let take_profit = match order.take_profit {
            Some(take_profit) => take_profit,
            None => {
                self.repository.atomic_transition(
                    order.id,
                    &[OrderStatus::Executed],
                    OrderChanges::to(OrderStatus::Executed).tp_order_id(None),
                )?;
                return Ok(());
            }
        };
        let key = FilterKey::for_order(order);
        let filters = self.filters.get(&key, adapter).map_err(Error::from)?;
        let basis = order.quantity.min(base.free);
        let tp_qty = floor_to_step(
            basis * (Decimal::ONE - self.params.sell_epsilon),
            filters.lot_step,
        );
        let tp_price = round_to_tick(take_profit, filters.tick_size);
        if tp_qty <= Decimal::ZERO || !meets_min_notional(tp_qty, tp_price, filters.min_notional) {
            warn!(
                order_id = order.id,
                "re-placed take-profit would be below min notional; leaving stop-loss only"
            );
            self.repository.atomic_transition(
                order.id,
                &[OrderStatus::Executed],
                OrderChanges::to(OrderStatus::Executed).tp_order_id(None),
            )?;
            return Ok(());
        }
        let ack = adapter
            .place_limit_sell(&order.symbol, tp_qty, tp_price)
            .map_err(Error::from)?;
        if let Some(updated) = self.repository.atomic_transition(
            order.id,
            &[OrderStatus::Executed],
            OrderChanges::to(OrderStatus::Executed).tp_order_id(Some(ack.order_id.clone())),
        )? {
            info!(
                order_id = order.id,
                tp_order_id = %ack.order_id,
                "externally cancelled take-profit re-placed"
            );
            self.notify(&updated, "TP_REPLACED", Some(tp_price));
        } else {
            // The engine grabbed the order in between; its next pass will
            // see the fresh tp_order_id missing and settle it.
            warn!(order_id = order.id, "re-placed take-profit could not be recorded");
        }
        Ok(())
    }

    fn notify(&self, order: &Order, transition: &str, price: Option<Decimal>) {
        let message = format_transition(
            order,
            transition,
            price,
            order.quantity,
            datetime_from_ms(self.clock.now_ms()),
        );
        self.notifier.notify(order.user_id, &message);
        metrics::inc_notification();
    }
}
