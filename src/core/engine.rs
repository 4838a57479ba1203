use crate::app::metrics;
use crate::core::notify::{format_transition, Notifier};
use crate::core::rounding::{floor_to_step, meets_min_notional, round_to_tick};
use crate::core::triggers::{entry_trigger, stop_trigger, EntryDecision, StopDecision};
use crate::core::Clock;
use crate::exchange::filters::{FilterCache, FilterKey};
use crate::exchange::registry::AdapterProvider;
use crate::exchange::{AdapterError, Exchange};
use crate::models::{Interval, Order, OrderStatus, Side, SymbolFilters};
use crate::storage::{datetime_from_ms, NewOrder, OrderChanges, OrderFilter, OrderRepository};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

const FILTER_STRIKE_LIMIT: u32 = 2;
const BALANCE_NOTICE_INTERVAL_MS: i64 = 24 * 3600 * 1000;

#[derive(Clone, Debug)]
pub struct EngineParams {
    pub worker_pool: usize,
    pub fee_margin: Decimal,
    pub sell_epsilon: Decimal,
}

/// A user's declarative plan, as handed in by the hosting application.
#[derive(Clone, Debug)]
pub struct OrderPlan {
    pub user_id: i64,
    pub exchange_id: i32,
    pub api_key_id: i64,
    pub is_testnet: bool,
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub max_entry: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub entry_interval: Interval,
    pub stop_interval: Interval,
}

/// Editable fields of a live plan. `Option<Option<_>>` distinguishes
/// "leave alone" from "clear".
#[derive(Clone, Debug, Default)]
pub struct OrderUpdate {
    pub entry_price: Option<Decimal>,
    pub max_entry: Option<Decimal>,
    pub take_profit: Option<Option<Decimal>>,
    pub stop_loss: Option<Option<Decimal>>,
    pub entry_interval: Option<Interval>,
    pub stop_interval: Option<Interval>,
}

#[derive(Clone, Debug)]
pub struct SplitParams {
    pub split_qty: Decimal,
    pub tp1: Option<Decimal>,
    pub sl1: Option<Decimal>,
    pub tp2: Option<Decimal>,
    pub sl2: Option<Decimal>,
}

/// Per-order state machine. Workers cooperate through the repository's
/// IN_EXECUTION compare-and-set, never through in-memory locks; no lock is
/// held across an adapter call.
pub struct Engine {
    params: EngineParams,
    repository: Arc<dyn OrderRepository>,
    adapters: Arc<dyn AdapterProvider>,
    filters: Arc<FilterCache>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    paused_keys: Mutex<HashSet<i64>>,
    filter_strikes: Mutex<HashMap<i64, u32>>,
    balance_notice: Mutex<HashMap<i64, i64>>,
}

impl Engine {
    pub fn new(
        params: EngineParams,
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
            paused_keys: Mutex::new(HashSet::new()),
            filter_strikes: Mutex::new(HashMap::new()),
            balance_notice: Mutex::new(HashMap::new()),
        }
    }

    /// One fast tick: every non-terminal order is offered to a bounded
    /// worker pool. A repository outage suspends the tick entirely.
    pub fn tick(&self) {
        metrics::inc_engine_tick();
        let orders = match self.repository.list_non_terminal() {
            Ok(orders) => orders,
            Err(err) => {
                warn!(error = %err, "tick suspended: repository unavailable");
                return;
            }
        };
        if orders.is_empty() {
            return;
        }
        let workers = self.params.worker_pool.min(orders.len()).max(1);
        let queue: Mutex<VecDeque<Order>> = Mutex::new(orders.into());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = match queue.lock() {
                        Ok(mut guard) => guard.pop_front(),
                        Err(_) => None,
                    };
                    match next {
                        Some(order) => self.process_order(&order),
                        None => break,
                    }
                });
            }
        });
    }

    fn process_order(&self, order: &Order) {
        let prior = order.status;
        if prior != OrderStatus::Pending && prior != OrderStatus::Executed {
            // IN_EXECUTION rows belong to another worker or, if stale, to
            // the reconciliation sweep.
            return;
        }
        if self.is_paused(order.api_key_id) {
            debug!(order_id = order.id, "credentials paused; order skipped");
            return;
        }
        let claimed = match self.repository.atomic_transition(
            order.id,
            &[prior],
            OrderChanges::to(OrderStatus::InExecution),
        ) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                metrics::inc_conflict();
                return;
            }
            Err(err) => {
                warn!(order_id = order.id, error = %err, "claim failed");
                return;
            }
        };
        let result = match prior {
            OrderStatus::Pending => self.drive_pending(&claimed),
            _ => self.drive_executed(&claimed),
        };
        if let Err(err) = result {
            // Left IN_EXECUTION on purpose; the stale sweep reconciles it
            // against exchange state.
            metrics::inc_order_error();
            warn!(order_id = claimed.id, error = %err, "order left IN_EXECUTION for reconciliation");
        }
    }

    fn drive_pending(&self, order: &Order) -> Result<()> {
        let adapter = match self.adapters.adapter_for(order) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(order_id = order.id, error = %err, "no adapter for order");
                return self.restore(order.id, OrderStatus::Pending);
            }
        };
        match entry_trigger(order, adapter.as_ref()) {
            Ok(EntryDecision::Wait) => self.restore(order.id, OrderStatus::Pending),
            Ok(EntryDecision::Cancel) => self.finish_cancelled(order, "max entry exceeded"),
            Ok(EntryDecision::Fire) => self.place_entry(order, adapter.as_ref()),
            Err(err) => self.handle_adapter_error(order, OrderStatus::Pending, err, "entry trigger"),
        }
    }

    fn place_entry(&self, order: &Order, adapter: &dyn Exchange) -> Result<()> {
        let key = FilterKey::for_order(order);
        let filters = match self.filters.get(&key, adapter) {
            Ok(filters) => filters,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Pending, err, "symbol filters")
            }
        };
        let qty = floor_to_step(order.quantity, filters.lot_step);
        if qty <= Decimal::ZERO {
            warn!(order_id = order.id, "quantity floors to zero; entry deferred");
            return self.restore(order.id, OrderStatus::Pending);
        }
        let price = match adapter.spot_price(&order.symbol) {
            Ok(price) => price,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Pending, err, "spot price")
            }
        };
        if !meets_min_notional(qty, price, filters.min_notional) {
            // Not a cancellation: the price or the plan may move back over
            // the threshold before the next tick.
            info!(
                order_id = order.id,
                symbol = %order.symbol,
                "entry value below min notional; retrying next tick"
            );
            return self.restore(order.id, OrderStatus::Pending);
        }
        let quote = match adapter.balance(order.quote_asset()) {
            Ok(balance) => balance,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Pending, err, "quote balance")
            }
        };
        let required = qty * price * (Decimal::ONE + self.params.fee_margin);
        if quote.free < required {
            self.notify_insufficient(order, required);
            return self.restore(order.id, OrderStatus::Pending);
        }

        let fill = match adapter.place_market_buy(&order.symbol, qty) {
            Ok(fill) => fill,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Pending, err, "market buy")
            }
        };
        self.clear_filter_strikes(order.id);
        let executed_price = fill.avg_fill_price.unwrap_or(price);
        let now = self.now_dt();

        // EXECUTED is committed before the take-profit goes out, so a crash
        // in between leaves a position reconciliation can finish.
        let executed = match self.repository.atomic_transition(
            order.id,
            &[OrderStatus::InExecution],
            OrderChanges::to(OrderStatus::Executed)
                .executed_price(executed_price)
                .executed_at(now),
        )? {
            Some(executed) => executed,
            None => {
                return Err(Error::new(format!(
                    "order {} lost its critical section after fill",
                    order.id
                )))
            }
        };
        metrics::inc_executed();
        self.notify_transition(&executed, "EXECUTED", Some(executed_price), fill.filled_qty);

        if executed.take_profit.is_some() {
            if let Some(tp_order_id) =
                self.install_tp(&executed, adapter, &filters, fill.filled_qty)
            {
                let committed = self.repository.atomic_transition(
                    executed.id,
                    &[OrderStatus::Executed],
                    OrderChanges::to(OrderStatus::Executed).tp_order_id(Some(tp_order_id.clone())),
                )?;
                if committed.is_none() {
                    warn!(
                        order_id = executed.id,
                        tp_order_id = %tp_order_id,
                        "take-profit placed but order moved on; reconciliation will settle it"
                    );
                }
            }
        }
        Ok(())
    }

    fn install_tp(
        &self,
        order: &Order,
        adapter: &dyn Exchange,
        filters: &SymbolFilters,
        qty_basis: Decimal,
    ) -> Option<String> {
        let take_profit = order.take_profit?;
        let tp_qty = floor_to_step(
            qty_basis * (Decimal::ONE - self.params.sell_epsilon),
            filters.lot_step,
        );
        let tp_price = round_to_tick(take_profit, filters.tick_size);
        if tp_qty <= Decimal::ZERO || !meets_min_notional(tp_qty, tp_price, filters.min_notional) {
            warn!(
                order_id = order.id,
                symbol = %order.symbol,
                "take-profit below min notional; running stop-loss only"
            );
            return None;
        }
        match adapter.place_limit_sell(&order.symbol, tp_qty, tp_price) {
            Ok(ack) => Some(ack.order_id),
            Err(err) => {
                if matches!(err, AdapterError::FilterViolation(_)) {
                    self.filters.evict(&FilterKey::for_order(order));
                }
                warn!(order_id = order.id, error = %err, "take-profit placement failed; will retry next tick");
                None
            }
        }
    }

    fn drive_executed(&self, order: &Order) -> Result<()> {
        let adapter = match self.adapters.adapter_for(order) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(order_id = order.id, error = %err, "no adapter for order");
                return self.restore(order.id, OrderStatus::Executed);
            }
        };
        let base = match adapter.balance(order.base_asset()) {
            Ok(balance) => balance,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Executed, err, "base balance")
            }
        };
        let expected_min = order.quantity * (Decimal::ONE - self.params.sell_epsilon);

        if order.stop_loss.is_some() {
            match stop_trigger(order, adapter.as_ref()) {
                Ok(StopDecision::Hit) => return self.exit_stop_loss(order, adapter.as_ref()),
                Ok(StopDecision::Hold) => {}
                Err(err) => {
                    return self.handle_adapter_error(
                        order,
                        OrderStatus::Executed,
                        err,
                        "stop trigger",
                    )
                }
            }
        }

        if let Some(tp_order_id) = &order.tp_order_id {
            match adapter.list_open_orders(&order.symbol) {
                Ok(open_orders) => {
                    let still_open = open_orders
                        .iter()
                        .any(|open| &open.order_id == tp_order_id);
                    if !still_open {
                        if base.total() < expected_min {
                            return self.finish_closed(
                                order,
                                OrderStatus::ClosedTp,
                                "CLOSED_TP",
                                order.take_profit,
                                order.quantity,
                            );
                        }
                        // Balance intact: the resting sell was cancelled
                        // behind our back. The reconciler re-pegs it.
                        debug!(
                            order_id = order.id,
                            tp_order_id = %tp_order_id,
                            "take-profit missing but balance intact"
                        );
                    }
                }
                Err(err) => {
                    return self.handle_adapter_error(
                        order,
                        OrderStatus::Executed,
                        err,
                        "open orders",
                    )
                }
            }
        }

        if base.total() < expected_min {
            if let Some(tp_order_id) = &order.tp_order_id {
                let _ = adapter.cancel_order(&order.symbol, tp_order_id);
            }
            return self.finish_closed(
                order,
                OrderStatus::ClosedExternally,
                "CLOSED_EXTERNALLY",
                None,
                order.quantity,
            );
        }

        let mut changes = OrderChanges::to(OrderStatus::Executed);
        if order.take_profit.is_some() && order.tp_order_id.is_none() {
            let key = FilterKey::for_order(order);
            if let Ok(filters) = self.filters.get(&key, adapter.as_ref()) {
                let basis = order.quantity.min(base.free);
                if let Some(tp_order_id) = self.install_tp(order, adapter.as_ref(), &filters, basis)
                {
                    changes = changes.tp_order_id(Some(tp_order_id));
                }
            }
        }
        match self
            .repository
            .atomic_transition(order.id, &[OrderStatus::InExecution], changes)?
        {
            Some(_) => Ok(()),
            None => Err(Error::new(format!(
                "order {} lost its critical section during restore",
                order.id
            ))),
        }
    }

    fn exit_stop_loss(&self, order: &Order, adapter: &dyn Exchange) -> Result<()> {
        if let Some(tp_order_id) = &order.tp_order_id {
            match adapter.cancel_order(&order.symbol, tp_order_id) {
                Ok(_) | Err(AdapterError::NotFound(_)) => {}
                Err(err) => {
                    return self.handle_adapter_error(
                        order,
                        OrderStatus::Executed,
                        err,
                        "cancel take-profit",
                    )
                }
            }
        }
        // The cancel may have just unlocked the base asset; read again.
        let free = match adapter.balance(order.base_asset()) {
            Ok(balance) => balance.free,
            Err(err) => {
                return self.handle_adapter_error(order, OrderStatus::Executed, err, "base balance")
            }
        };
        let key = FilterKey::for_order(order);
        let filters = match self.filters.get(&key, adapter) {
            Ok(filters) => filters,
            Err(err) => {
                return self.handle_adapter_error(
                    order,
                    OrderStatus::Executed,
                    err,
                    "symbol filters",
                )
            }
        };
        let sell_qty = floor_to_step(order.quantity.min(free), filters.lot_step);
        if sell_qty <= Decimal::ZERO {
            return self.finish_closed(
                order,
                OrderStatus::ClosedExternally,
                "CLOSED_EXTERNALLY",
                None,
                order.quantity,
            );
        }
        match adapter.place_market_sell(&order.symbol, sell_qty) {
            Ok(_) => self.finish_closed(
                order,
                OrderStatus::ClosedSl,
                "CLOSED_SL",
                order.stop_loss,
                sell_qty,
            ),
            Err(err) => {
                self.handle_adapter_error(order, OrderStatus::Executed, err, "stop-loss sell")
            }
        }
    }

    fn handle_adapter_error(
        &self,
        order: &Order,
        prior: OrderStatus,
        err: AdapterError,
        stage: &str,
    ) -> Result<()> {
        metrics::inc_adapter_error();
        if err.is_retryable() {
            debug!(order_id = order.id, stage, error = %err, "retrying next tick");
            return self.restore(order.id, prior);
        }
        match err {
            AdapterError::Auth(message) => {
                warn!(order_id = order.id, stage, message = %message, "credentials rejected");
                self.pause(order.api_key_id);
                self.adapters
                    .invalidate(order.user_id, order.exchange_id, order.is_testnet);
                self.finish_cancelled(order, "auth")
            }
            AdapterError::InsufficientBalance(message) => {
                debug!(order_id = order.id, stage, message = %message, "insufficient balance");
                self.notify_insufficient(order, Decimal::ZERO);
                self.restore(order.id, prior)
            }
            AdapterError::FilterViolation(message) => {
                warn!(order_id = order.id, stage, message = %message, "filter violation");
                self.filters.evict(&FilterKey::for_order(order));
                let strikes = self.record_filter_strike(order.id);
                if strikes >= FILTER_STRIKE_LIMIT {
                    self.clear_filter_strikes(order.id);
                    self.finish_cancelled(order, "filter")
                } else {
                    self.restore(order.id, prior)
                }
            }
            AdapterError::NotFound(message) => {
                warn!(order_id = order.id, stage, message = %message, "venue reported not found");
                self.restore(order.id, prior)
            }
            _ => self.restore(order.id, prior),
        }
    }

    // ----- user-initiated operations -----

    pub fn create_order(&self, plan: OrderPlan) -> Result<Order> {
        validate_plan(&plan)?;
        if plan.entry_interval != Interval::Market {
            if let Some(take_profit) = plan.take_profit {
                // A plan whose trigger candle already closed at the target
                // would buy and instantly sell; refuse it up front. The
                // check is best-effort: adapter trouble never blocks entry.
                if let Ok(adapter) =
                    self.adapters
                        .adapter(plan.user_id, plan.exchange_id, plan.is_testnet)
                {
                    if let Ok(candle) =
                        adapter.last_closed_candle(&plan.symbol, plan.entry_interval)
                    {
                        if candle.close >= take_profit {
                            return Err(Error::new(format!(
                                "previous {} candle ({}) is already at the take-profit",
                                plan.entry_interval.as_str(),
                                candle.close
                            )));
                        }
                    }
                }
            }
        }
        let inserted = self.repository.insert(NewOrder {
            user_id: plan.user_id,
            exchange_id: plan.exchange_id,
            api_key_id: plan.api_key_id,
            is_testnet: plan.is_testnet,
            symbol: plan.symbol,
            side: Side::Long,
            quantity: plan.quantity,
            status: OrderStatus::Pending,
            entry_price: plan.entry_price,
            max_entry: plan.max_entry,
            take_profit: plan.take_profit,
            stop_loss: plan.stop_loss,
            entry_interval: plan.entry_interval,
            stop_interval: plan.stop_interval,
            executed_price: None,
            executed_at: None,
            tp_order_id: None,
        })?;
        info!(order_id = inserted.id, user_id = inserted.user_id, symbol = %inserted.symbol, "order created");

        if inserted.entry_interval == Interval::Market {
            // Market plans run through the normal claim path right away.
            if let Some(claimed) = self.repository.atomic_transition(
                inserted.id,
                &[OrderStatus::Pending],
                OrderChanges::to(OrderStatus::InExecution),
            )? {
                if let Err(err) = self.drive_pending(&claimed) {
                    warn!(order_id = inserted.id, error = %err, "immediate execution interrupted");
                }
            }
            return self
                .repository
                .load(inserted.id)?
                .ok_or_else(|| Error::new("order vanished after insert"));
        }
        Ok(inserted)
    }

    pub fn update_order(&self, id: i64, update: OrderUpdate) -> Result<Order> {
        let current = self
            .repository
            .load(id)?
            .ok_or_else(|| Error::new(format!("order {id} not found")))?;
        if current.status.is_terminal() {
            return Err(Error::new("cannot edit a closed order"));
        }
        if current.status == OrderStatus::InExecution {
            return Err(Error::new("order is busy; retry shortly"));
        }
        let mut merged = current.clone();
        merge_update(&mut merged, &update);
        validate_invariants(&merged)?;
        let sl_changed = update.stop_loss.is_some() || update.stop_interval.is_some();

        match current.status {
            OrderStatus::Pending => {
                // Status-guarded write: if the entry fired in the meantime
                // the edit must not land without a re-peg.
                let mut changes = OrderChanges::to(OrderStatus::Pending);
                if let Some(value) = update.entry_price {
                    changes = changes.entry_price(value);
                }
                if let Some(value) = update.max_entry {
                    changes = changes.max_entry(value);
                }
                if let Some(value) = &update.take_profit {
                    changes = changes.take_profit(*value);
                }
                if let Some(value) = &update.stop_loss {
                    changes = changes.stop_loss(*value);
                }
                if let Some(value) = update.entry_interval {
                    changes = changes.entry_interval(value);
                }
                if let Some(value) = update.stop_interval {
                    changes = changes.stop_interval(value);
                }
                if sl_changed {
                    changes = changes.sl_updated_at(self.now_dt());
                }
                self.repository
                    .atomic_transition(id, &[OrderStatus::Pending], changes)?
                    .ok_or_else(|| Error::new("order is busy; retry shortly"))
            }
            OrderStatus::Executed => {
                let claimed = self
                    .repository
                    .atomic_transition(
                        id,
                        &[OrderStatus::Executed],
                        OrderChanges::to(OrderStatus::InExecution),
                    )?
                    .ok_or_else(|| Error::new("order is busy; retry shortly"))?;
                match self.repeg_executed(&claimed, &update, sl_changed) {
                    Ok(order) => Ok(order),
                    Err(err) => {
                        let _ = self.restore(id, OrderStatus::Executed);
                        Err(err)
                    }
                }
            }
            _ => Err(Error::new("order is busy; retry shortly")),
        }
    }

    /// Validation happens against the new take-profit before the resting
    /// order is touched: an unplaceable edit leaves the old TP live.
    fn repeg_executed(
        &self,
        order: &Order,
        update: &OrderUpdate,
        sl_changed: bool,
    ) -> Result<Order> {
        let mut new_tp_order_id: Option<Option<String>> = None;
        if let Some(new_take_profit) = &update.take_profit {
            let adapter = self.adapters.adapter_for(order)?;
            match new_take_profit {
                Some(take_profit) => {
                    let key = FilterKey::for_order(order);
                    let filters = self.filters.get(&key, adapter.as_ref()).map_err(Error::from)?;
                    let tp_qty = floor_to_step(
                        order.quantity * (Decimal::ONE - self.params.sell_epsilon),
                        filters.lot_step,
                    );
                    let tp_price = round_to_tick(*take_profit, filters.tick_size);
                    if tp_qty <= Decimal::ZERO
                        || !meets_min_notional(tp_qty, tp_price, filters.min_notional)
                    {
                        return Err(Error::new(
                            "new take-profit is below the minimum order value; nothing changed",
                        ));
                    }
                    if let Some(old) = &order.tp_order_id {
                        match adapter.cancel_order(&order.symbol, old) {
                            Ok(_) | Err(AdapterError::NotFound(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                    match adapter.place_limit_sell(&order.symbol, tp_qty, tp_price) {
                        Ok(ack) => new_tp_order_id = Some(Some(ack.order_id)),
                        Err(err) => {
                            // The old TP is already gone; commit the new
                            // target and let the next tick place it.
                            warn!(order_id = order.id, error = %err, "re-peg placement failed; retrying next tick");
                            new_tp_order_id = Some(None);
                        }
                    }
                }
                None => {
                    if let Some(old) = &order.tp_order_id {
                        let _ = adapter.cancel_order(&order.symbol, old);
                    }
                    new_tp_order_id = Some(None);
                }
            }
        }

        let mut changes = OrderChanges::to(OrderStatus::Executed);
        if let Some(value) = update.entry_price {
            changes = changes.entry_price(value);
        }
        if let Some(value) = update.max_entry {
            changes = changes.max_entry(value);
        }
        if let Some(value) = &update.take_profit {
            changes = changes.take_profit(*value);
        }
        if let Some(value) = &update.stop_loss {
            changes = changes.stop_loss(*value);
        }
        if let Some(value) = update.entry_interval {
            changes = changes.entry_interval(value);
        }
        if let Some(value) = update.stop_interval {
            changes = changes.stop_interval(value);
        }
        if sl_changed {
            changes = changes.sl_updated_at(self.now_dt());
        }
        if let Some(tp_order_id) = new_tp_order_id {
            changes = changes.tp_order_id(tp_order_id);
        }
        self.repository
            .atomic_transition(order.id, &[OrderStatus::InExecution], changes)?
            .ok_or_else(|| Error::new(format!("order {} lost its critical section", order.id)))
    }

    pub fn cancel_order(&self, id: i64) -> Result<Order> {
        let current = self
            .repository
            .load(id)?
            .ok_or_else(|| Error::new(format!("order {id} not found")))?;
        if current.status != OrderStatus::Pending {
            return Err(Error::new("only PENDING orders can be cancelled"));
        }
        let cancelled = self
            .repository
            .atomic_transition(
                id,
                &[OrderStatus::Pending],
                OrderChanges::to(OrderStatus::Cancelled).closed_at(self.now_dt()),
            )?
            .ok_or_else(|| Error::new("order is busy; retry shortly"))?;
        metrics::inc_cancelled();
        self.notify_transition(&cancelled, "CANCELLED (user)", None, cancelled.quantity);
        Ok(cancelled)
    }

    pub fn close_position(&self, id: i64) -> Result<Order> {
        let current = self
            .repository
            .load(id)?
            .ok_or_else(|| Error::new(format!("order {id} not found")))?;
        if current.status != OrderStatus::Executed {
            return Err(Error::new("only EXECUTED orders can be closed"));
        }
        let claimed = self
            .repository
            .atomic_transition(
                id,
                &[OrderStatus::Executed],
                OrderChanges::to(OrderStatus::InExecution),
            )?
            .ok_or_else(|| Error::new("order is busy; retry shortly"))?;
        match self.do_close(&claimed) {
            Ok(order) => Ok(order),
            Err(err) => {
                let _ = self.restore(id, OrderStatus::Executed);
                Err(err)
            }
        }
    }

    fn do_close(&self, order: &Order) -> Result<Order> {
        let adapter = self.adapters.adapter_for(order)?;
        if let Some(tp_order_id) = &order.tp_order_id {
            let _ = adapter.cancel_order(&order.symbol, tp_order_id);
        }
        let free = adapter
            .balance(order.base_asset())
            .map_err(Error::from)?
            .free;
        let key = FilterKey::for_order(order);
        let filters = self.filters.get(&key, adapter.as_ref()).map_err(Error::from)?;
        if free < filters.lot_step {
            let closed = self
                .repository
                .atomic_transition(
                    order.id,
                    &[OrderStatus::InExecution],
                    OrderChanges::to(OrderStatus::ClosedExternally).closed_at(self.now_dt()),
                )?
                .ok_or_else(|| Error::new("close commit failed"))?;
            metrics::inc_closed();
            self.notify_transition(&closed, "CLOSED_EXTERNALLY", None, order.quantity);
            return Ok(closed);
        }
        let sell_qty = floor_to_step(order.quantity.min(free), filters.lot_step);
        adapter
            .place_market_sell(&order.symbol, sell_qty)
            .map_err(Error::from)?;
        let closed = self
            .repository
            .atomic_transition(
                order.id,
                &[OrderStatus::InExecution],
                OrderChanges::to(OrderStatus::ClosedManual).closed_at(self.now_dt()),
            )?
            .ok_or_else(|| Error::new("close commit failed"))?;
        metrics::inc_closed();
        self.notify_transition(&closed, "CLOSED_MANUAL", order.executed_price, sell_qty);
        Ok(closed)
    }

    pub fn split_order(&self, id: i64, params: SplitParams) -> Result<(Order, Order)> {
        let current = self
            .repository
            .load(id)?
            .ok_or_else(|| Error::new(format!("order {id} not found")))?;
        if current.status != OrderStatus::Executed {
            return Err(Error::new("only EXECUTED orders can be split"));
        }
        if params.split_qty <= Decimal::ZERO || params.split_qty >= current.quantity {
            return Err(Error::new("split quantity must fall inside the position"));
        }
        validate_targets(&current, params.tp1, params.sl1)?;
        validate_targets(&current, params.tp2, params.sl2)?;
        let claimed = self
            .repository
            .atomic_transition(
                id,
                &[OrderStatus::Executed],
                OrderChanges::to(OrderStatus::InExecution),
            )?
            .ok_or_else(|| Error::new("order is busy; retry shortly"))?;
        match self.do_split(&claimed, &params) {
            Ok(pair) => Ok(pair),
            Err(err) => {
                let _ = self.restore(id, OrderStatus::Executed);
                Err(err)
            }
        }
    }

    fn do_split(&self, order: &Order, params: &SplitParams) -> Result<(Order, Order)> {
        let adapter = self.adapters.adapter_for(order)?;
        let key = FilterKey::for_order(order);
        let filters = self.filters.get(&key, adapter.as_ref()).map_err(Error::from)?;
        let qty1 = params.split_qty;
        let qty2 = order.quantity - params.split_qty;

        // Both legs must be placeable before the old take-profit is pulled.
        for (qty, take_profit) in [(qty1, params.tp1), (qty2, params.tp2)] {
            if let Some(take_profit) = take_profit {
                let tp_qty = floor_to_step(
                    qty * (Decimal::ONE - self.params.sell_epsilon),
                    filters.lot_step,
                );
                let tp_price = round_to_tick(take_profit, filters.tick_size);
                if tp_qty <= Decimal::ZERO
                    || !meets_min_notional(tp_qty, tp_price, filters.min_notional)
                {
                    return Err(Error::new(
                        "a split leg is below the minimum order value; nothing changed",
                    ));
                }
            }
        }

        if let Some(old) = &order.tp_order_id {
            match adapter.cancel_order(&order.symbol, old) {
                Ok(_) | Err(AdapterError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut leg = order.clone();
        leg.quantity = qty1;
        leg.take_profit = params.tp1;
        let tp_id1 = self.install_tp(&leg, adapter.as_ref(), &filters, qty1);
        leg.quantity = qty2;
        leg.take_profit = params.tp2;
        let tp_id2 = self.install_tp(&leg, adapter.as_ref(), &filters, qty2);

        let original = OrderChanges::to(OrderStatus::Executed)
            .quantity(qty1)
            .take_profit(params.tp1)
            .stop_loss(params.sl1)
            .sl_updated_at(self.now_dt())
            .tp_order_id(tp_id1);
        let sibling = NewOrder {
            user_id: order.user_id,
            exchange_id: order.exchange_id,
            api_key_id: order.api_key_id,
            is_testnet: order.is_testnet,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: qty2,
            status: OrderStatus::Executed,
            entry_price: order.entry_price,
            max_entry: order.max_entry,
            take_profit: params.tp2,
            stop_loss: params.sl2,
            entry_interval: order.entry_interval,
            stop_interval: order.stop_interval,
            executed_price: order.executed_price,
            executed_at: order.executed_at,
            tp_order_id: tp_id2,
        };
        let (updated, inserted) = self
            .repository
            .split(order.id, OrderStatus::InExecution, original, sibling)?
            .ok_or_else(|| Error::new("split commit failed"))?;
        info!(
            order_id = updated.id,
            sibling_id = inserted.id,
            "position split"
        );
        self.notify_transition(&updated, "SPLIT", order.executed_price, updated.quantity);
        Ok((updated, inserted))
    }

    pub fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        self.repository.list_by(filter)
    }

    /// Clears the auth pause after the user replaced their credentials.
    pub fn resume_credentials(
        &self,
        api_key_id: i64,
        user_id: i64,
        exchange_id: i32,
        is_testnet: bool,
    ) {
        if let Ok(mut paused) = self.paused_keys.lock() {
            paused.remove(&api_key_id);
        }
        self.adapters.invalidate(user_id, exchange_id, is_testnet);
    }

    // ----- shared plumbing -----

    fn restore(&self, id: i64, prior: OrderStatus) -> Result<()> {
        match self.repository.atomic_transition(
            id,
            &[OrderStatus::InExecution],
            OrderChanges::to(prior),
        )? {
            Some(_) => Ok(()),
            None => Err(Error::new(format!(
                "order {id} was not IN_EXECUTION during restore"
            ))),
        }
    }

    fn finish_cancelled(&self, order: &Order, reason: &str) -> Result<()> {
        let cancelled = self
            .repository
            .atomic_transition(
                order.id,
                &[OrderStatus::InExecution],
                OrderChanges::to(OrderStatus::Cancelled).closed_at(self.now_dt()),
            )?
            .ok_or_else(|| Error::new(format!("order {} lost its critical section", order.id)))?;
        metrics::inc_cancelled();
        self.notify_transition(
            &cancelled,
            &format!("CANCELLED ({reason})"),
            None,
            cancelled.quantity,
        );
        Ok(())
    }

    fn finish_closed(
        &self,
        order: &Order,
        status: OrderStatus,
        label: &str,
        price: Option<Decimal>,
        qty: Decimal,
    ) -> Result<()> {
        let closed = self
            .repository
            .atomic_transition(
                order.id,
                &[OrderStatus::InExecution],
                OrderChanges::to(status).closed_at(self.now_dt()),
            )?
            .ok_or_else(|| Error::new(format!("order {} lost its critical section", order.id)))?;
        metrics::inc_closed();
        self.notify_transition(&closed, label, price, qty);
        Ok(())
    }

    fn notify_transition(
        &self,
        order: &Order,
        transition: &str,
        price: Option<Decimal>,
        qty: Decimal,
    ) {
        let message = format_transition(order, transition, price, qty, self.now_dt());
        self.notifier.notify(order.user_id, &message);
        metrics::inc_notification();
    }

    fn notify_insufficient(&self, order: &Order, required: Decimal) {
        let now = self.clock.now_ms();
        let mut notices = match self.balance_notice.lock() {
            Ok(notices) => notices,
            Err(_) => return,
        };
        let last = notices.get(&order.user_id).copied().unwrap_or(i64::MIN);
        if now.saturating_sub(last) < BALANCE_NOTICE_INTERVAL_MS {
            return;
        }
        notices.insert(order.user_id, now);
        drop(notices);
        let detail = if required > Decimal::ZERO {
            format!(" (needs {} {})", required, order.quote_asset())
        } else {
            String::new()
        };
        self.notifier.notify(
            order.user_id,
            &format!(
                "order #{} {}: insufficient balance for entry{detail}",
                order.id, order.symbol
            ),
        );
    }

    fn pause(&self, api_key_id: i64) {
        if let Ok(mut paused) = self.paused_keys.lock() {
            paused.insert(api_key_id);
        }
    }

    fn is_paused(&self, api_key_id: i64) -> bool {
        self.paused_keys
            .lock()
            .map(|paused| paused.contains(&api_key_id))
            .unwrap_or(false)
    }

    fn record_filter_strike(&self, order_id: i64) -> u32 {
        match self.filter_strikes.lock() {
            Ok(mut strikes) => {
                let entry = strikes.entry(order_id).or_insert(0);
                *entry += 1;
                *entry
            }
            Err(_) => 1,
        }
    }

    fn clear_filter_strikes(&self, order_id: i64) {
        if let Ok(mut strikes) = self.filter_strikes.lock() {
            strikes.remove(&order_id);
        }
    }

    fn now_dt(&self) -> DateTime<Utc> {
        datetime_from_ms(self.clock.now_ms())
    }
}

fn validate_plan(plan: &OrderPlan) -> Result<()> {
    if plan.symbol.trim().is_empty() {
        return Err(Error::new("symbol must be set"));
    }
    if plan.quantity <= Decimal::ZERO {
        return Err(Error::new("quantity must be positive"));
    }
    if plan.entry_price <= Decimal::ZERO {
        return Err(Error::new("entry price must be positive"));
    }
    if plan.max_entry < plan.entry_price {
        return Err(Error::new("max entry must be at or above the entry price"));
    }
    if let Some(take_profit) = plan.take_profit {
        if take_profit <= plan.entry_price {
            return Err(Error::new("take-profit must be above the entry price"));
        }
    }
    if let Some(stop_loss) = plan.stop_loss {
        if stop_loss >= plan.entry_price {
            return Err(Error::new("stop-loss must be below the entry price"));
        }
    }
    Ok(())
}

fn validate_invariants(order: &Order) -> Result<()> {
    if order.entry_price <= Decimal::ZERO {
        return Err(Error::new("entry price must be positive"));
    }
    if order.max_entry < order.entry_price {
        return Err(Error::new("max entry must be at or above the entry price"));
    }
    if let Some(take_profit) = order.take_profit {
        if take_profit <= order.entry_price {
            return Err(Error::new("take-profit must be above the entry price"));
        }
    }
    if let Some(stop_loss) = order.stop_loss {
        if stop_loss >= order.entry_price {
            return Err(Error::new("stop-loss must be below the entry price"));
        }
    }
    Ok(())
}

fn validate_targets(
    order: &Order,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Result<()> {
    if let Some(take_profit) = take_profit {
        if take_profit <= order.entry_price {
            return Err(Error::new("take-profit must be above the entry price"));
        }
    }
    if let Some(stop_loss) = stop_loss {
        if stop_loss >= order.entry_price {
            return Err(Error::new("stop-loss must be below the entry price"));
        }
    }
    Ok(())
}

fn merge_update(order: &mut Order, update: &OrderUpdate) {
    if let Some(value) = update.entry_price {
        order.entry_price = value;
    }
    if let Some(value) = update.max_entry {
        order.max_entry = value;
    }
    if let Some(value) = &update.take_profit {
        order.take_profit = *value;
    }
    if let Some(value) = &update.stop_loss {
        order.stop_loss = *value;
    }
    if let Some(value) = update.entry_interval {
        order.entry_interval = value;
    }
    if let Some(value) = update.stop_interval {
        order.stop_interval = value;
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_plan, OrderPlan};
    use crate::models::Interval;
    use rust_decimal::Decimal;

    fn plan() -> OrderPlan {
        OrderPlan {
            user_id: 1,
            exchange_id: 1,
            api_key_id: 1,
            is_testnet: true,
            symbol: "BTCUSDC".to_string(),
            quantity: "0.001".parse().expect("qty"),
            entry_price: "91000".parse().expect("entry"),
            max_entry: "92000".parse().expect("max"),
            take_profit: Some("95000".parse().expect("tp")),
            stop_loss: Some("90000".parse().expect("sl")),
            entry_interval: Interval::M5,
            stop_interval: Interval::M5,
        }
    }

    #[test]
    fn accepts_well_formed_plan() {
        assert!(validate_plan(&plan()).is_ok());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut bad = plan();
        bad.max_entry = "90000".parse().expect("max");
        assert!(validate_plan(&bad).is_err());

        let mut bad = plan();
        bad.take_profit = Some("91000".parse().expect("tp"));
        assert!(validate_plan(&bad).is_err());

        let mut bad = plan();
        bad.stop_loss = Some("91000".parse().expect("sl"));
        assert!(validate_plan(&bad).is_err());
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let mut bad = plan();
        bad.quantity = Decimal::ZERO;
        assert!(validate_plan(&bad).is_err());
    }
}
