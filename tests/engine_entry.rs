mod common;

use common::{harness, insert_pending, new_plan_order, set_entry_candle};
use rust_decimal_macros::dec;
use tiller::core::engine::OrderPlan;
use tiller::exchange::AdapterError;
use tiller::models::{Interval, OrderStatus, SymbolFilters};
use tiller::storage::OrderRepository;

#[test]
fn ceiling_breach_cancels_pending_order() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(92001));

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.closed_at.is_some());
    assert!(h.exchange.buys().is_empty());
    assert!(h.exchange.limit_sells().is_empty());
    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains("CANCELLED"));
}

#[test]
fn waits_while_close_is_below_entry() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(90999));

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.exchange.buys().is_empty());
}

#[test]
fn fires_when_close_equals_entry_exactly() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(91000));

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(h.exchange.buys().len(), 1);
}

#[test]
fn clean_entry_records_fill_and_rests_take_profit() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(91500));
    h.exchange.set_fill_price(dec!(91450));

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(order.executed_price, Some(dec!(91450)));
    assert!(order.executed_at.is_some());
    assert!(order.tp_order_id.is_some());

    assert_eq!(h.exchange.buys(), vec![("BTCUSDC".to_string(), dec!(0.001))]);
    assert_eq!(
        h.exchange.limit_sells(),
        vec![("BTCUSDC".to_string(), dec!(0.000999), dec!(95000))]
    );
    let messages = h.notifier.messages();
    assert!(messages.iter().any(|(_, text)| text.contains("EXECUTED")));
}

#[test]
fn transient_candle_error_retries_next_tick() {
    let h = harness();
    let order = insert_pending(&h);
    h.exchange.fail_with(
        "last_closed_candle",
        AdapterError::Transient("503".to_string()),
    );

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.exchange.buys().is_empty());

    h.exchange.clear_failure("last_closed_candle");
    set_entry_candle(&h, dec!(91500));
    h.engine.tick();
    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Executed);
}

#[test]
fn insufficient_quote_balance_notifies_once_per_day() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(91500));
    h.exchange.set_balance("USDC", dec!(10), dec!(0));

    h.engine.tick();
    h.clock.advance_secs(10);
    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.exchange.buys().is_empty());
    assert_eq!(h.notifier.messages().len(), 1);

    h.clock.advance_secs(24 * 3600);
    h.engine.tick();
    assert_eq!(h.notifier.messages().len(), 2);
}

#[test]
fn entry_below_min_notional_is_deferred_not_cancelled() {
    let h = harness();
    h.exchange.set_filters(SymbolFilters {
        lot_step: dec!(0.000001),
        tick_size: dec!(0.01),
        min_notional: dec!(1000),
    });
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(91500));

    h.engine.tick();

    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.exchange.buys().is_empty());
}

#[test]
fn repeated_filter_violation_cancels_with_reason() {
    let h = harness();
    let order = insert_pending(&h);
    set_entry_candle(&h, dec!(91500));
    h.exchange.fail_with(
        "place_market_buy",
        AdapterError::FilterViolation("LOT_SIZE".to_string()),
    );

    h.engine.tick();
    let mid = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(mid.status, OrderStatus::Pending);

    h.engine.tick();
    let order = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Cancelled);
    let messages = h.notifier.messages();
    assert!(messages.iter().any(|(_, text)| text.contains("filter")));
}

#[test]
fn auth_error_cancels_and_pauses_credentials() {
    let h = harness();
    let first = insert_pending(&h);
    set_entry_candle(&h, dec!(91500));
    h.exchange
        .fail_with("place_market_buy", AdapterError::Auth("401".to_string()));

    h.engine.tick();
    let first = h.repository.load(first.id).expect("load").expect("order");
    assert_eq!(first.status, OrderStatus::Cancelled);

    // Same credentials stay paused even once the venue would accept again.
    h.exchange.clear_failure("place_market_buy");
    let second = insert_pending(&h);
    h.engine.tick();
    let second_loaded = h
        .repository
        .load(second.id)
        .expect("load")
        .expect("order");
    assert_eq!(second_loaded.status, OrderStatus::Pending);
    assert!(h.exchange.buys().is_empty());

    h.engine.resume_credentials(1, 7, 1, true);
    h.engine.tick();
    let second_loaded = h
        .repository
        .load(second.id)
        .expect("load")
        .expect("order");
    assert_eq!(second_loaded.status, OrderStatus::Executed);
}

#[test]
fn market_plan_executes_immediately() {
    let h = harness();
    let plan = OrderPlan {
        user_id: 7,
        exchange_id: 1,
        api_key_id: 1,
        is_testnet: true,
        symbol: "BTCUSDC".to_string(),
        quantity: dec!(0.001),
        entry_price: dec!(91000),
        max_entry: dec!(92000),
        take_profit: Some(dec!(95000)),
        stop_loss: Some(dec!(90000)),
        entry_interval: Interval::Market,
        stop_interval: Interval::M5,
    };

    let order = h.engine.create_order(plan).expect("create");

    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(h.exchange.buys().len(), 1);
    assert!(order.tp_order_id.is_some());
}

#[test]
fn create_refuses_plan_whose_candle_already_reached_target() {
    let h = harness();
    set_entry_candle(&h, dec!(95001));
    let plan = OrderPlan {
        user_id: 7,
        exchange_id: 1,
        api_key_id: 1,
        is_testnet: true,
        symbol: "BTCUSDC".to_string(),
        quantity: dec!(0.001),
        entry_price: dec!(91000),
        max_entry: dec!(92000),
        take_profit: Some(dec!(95000)),
        stop_loss: Some(dec!(90000)),
        entry_interval: Interval::M5,
        stop_interval: Interval::M5,
    };
    assert!(h.engine.create_order(plan.clone()).is_err());

    set_entry_candle(&h, dec!(90500));
    let order = h.engine.create_order(plan).expect("create");
    assert_eq!(order.status, OrderStatus::Pending);
}

#[test]
fn create_rejects_invalid_plans() {
    let h = harness();
    let base = new_plan_order();

    let mut plan = OrderPlan {
        user_id: base.user_id,
        exchange_id: base.exchange_id,
        api_key_id: base.api_key_id,
        is_testnet: base.is_testnet,
        symbol: base.symbol.clone(),
        quantity: base.quantity,
        entry_price: base.entry_price,
        max_entry: base.max_entry,
        take_profit: base.take_profit,
        stop_loss: base.stop_loss,
        entry_interval: base.entry_interval,
        stop_interval: base.stop_interval,
    };
    plan.max_entry = dec!(90000);
    assert!(h.engine.create_order(plan).is_err());
}
