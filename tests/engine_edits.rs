mod common;

use common::{execute_order, harness, insert_pending};
use rust_decimal_macros::dec;
use tiller::core::engine::{OrderUpdate, SplitParams};
use tiller::models::{Interval, OrderStatus};
use tiller::storage::OrderRepository;

#[test]
fn pending_edit_updates_fields_and_stop_reference() {
    let h = harness();
    let order = insert_pending(&h);

    let updated = h
        .engine
        .update_order(
            order.id,
            OrderUpdate {
                take_profit: Some(Some(dec!(96000))),
                stop_loss: Some(Some(dec!(89000))),
                stop_interval: Some(Interval::H1),
                ..OrderUpdate::default()
            },
        )
        .expect("update");

    assert_eq!(updated.take_profit, Some(dec!(96000)));
    assert_eq!(updated.stop_loss, Some(dec!(89000)));
    assert_eq!(updated.stop_interval, Interval::H1);
    assert!(updated.sl_updated_at.is_some());
    assert_eq!(updated.status, OrderStatus::Pending);
}

#[test]
fn edit_violating_invariants_is_rejected() {
    let h = harness();
    let order = insert_pending(&h);

    let result = h.engine.update_order(
        order.id,
        OrderUpdate {
            take_profit: Some(Some(dec!(90000))),
            ..OrderUpdate::default()
        },
    );
    assert!(result.is_err());

    let unchanged = h.repository.load(order.id).expect("load").expect("order");
    assert_eq!(unchanged.take_profit, Some(dec!(95000)));
}

#[test]
fn executed_tp_edit_repegs_resting_order() {
    let h = harness();
    let executed = execute_order(&h);
    let old_tp = executed.tp_order_id.clone().expect("tp id");

    let updated = h
        .engine
        .update_order(
            executed.id,
            OrderUpdate {
                take_profit: Some(Some(dec!(96000))),
                ..OrderUpdate::default()
            },
        )
        .expect("update");

    assert_eq!(updated.status, OrderStatus::Executed);
    assert_eq!(updated.take_profit, Some(dec!(96000)));
    let new_tp = updated.tp_order_id.expect("new tp id");
    assert_ne!(new_tp, old_tp);
    assert!(h.exchange.cancelled().contains(&old_tp));

    let open = h.exchange.open_orders();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, dec!(96000));
    assert_eq!(open[0].qty, dec!(0.000999));
}

#[test]
fn unplaceable_tp_edit_leaves_old_order_live() {
    let h = harness();
    let executed = execute_order(&h);
    let old_tp = executed.tp_order_id.clone().expect("tp id");

    // Fresh filters with a prohibitive minimum; the cached entry expires.
    h.clock.advance_secs(3601);
    h.exchange.set_filters(tiller::models::SymbolFilters {
        lot_step: dec!(0.000001),
        tick_size: dec!(0.01),
        min_notional: dec!(1000000),
    });

    let result = h.engine.update_order(
        executed.id,
        OrderUpdate {
            take_profit: Some(Some(dec!(96000))),
            ..OrderUpdate::default()
        },
    );
    assert!(result.is_err());

    let order = h.repository.load(executed.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(order.take_profit, Some(dec!(95000)));
    assert_eq!(order.tp_order_id, Some(old_tp.clone()));
    assert!(h.exchange.open_order_ids().contains(&old_tp));
}

#[test]
fn repeating_an_edit_converges_to_one_resting_order() {
    let h = harness();
    let executed = execute_order(&h);
    let update = OrderUpdate {
        take_profit: Some(Some(dec!(96000))),
        ..OrderUpdate::default()
    };

    h.engine
        .update_order(executed.id, update.clone())
        .expect("first edit");
    h.engine
        .update_order(executed.id, update)
        .expect("second edit");

    let open = h.exchange.open_orders();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, dec!(96000));
    assert_eq!(open[0].qty, dec!(0.000999));
}

#[test]
fn cancel_applies_to_pending_only() {
    let h = harness();
    let order = insert_pending(&h);

    let cancelled = h.engine.cancel_order(order.id).expect("cancel");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.closed_at.is_some());

    assert!(h.engine.cancel_order(order.id).is_err());
}

#[test]
fn close_position_cancels_tp_and_sells_wallet() {
    let h = harness();
    let executed = execute_order(&h);
    let tp_order_id = executed.tp_order_id.clone().expect("tp id");

    let closed = h.engine.close_position(executed.id).expect("close");

    assert_eq!(closed.status, OrderStatus::ClosedManual);
    assert!(h.exchange.cancelled().contains(&tp_order_id));
    assert_eq!(h.exchange.sells(), vec![("BTCUSDC".to_string(), dec!(0.001))]);
}

#[test]
fn close_with_empty_wallet_marks_external() {
    let h = harness();
    let executed = execute_order(&h);
    let tp_order_id = executed.tp_order_id.clone().expect("tp id");

    h.exchange.drop_open_order(&tp_order_id, "BTCUSDC");
    h.exchange.set_balance("BTC", dec!(0), dec!(0));

    let closed = h.engine.close_position(executed.id).expect("close");
    assert_eq!(closed.status, OrderStatus::ClosedExternally);
    assert!(h.exchange.sells().is_empty());
}

#[test]
fn split_carves_two_executed_orders() {
    let h = harness();
    let executed = execute_order(&h);
    let old_tp = executed.tp_order_id.clone().expect("tp id");

    let (first, second) = h
        .engine
        .split_order(
            executed.id,
            SplitParams {
                split_qty: dec!(0.0004),
                tp1: Some(dec!(94000)),
                sl1: Some(dec!(89500)),
                tp2: Some(dec!(96000)),
                sl2: Some(dec!(89000)),
            },
        )
        .expect("split");

    assert!(h.exchange.cancelled().contains(&old_tp));
    assert_eq!(first.id, executed.id);
    assert_eq!(first.quantity, dec!(0.0004));
    assert_eq!(first.take_profit, Some(dec!(94000)));
    assert_eq!(first.stop_loss, Some(dec!(89500)));
    assert_eq!(first.status, OrderStatus::Executed);

    assert_eq!(second.quantity, dec!(0.0006));
    assert_eq!(second.take_profit, Some(dec!(96000)));
    assert_eq!(second.stop_loss, Some(dec!(89000)));
    assert_eq!(second.status, OrderStatus::Executed);
    assert_eq!(second.executed_price, first.executed_price);

    let open = h.exchange.open_orders();
    assert_eq!(open.len(), 2);
    assert!(first.tp_order_id.is_some());
    assert!(second.tp_order_id.is_some());
}

#[test]
fn split_rejects_quantity_outside_position() {
    let h = harness();
    let executed = execute_order(&h);
    let result = h.engine.split_order(
        executed.id,
        SplitParams {
            split_qty: dec!(0.002),
            tp1: None,
            sl1: None,
            tp2: None,
            sl2: None,
        },
    );
    assert!(result.is_err());
    let order = h.repository.load(executed.id).expect("load").expect("order");
    assert_eq!(order.status, OrderStatus::Executed);
    assert_eq!(order.quantity, dec!(0.001));
}
