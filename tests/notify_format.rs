mod common;

use chrono::{TimeZone, Utc};
use common::{harness, insert_pending};
use rust_decimal_macros::dec;
use tiller::core::notify::format_transition;

#[test]
fn transition_message_carries_every_field() {
    let h = harness();
    let order = insert_pending(&h);
    let timestamp = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");

    let message = format_transition(&order, "EXECUTED", Some(dec!(91450)), dec!(0.001), timestamp);

    assert!(message.contains(&format!("order #{}", order.id)));
    assert!(message.contains("user 7"));
    assert!(message.contains("BTCUSDC"));
    assert!(message.contains("EXECUTED"));
    assert!(message.contains("91450"));
    assert!(message.contains("0.001"));
    assert!(message.contains("2023"));
}

#[test]
fn missing_price_renders_as_dash() {
    let h = harness();
    let order = insert_pending(&h);
    let timestamp = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");

    let message = format_transition(&order, "CANCELLED (user)", None, dec!(0.001), timestamp);
    assert!(message.contains("price -"));
}
