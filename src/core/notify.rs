use crate::models::Order;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

/// One method, consumed by the engine and the reconciler. The hosting
/// application decides where messages actually go.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: i64, message: &str);
}

/// Default sink: structured log lines. Useful for single-binary runs and
/// as a fallback when no channel is wired up.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user_id: i64, message: &str) {
        info!(user_id, message, "notify");
    }
}

pub fn format_transition(
    order: &Order,
    transition: &str,
    price: Option<Decimal>,
    qty: Decimal,
    timestamp: DateTime<Utc>,
) -> String {
    let price_text = match price {
        Some(price) => price.to_string(),
        None => "-".to_string(),
    };
    format!(
        "order #{} user {} {} {} price {} qty {} at {}",
        order.id,
        order.user_id,
        order.symbol,
        transition,
        price_text,
        qty,
        timestamp.to_rfc3339()
    )
}
