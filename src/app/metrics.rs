use crate::{Error, Result};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: OnceLock<i64> = OnceLock::new();

static ENGINE_TICKS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RECONCILE_SWEEPS_TOTAL: AtomicU64 = AtomicU64::new(0);

static ORDERS_EXECUTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static ORDERS_CLOSED_TOTAL: AtomicU64 = AtomicU64::new(0);
static ORDERS_CANCELLED_TOTAL: AtomicU64 = AtomicU64::new(0);

static CONFLICTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ADAPTER_ERRORS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ORDER_ERRORS_TOTAL: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn init_start_time() {
    let _ = START_TIME.set(now_epoch());
}

pub fn inc_engine_tick() {
    ENGINE_TICKS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_reconcile_sweep() {
    RECONCILE_SWEEPS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_executed() {
    ORDERS_EXECUTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_closed() {
    ORDERS_CLOSED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_cancelled() {
    ORDERS_CANCELLED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_conflict() {
    CONFLICTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_adapter_error() {
    ADAPTER_ERRORS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_order_error() {
    ORDER_ERRORS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_notification() {
    NOTIFICATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn write_if_configured() -> Result<()> {
    let path = match std::env::var("TILLER_METRICS_PATH") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => return Ok(()),
    };
    write_metrics(&path)
}

pub fn write_metrics(path: &str) -> Result<()> {
    let content = render();
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| Error::new(format!("metrics dir create failed: {err}")))?;
    }
    fs::write(path, content).map_err(|err| Error::new(format!("metrics write failed: {err}")))
}

pub fn render() -> String {
    let mut output = String::new();
    push_line(&mut output, "# HELP tiller_up Tiller process up");
    push_line(&mut output, "# TYPE tiller_up gauge");
    push_line(&mut output, "tiller_up 1");
    push_line(&mut output, "# HELP tiller_uptime_seconds Process uptime in seconds");
    push_line(&mut output, "# TYPE tiller_uptime_seconds gauge");
    push_line(&mut output, &format!("tiller_uptime_seconds {}", uptime_seconds()));
    for (name, help, value) in [
        (
            "tiller_engine_ticks_total",
            "Engine fast ticks",
            &ENGINE_TICKS_TOTAL,
        ),
        (
            "tiller_reconcile_sweeps_total",
            "Reconciliation sweeps",
            &RECONCILE_SWEEPS_TOTAL,
        ),
        (
            "tiller_orders_executed_total",
            "Orders moved to EXECUTED",
            &ORDERS_EXECUTED_TOTAL,
        ),
        (
            "tiller_orders_closed_total",
            "Orders closed (TP/SL/manual/external)",
            &ORDERS_CLOSED_TOTAL,
        ),
        (
            "tiller_orders_cancelled_total",
            "Orders cancelled",
            &ORDERS_CANCELLED_TOTAL,
        ),
        (
            "tiller_conflicts_total",
            "Critical-section conflicts skipped",
            &CONFLICTS_TOTAL,
        ),
        (
            "tiller_adapter_errors_total",
            "Adapter call failures",
            &ADAPTER_ERRORS_TOTAL,
        ),
        (
            "tiller_order_errors_total",
            "Orders left for reconciliation",
            &ORDER_ERRORS_TOTAL,
        ),
        (
            "tiller_notifications_total",
            "Notifications emitted",
            &NOTIFICATIONS_TOTAL,
        ),
    ] {
        push_line(&mut output, &format!("# HELP {name} {help}"));
        push_line(&mut output, &format!("# TYPE {name} counter"));
        push_line(&mut output, &format!("{name} {}", value.load(Ordering::Relaxed)));
    }
    output
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn uptime_seconds() -> i64 {
    let start = START_TIME.get().copied().unwrap_or_else(now_epoch);
    now_epoch().saturating_sub(start)
}

fn push_line(target: &mut String, line: &str) {
    target.push_str(line);
    target.push('\n');
}
