use rust_decimal::Decimal;

/// Largest multiple of `step` not exceeding `value`. A zero or negative
/// step leaves the value untouched.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Prices crossing into an adapter are aligned downward to the tick grid;
/// selling never rounds up.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    floor_to_step(price, tick)
}

pub fn meets_min_notional(qty: Decimal, price: Decimal, min_notional: Decimal) -> bool {
    qty * price >= min_notional
}
