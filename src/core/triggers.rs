use crate::exchange::{AdapterResult, Exchange};
use crate::models::{Interval, Order};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryDecision {
    Fire,
    Wait,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopDecision {
    Hit,
    Hold,
}

/// Entry is evaluated on closed candles only; a forming candle can whipsaw
/// through the trigger without committing the plan.
pub fn entry_trigger(order: &Order, adapter: &dyn Exchange) -> AdapterResult<EntryDecision> {
    if order.entry_interval == Interval::Market {
        return Ok(EntryDecision::Fire);
    }
    let candle = adapter.last_closed_candle(&order.symbol, order.entry_interval)?;
    if candle.close > order.max_entry {
        return Ok(EntryDecision::Cancel);
    }
    if candle.close >= order.entry_price {
        return Ok(EntryDecision::Fire);
    }
    Ok(EntryDecision::Wait)
}

/// The stop reads the candle close, not the low: the plan's stop-loss is a
/// trend signal, not a tick-level stop. Candles that closed before the
/// position existed (or before the stop was last moved) never count.
pub fn stop_trigger(order: &Order, adapter: &dyn Exchange) -> AdapterResult<StopDecision> {
    let stop_loss = match order.stop_loss {
        Some(stop_loss) => stop_loss,
        None => return Ok(StopDecision::Hold),
    };
    let candle = adapter.last_closed_candle(&order.symbol, order.stop_interval)?;
    let close_time_ms = candle.open_time + order.stop_interval.candle_ms();
    if close_time_ms <= order.stop_reference().timestamp_millis() {
        return Ok(StopDecision::Hold);
    }
    if candle.close <= stop_loss {
        return Ok(StopDecision::Hit);
    }
    Ok(StopDecision::Hold)
}
