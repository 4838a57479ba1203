pub mod types;

pub use types::{
    Balance, BuyFill, Candle, FillStatus, Interval, OpenOrder, Order, OrderAck, OrderStatus, Side,
    SymbolFilters,
};
