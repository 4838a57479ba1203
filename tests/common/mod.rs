#![allow(dead_code)]

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tiller::core::engine::{Engine, EngineParams};
use tiller::core::notify::Notifier;
use tiller::core::reconcile::{Reconciler, ReconcilerParams};
use tiller::core::Clock;
use tiller::exchange::filters::FilterCache;
use tiller::exchange::registry::AdapterProvider;
use tiller::exchange::{AdapterError, AdapterResult, Exchange};
use tiller::models::{
    Balance, BuyFill, Candle, FillStatus, Interval, OpenOrder, Order, OrderAck, OrderStatus, Side,
    SymbolFilters,
};
use tiller::storage::memory::MemoryRepository;
use tiller::storage::{NewOrder, OrderRepository};
use tiller::Result;

pub const START_MS: i64 = 1_700_000_000_000;

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta: i64) {
        self.advance_ms(delta * 1000);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockState {
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Balance>,
    candles: HashMap<(String, Interval), Candle>,
    open_orders: Vec<OpenOrder>,
    filters: Option<SymbolFilters>,
    failures: HashMap<&'static str, AdapterError>,
    buys: Vec<(String, Decimal)>,
    sells: Vec<(String, Decimal)>,
    limit_sells: Vec<(String, Decimal, Decimal)>,
    cancelled: Vec<String>,
    fill_price: Option<Decimal>,
}

/// Scriptable venue. Buys credit the base asset, limit sells lock it,
/// cancels unlock it, market sells burn it, so lifecycle tests read like
/// the scenarios they model.
pub struct MockExchange {
    state: Mutex<MockState>,
    next_order_id: AtomicU64,
}

fn base_asset(symbol: &str) -> String {
    for quote in ["USDC", "USDT", "BUSD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    symbol.to_string()
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            next_order_id: AtomicU64::new(1000),
        })
    }

    fn next_id(&self) -> String {
        self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn check_failure(&self, op: &'static str) -> AdapterResult<()> {
        let state = self.state.lock().expect("mock lock");
        match state.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn fail_with(&self, op: &'static str, err: AdapterError) {
        self.state
            .lock()
            .expect("mock lock")
            .failures
            .insert(op, err);
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.state.lock().expect("mock lock").failures.remove(op);
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .expect("mock lock")
            .prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        self.state.lock().expect("mock lock").balances.insert(
            asset.to_string(),
            Balance {
                asset: asset.to_string(),
                free,
                locked,
            },
        );
    }

    pub fn balance_of(&self, asset: &str) -> (Decimal, Decimal) {
        let state = self.state.lock().expect("mock lock");
        state
            .balances
            .get(asset)
            .map(|balance| (balance.free, balance.locked))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    pub fn set_candle(&self, symbol: &str, interval: Interval, candle: Candle) {
        self.state
            .lock()
            .expect("mock lock")
            .candles
            .insert((symbol.to_string(), interval), candle);
    }

    pub fn set_filters(&self, filters: SymbolFilters) {
        self.state.lock().expect("mock lock").filters = Some(filters);
    }

    pub fn set_fill_price(&self, price: Decimal) {
        self.state.lock().expect("mock lock").fill_price = Some(price);
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock lock");
        state
            .open_orders
            .iter()
            .map(|order| order.order_id.clone())
            .collect()
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.state.lock().expect("mock lock").open_orders.clone()
    }

    /// Removes the resting order and releases its lock, as an external
    /// cancellation would.
    pub fn drop_open_order(&self, order_id: &str, symbol: &str) {
        let mut state = self.state.lock().expect("mock lock");
        if let Some(index) = state
            .open_orders
            .iter()
            .position(|order| order.order_id == order_id)
        {
            let removed = state.open_orders.remove(index);
            let base = base_asset(symbol);
            if let Some(balance) = state.balances.get_mut(&base) {
                balance.locked -= removed.qty;
                balance.free += removed.qty;
            }
        }
    }

    /// Removes the resting order and burns the locked base, as a fill would.
    pub fn fill_open_order(&self, order_id: &str, symbol: &str) {
        let mut state = self.state.lock().expect("mock lock");
        if let Some(index) = state
            .open_orders
            .iter()
            .position(|order| order.order_id == order_id)
        {
            let removed = state.open_orders.remove(index);
            let base = base_asset(symbol);
            if let Some(balance) = state.balances.get_mut(&base) {
                balance.locked -= removed.qty;
                if balance.locked < Decimal::ZERO {
                    balance.locked = Decimal::ZERO;
                }
            }
        }
    }

    pub fn buys(&self) -> Vec<(String, Decimal)> {
        self.state.lock().expect("mock lock").buys.clone()
    }

    pub fn sells(&self) -> Vec<(String, Decimal)> {
        self.state.lock().expect("mock lock").sells.clone()
    }

    pub fn limit_sells(&self) -> Vec<(String, Decimal, Decimal)> {
        self.state.lock().expect("mock lock").limit_sells.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().expect("mock lock").cancelled.clone()
    }
}

impl Exchange for MockExchange {
    fn spot_price(&self, symbol: &str) -> AdapterResult<Decimal> {
        self.check_failure("spot_price")?;
        let state = self.state.lock().expect("mock lock");
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| AdapterError::Unavailable(format!("no price for {symbol}")))
    }

    fn balance(&self, asset: &str) -> AdapterResult<Balance> {
        self.check_failure("balance")?;
        let state = self.state.lock().expect("mock lock");
        Ok(state.balances.get(asset).cloned().unwrap_or(Balance {
            asset: asset.to_string(),
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        }))
    }

    fn last_closed_candle(&self, symbol: &str, interval: Interval) -> AdapterResult<Candle> {
        self.check_failure("last_closed_candle")?;
        let state = self.state.lock().expect("mock lock");
        state
            .candles
            .get(&(symbol.to_string(), interval))
            .cloned()
            .ok_or_else(|| AdapterError::Unavailable(format!("no candles for {symbol}")))
    }

    fn place_market_buy(&self, symbol: &str, qty: Decimal) -> AdapterResult<BuyFill> {
        self.check_failure("place_market_buy")?;
        let mut state = self.state.lock().expect("mock lock");
        state.buys.push((symbol.to_string(), qty));
        let base = base_asset(symbol);
        let entry = state.balances.entry(base.clone()).or_insert(Balance {
            asset: base,
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        });
        entry.free += qty;
        let avg_fill_price = state.fill_price;
        drop(state);
        Ok(BuyFill {
            order_id: self.next_id(),
            filled_qty: qty,
            avg_fill_price,
            status: FillStatus::Filled,
        })
    }

    fn place_market_sell(&self, symbol: &str, qty: Decimal) -> AdapterResult<OrderAck> {
        self.check_failure("place_market_sell")?;
        let mut state = self.state.lock().expect("mock lock");
        state.sells.push((symbol.to_string(), qty));
        let base = base_asset(symbol);
        if let Some(balance) = state.balances.get_mut(&base) {
            balance.free -= qty;
            if balance.free < Decimal::ZERO {
                balance.free = Decimal::ZERO;
            }
        }
        drop(state);
        Ok(OrderAck {
            order_id: self.next_id(),
            status: FillStatus::Filled,
        })
    }

    fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> AdapterResult<OrderAck> {
        self.check_failure("place_limit_sell")?;
        let order_id = self.next_id();
        let mut state = self.state.lock().expect("mock lock");
        state
            .limit_sells
            .push((symbol.to_string(), qty, price));
        state.open_orders.push(OpenOrder {
            order_id: order_id.clone(),
            side: "SELL".to_string(),
            price,
            qty,
            order_type: "LIMIT".to_string(),
        });
        let base = base_asset(symbol);
        if let Some(balance) = state.balances.get_mut(&base) {
            balance.free -= qty;
            balance.locked += qty;
        }
        drop(state);
        Ok(OrderAck {
            order_id,
            status: FillStatus::New,
        })
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<bool> {
        self.check_failure("cancel_order")?;
        let mut state = self.state.lock().expect("mock lock");
        match state
            .open_orders
            .iter()
            .position(|order| order.order_id == order_id)
        {
            Some(index) => {
                let removed = state.open_orders.remove(index);
                state.cancelled.push(order_id.to_string());
                let base = base_asset(symbol);
                if let Some(balance) = state.balances.get_mut(&base) {
                    balance.locked -= removed.qty;
                    balance.free += removed.qty;
                    if balance.locked < Decimal::ZERO {
                        balance.locked = Decimal::ZERO;
                    }
                }
                Ok(true)
            }
            None => Err(AdapterError::NotFound(format!("order {order_id} unknown"))),
        }
    }

    fn list_open_orders(&self, _symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        self.check_failure("list_open_orders")?;
        Ok(self.state.lock().expect("mock lock").open_orders.clone())
    }

    fn symbol_filters(&self, symbol: &str) -> AdapterResult<SymbolFilters> {
        self.check_failure("symbol_filters")?;
        let state = self.state.lock().expect("mock lock");
        state
            .filters
            .clone()
            .ok_or_else(|| AdapterError::NotFound(format!("unknown symbol {symbol}")))
    }

    fn all_assets(&self) -> AdapterResult<Vec<Balance>> {
        self.check_failure("all_assets")?;
        Ok(self
            .state
            .lock()
            .expect("mock lock")
            .balances
            .values()
            .cloned()
            .collect())
    }
}

pub struct StubAdapterProvider {
    exchange: Arc<MockExchange>,
}

impl StubAdapterProvider {
    pub fn new(exchange: Arc<MockExchange>) -> Arc<Self> {
        Arc::new(Self { exchange })
    }
}

impl AdapterProvider for StubAdapterProvider {
    fn adapter(
        &self,
        _user_id: i64,
        _exchange_id: i32,
        _is_testnet: bool,
    ) -> Result<Arc<dyn Exchange>> {
        Ok(Arc::clone(&self.exchange) as Arc<dyn Exchange>)
    }

    fn invalidate(&self, _user_id: i64, _exchange_id: i32, _is_testnet: bool) {}
}

#[derive(Default)]
pub struct CollectingNotifier {
    messages: Mutex<Vec<(i64, String)>>,
}

impl CollectingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().expect("notifier lock").clone()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, user_id: i64, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push((user_id, message.to_string()));
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub repository: Arc<MemoryRepository>,
    pub exchange: Arc<MockExchange>,
    pub notifier: Arc<CollectingNotifier>,
    pub engine: Engine,
    pub reconciler: Reconciler,
}

pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let repository = Arc::new(MemoryRepository::new(Arc::clone(&clock_dyn)));
    let exchange = MockExchange::new();
    let notifier = CollectingNotifier::new();
    let adapters = StubAdapterProvider::new(Arc::clone(&exchange));
    let filters = Arc::new(FilterCache::new(3600, Arc::clone(&clock_dyn)));

    exchange.set_filters(SymbolFilters {
        lot_step: dec!(0.000001),
        tick_size: dec!(0.01),
        min_notional: dec!(5),
    });
    exchange.set_price("BTCUSDC", dec!(91500));
    exchange.set_balance("USDC", dec!(10000), dec!(0));

    let repository_dyn: Arc<dyn OrderRepository> = repository.clone();
    let adapters_dyn: Arc<dyn AdapterProvider> = adapters;
    let notifier_dyn: Arc<dyn Notifier> = notifier.clone();

    let engine = Engine::new(
        EngineParams {
            worker_pool: 2,
            fee_margin: dec!(0.001),
            sell_epsilon: dec!(0.001),
        },
        Arc::clone(&repository_dyn),
        Arc::clone(&adapters_dyn),
        Arc::clone(&filters),
        Arc::clone(&notifier_dyn),
        Arc::clone(&clock_dyn),
    );
    let reconciler = Reconciler::new(
        ReconcilerParams {
            stale_threshold_secs: 60,
            sell_epsilon: dec!(0.001),
        },
        repository_dyn,
        adapters_dyn,
        filters,
        notifier_dyn,
        clock_dyn,
    );

    Harness {
        clock,
        repository,
        exchange,
        notifier,
        engine,
        reconciler,
    }
}

pub fn new_plan_order() -> NewOrder {
    NewOrder {
        user_id: 7,
        exchange_id: 1,
        api_key_id: 1,
        is_testnet: true,
        symbol: "BTCUSDC".to_string(),
        side: Side::Long,
        quantity: dec!(0.001),
        status: OrderStatus::Pending,
        entry_price: dec!(91000),
        max_entry: dec!(92000),
        take_profit: Some(dec!(95000)),
        stop_loss: Some(dec!(90000)),
        entry_interval: Interval::M5,
        stop_interval: Interval::M5,
        executed_price: None,
        executed_at: None,
        tp_order_id: None,
    }
}

pub fn insert_pending(harness: &Harness) -> Order {
    harness
        .repository
        .insert(new_plan_order())
        .expect("insert order")
}

/// A closed M5 candle whose close time lands just before "now".
pub fn closed_candle(harness: &Harness, close: Decimal) -> Candle {
    let now = harness.clock.now_ms();
    let open_time = now - Interval::M5.candle_ms() - 1_000;
    Candle {
        open_time,
        open: close,
        high: close,
        low: close,
        close,
        volume: dec!(1),
    }
}

pub fn set_entry_candle(harness: &Harness, close: Decimal) {
    let candle = closed_candle(harness, close);
    harness.exchange.set_candle("BTCUSDC", Interval::M5, candle);
}

/// Drives the scenario-2 entry: candle above trigger, buy fills, TP rests.
pub fn execute_order(harness: &Harness) -> Order {
    let order = insert_pending(harness);
    set_entry_candle(harness, dec!(91500));
    harness.exchange.set_fill_price(dec!(91450));
    harness.engine.tick();
    let executed = harness
        .repository
        .load(order.id)
        .expect("load")
        .expect("order exists");
    assert_eq!(executed.status, OrderStatus::Executed);
    executed
}
