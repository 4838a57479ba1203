use crate::core::Clock;
use crate::exchange::{AdapterResult, Exchange};
use crate::models::{Order, SymbolFilters};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterKey {
    pub exchange_id: i32,
    pub is_testnet: bool,
    pub symbol: String,
}

impl FilterKey {
    pub fn for_order(order: &Order) -> Self {
        Self {
            exchange_id: order.exchange_id,
            is_testnet: order.is_testnet,
            symbol: order.symbol.clone(),
        }
    }
}

struct CachedFilters {
    filters: SymbolFilters,
    fetched_at_ms: i64,
}

/// Process-wide, TTL-bounded cache of per-symbol trading filters. A
/// FilterViolation on placement evicts the entry so the next attempt
/// refetches.
pub struct FilterCache {
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<FilterKey, CachedFilters>>,
}

impl FilterCache {
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms: (ttl_secs as i64).saturating_mul(1000),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &FilterKey, adapter: &dyn Exchange) -> AdapterResult<SymbolFilters> {
        let now = self.clock.now_ms();
        if let Ok(entries) = self.entries.lock() {
            if let Some(cached) = entries.get(key) {
                if now - cached.fetched_at_ms < self.ttl_ms {
                    return Ok(cached.filters.clone());
                }
            }
        }

        let filters = adapter.symbol_filters(&key.symbol)?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.clone(),
                CachedFilters {
                    filters: filters.clone(),
                    fetched_at_ms: now,
                },
            );
        }
        Ok(filters)
    }

    pub fn evict(&self, key: &FilterKey) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}
