use crate::config::{BinanceSettings, BybitSettings};
use crate::core::Clock;
use crate::exchange::binance::{BinanceConfig, BinanceExchange};
use crate::exchange::bybit::{BybitConfig, BybitExchange};
use crate::exchange::Exchange;
use crate::models::Order;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct ApiCredentials {
    pub api_key_id: i64,
    pub api_key: String,
    pub api_secret: String,
}

/// Hands back already-decrypted credentials; decryption itself belongs to
/// the hosting application.
pub trait CredentialSource: Send + Sync {
    fn credentials(
        &self,
        user_id: i64,
        exchange_id: i32,
        is_testnet: bool,
    ) -> Result<ApiCredentials>;
}

pub trait AdapterProvider: Send + Sync {
    fn adapter(&self, user_id: i64, exchange_id: i32, is_testnet: bool)
        -> Result<Arc<dyn Exchange>>;
    fn invalidate(&self, user_id: i64, exchange_id: i32, is_testnet: bool);

    fn adapter_for(&self, order: &Order) -> Result<Arc<dyn Exchange>> {
        self.adapter(order.user_id, order.exchange_id, order.is_testnet)
    }
}

type ClientKey = (i64, i32, bool);

/// One client per (user, exchange, testnet), built lazily and cached for
/// the process lifetime.
pub struct AdapterRegistry {
    source: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
    binance: BinanceSettings,
    bybit: BybitSettings,
    exchange_names: HashMap<i32, String>,
    clients: Mutex<HashMap<ClientKey, Arc<dyn Exchange>>>,
}

impl AdapterRegistry {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        clock: Arc<dyn Clock>,
        binance: BinanceSettings,
        bybit: BybitSettings,
        exchange_names: HashMap<i32, String>,
    ) -> Self {
        Self {
            source,
            clock,
            binance,
            bybit,
            exchange_names,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn build(
        &self,
        name: &str,
        credentials: &ApiCredentials,
        is_testnet: bool,
    ) -> Result<Arc<dyn Exchange>> {
        match name {
            "binance" => {
                let base_url = if is_testnet {
                    self.binance.testnet_base_url.clone()
                } else {
                    self.binance.base_url.clone()
                };
                let adapter = BinanceExchange::new(
                    BinanceConfig {
                        base_url,
                        api_key: credentials.api_key.clone(),
                        api_secret: credentials.api_secret.clone(),
                        recv_window: self.binance.recv_window,
                        timeout_secs: self.binance.timeout_secs,
                    },
                    Arc::clone(&self.clock),
                )?;
                Ok(Arc::new(adapter))
            }
            "bybit" => {
                let base_url = if is_testnet {
                    self.bybit.testnet_base_url.clone()
                } else {
                    self.bybit.base_url.clone()
                };
                let adapter = BybitExchange::new(
                    BybitConfig {
                        base_url,
                        api_key: credentials.api_key.clone(),
                        api_secret: credentials.api_secret.clone(),
                        recv_window: self.bybit.recv_window,
                        timeout_secs: self.bybit.timeout_secs,
                        category: self.bybit.category.clone(),
                        account_type: self.bybit.account_type.clone(),
                    },
                    Arc::clone(&self.clock),
                )?;
                Ok(Arc::new(adapter))
            }
            other => Err(Error::new(format!("unsupported exchange: {other}"))),
        }
    }
}

impl AdapterProvider for AdapterRegistry {
    fn adapter(
        &self,
        user_id: i64,
        exchange_id: i32,
        is_testnet: bool,
    ) -> Result<Arc<dyn Exchange>> {
        let key: ClientKey = (user_id, exchange_id, is_testnet);
        {
            let clients = self
                .clients
                .lock()
                .map_err(|_| Error::new("adapter registry lock poisoned"))?;
            if let Some(client) = clients.get(&key) {
                return Ok(Arc::clone(client));
            }
        }

        let name = self
            .exchange_names
            .get(&exchange_id)
            .ok_or_else(|| Error::new(format!("unknown exchange id: {exchange_id}")))?
            .clone();
        let credentials = self.source.credentials(user_id, exchange_id, is_testnet)?;
        let adapter = self.build(&name, &credentials, is_testnet)?;

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| Error::new("adapter registry lock poisoned"))?;
        let entry = clients.entry(key).or_insert_with(|| Arc::clone(&adapter));
        Ok(Arc::clone(entry))
    }

    fn invalidate(&self, user_id: i64, exchange_id: i32, is_testnet: bool) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&(user_id, exchange_id, is_testnet));
        }
    }
}
