pub mod engine;
pub mod notify;
pub mod reconcile;
pub mod rounding;
pub mod scheduler;
pub mod triggers;

use crate::config::Config;
use crate::core::engine::{Engine, EngineParams};
use crate::core::notify::Notifier;
use crate::core::reconcile::{Reconciler, ReconcilerParams};
use crate::core::scheduler::{ScheduledTask, Scheduler};
use crate::exchange::filters::FilterCache;
use crate::exchange::registry::{AdapterProvider, AdapterRegistry, CredentialSource};
use crate::storage::OrderRepository;
use crate::{Error, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Wires the lifecycle engine and the reconciliation worker into the tick
/// scheduler. The hosting application keeps the returned handle and calls
/// `stop()` on shutdown; anything left IN_EXECUTION is recovered by the
/// next start's reconciliation sweep.
pub struct Service {
    scheduler: Scheduler,
    engine: Arc<Engine>,
    reconciler: Arc<Reconciler>,
}

impl Service {
    pub fn start(
        config: &Config,
        repository: Arc<dyn OrderRepository>,
        credentials: Arc<dyn CredentialSource>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Service> {
        let (engine, reconciler) = build_workers(config, repository, credentials, notifier, clock)?;

        let tick_engine = Arc::clone(&engine);
        let sweep_reconciler = Arc::clone(&reconciler);
        let scheduler = Scheduler::start(vec![
            ScheduledTask {
                name: "engine",
                period: Duration::from_secs(config.engine.fast_tick_secs.max(1)),
                task: Box::new(move || tick_engine.tick()),
            },
            ScheduledTask {
                name: "reconcile",
                period: Duration::from_secs(config.engine.slow_tick_secs.max(1)),
                task: Box::new(move || sweep_reconciler.sweep()),
            },
        ]);

        Ok(Service {
            scheduler,
            engine,
            reconciler,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn stop(self) {
        self.scheduler.stop();
    }
}

/// One engine + reconciler pair without the scheduler, for one-shot runs
/// and tests.
pub fn build_workers(
    config: &Config,
    repository: Arc<dyn OrderRepository>,
    credentials: Arc<dyn CredentialSource>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<Engine>, Arc<Reconciler>)> {
    let exchange_names = repository
        .list_exchanges()?
        .into_iter()
        .map(|exchange| (exchange.id, exchange.name))
        .collect();
    let adapters: Arc<dyn AdapterProvider> = Arc::new(AdapterRegistry::new(
        credentials,
        Arc::clone(&clock),
        config.binance.clone(),
        config.bybit.clone(),
        exchange_names,
    ));
    let filters = Arc::new(FilterCache::new(
        config.engine.filter_ttl_secs,
        Arc::clone(&clock),
    ));

    let fee_margin = Decimal::from_f64(config.engine.fee_margin)
        .ok_or_else(|| Error::new("engine.fee_margin is not representable"))?;
    let sell_epsilon = Decimal::from_f64(config.engine.sell_epsilon)
        .ok_or_else(|| Error::new("engine.sell_epsilon is not representable"))?;

    let engine = Arc::new(Engine::new(
        EngineParams {
            worker_pool: config.engine.worker_pool.max(1) as usize,
            fee_margin,
            sell_epsilon,
        },
        Arc::clone(&repository),
        Arc::clone(&adapters),
        Arc::clone(&filters),
        Arc::clone(&notifier),
        Arc::clone(&clock),
    ));
    let reconciler = Arc::new(Reconciler::new(
        ReconcilerParams {
            stale_threshold_secs: config.engine.stale_threshold_secs,
            sell_epsilon,
        },
        repository,
        adapters,
        filters,
        notifier,
        clock,
    ));
    Ok((engine, reconciler))
}
