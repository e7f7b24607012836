use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::healing::service::HealingQueue;
use crate::healing::{HealingService, HealingStore};
use crate::scheduler::{RunLedger, ScheduleStore};
use crate::storage::Pool;
use crate::watch::TestWatcher;
use crate::worker::{Dispatcher, TestExecutor};

#[derive(Clone)]
pub struct AppState {
    pub store: ScheduleStore,
    pub ledger: RunLedger,
    pub dispatcher: Dispatcher,
    pub healing: HealingService,
    pub watcher: Arc<TestWatcher>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire every component over one pool. `healing_queue` is the sending side
    /// of the out-of-band analysis worker, when one is running.
    pub fn new(
        config: &AppConfig,
        pool: Pool,
        executor: Arc<dyn TestExecutor>,
        healing: HealingService,
        healing_queue: Option<HealingQueue>,
    ) -> Self {
        let store = ScheduleStore::new(pool.clone(), config.worker.max_retries);
        let ledger = RunLedger::new(pool);
        let dispatcher = Dispatcher::new(
            store.clone(),
            ledger.clone(),
            executor,
            config.worker.clone(),
            healing_queue,
        );
        Self {
            store,
            ledger,
            dispatcher,
            healing,
            watcher: Arc::new(TestWatcher::new(config.watch.clone())),
            started_at: Utc::now(),
        }
    }

    pub fn healing_service(config: &AppConfig, pool: Pool) -> HealingService {
        HealingService::new(HealingStore::new(pool), config.healing.clone())
    }
}
