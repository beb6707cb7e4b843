//! The assembled engine.
//!
//! Owns one instance of every service over a single store, connectivity
//! oracle and remote, so hosts construct it once and hand out references.

use crate::actions::FieldActions;
use crate::aggregate::AggregateReconciler;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::fetcher::{CacheAside, FetchOptions};
use crate::identity::ClientIdentity;
use crate::invalidate::invalidate;
use crate::keys;
use crate::paging::{PagedCache, DEFAULT_PAGE_SIZE};
use crate::queue::{MutationQueue, TempIds};
use crate::remote::{Remote, Request};
use crate::store::{JsonStore, KeyValueStore};
use crate::sync::{PayloadEnricher, SyncConfig, SyncEngine, SyncReport};
use serde_json::Value;
use std::sync::Arc;

pub struct Engine {
    store: JsonStore,
    remote: Arc<dyn Remote>,
    queue: Arc<MutationQueue>,
    identity: ClientIdentity,
    fetcher: CacheAside,
    reconciler: AggregateReconciler,
    sync: SyncEngine,
    actions: FieldActions,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        connectivity: Arc<dyn Connectivity>,
        remote: Arc<dyn Remote>,
        config: SyncConfig,
    ) -> Self {
        let store = JsonStore::new(store);
        let queue = Arc::new(MutationQueue::new(store.clone()));
        let temp_ids = Arc::new(TempIds::new(store.clone()));
        let fetcher = CacheAside::new(store.clone(), connectivity.clone());
        let reconciler =
            AggregateReconciler::new(fetcher.clone(), remote.clone(), config.pond_fresh_for);

        let sync = SyncEngine::new(
            queue.clone(),
            store.clone(),
            connectivity.clone(),
            remote.clone(),
            config,
        );
        let actions = FieldActions::new(
            store.clone(),
            queue.clone(),
            temp_ids,
            connectivity,
            remote.clone(),
            reconciler.clone(),
        );

        Self {
            identity: ClientIdentity::new(store.clone()),
            store,
            remote,
            queue,
            fetcher,
            reconciler,
            sync,
            actions,
        }
    }

    /// Register a payload enricher on the sync engine.
    pub fn with_enricher(self, enricher: Arc<dyn PayloadEnricher>) -> Self {
        Self {
            sync: self.sync.with_enricher(enricher),
            ..self
        }
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn fetcher(&self) -> &CacheAside {
        &self.fetcher
    }

    pub fn reconciler(&self) -> &AggregateReconciler {
        &self.reconciler
    }

    pub fn actions(&self) -> &FieldActions {
        &self.actions
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    /// Run one sync pass.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync.sync().await
    }

    /// The pond list, network first.
    pub async fn ponds(&self) -> Result<Option<Value>> {
        self.read(keys::PONDS_LIST, "/api/ponds/").await
    }

    /// Every active stocking batch, network first.
    pub async fn active_stock(&self) -> Result<Option<Value>> {
        self.read(keys::ACTIVE_STOCK, "/api/stocking/active").await
    }

    /// Dashboard analytics, network first.
    pub async fn analytics(&self) -> Result<Option<Value>> {
        self.read(keys::ANALYTICS, "/api/analytics/summary").await
    }

    /// One pond's detail record.
    pub async fn pond(&self, pond_id: i64) -> Result<Option<Value>> {
        self.reconciler.load_pond(pond_id).await
    }

    /// Closed-cycle history of a pond, paged and cached under `HISTORY_<id>`.
    pub fn history(&self, pond_id: i64) -> PagedCache {
        PagedCache::new(
            self.store.clone(),
            self.fetcher.connectivity().clone(),
            keys::history(pond_id),
            DEFAULT_PAGE_SIZE,
        )
    }

    /// Fetch one history page from the server.
    pub async fn fetch_history_page(
        &self,
        pond_id: i64,
        page: u32,
        page_size: usize,
    ) -> std::result::Result<Value, crate::remote::RemoteError> {
        self.remote
            .execute(&Request::get(format!(
                "/api/history/{pond_id}?page={page}&limit={page_size}"
            )))
            .await
    }

    /// Drop cached entries.
    pub async fn invalidate(&self, keys: &[&str]) -> Result<()> {
        invalidate(&self.store, keys).await
    }

    async fn read(&self, key: &str, path: &str) -> Result<Option<Value>> {
        let remote = self.remote.clone();
        let request = Request::get(path);
        self.fetcher
            .get_smart_data(
                key,
                || async move { remote.execute(&request).await },
                FetchOptions::default(),
            )
            .await
    }
}
