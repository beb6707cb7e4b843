//! Paged lists that stay readable offline.
//!
//! A [`PagedCache`] keeps the pages loaded so far under one store key. A
//! refresh serves the cached list first and, when online, replaces it with
//! page 1 from the server. Loading more appends de-duplicated pages and
//! writes the grown list back.

use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::fetcher::Origin;
use crate::remote::RemoteError;
use crate::store::JsonStore;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// The list as currently known.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub has_more: bool,
    pub origin: Origin,
}

#[derive(Debug)]
struct State {
    items: Vec<Value>,
    seen: HashSet<String>,
    next_page: u32,
    has_more: bool,
    origin: Origin,
}

impl State {
    fn reset(&mut self, items: Vec<Value>) {
        self.seen = items.iter().filter_map(dedup_key).collect();
        self.items = items;
    }

    fn page(&self) -> Page {
        Page {
            items: self.items.clone(),
            has_more: self.has_more,
            origin: self.origin,
        }
    }
}

/// Paged list cached under a single key, e.g. `HISTORY_<pond>`.
pub struct PagedCache {
    store: JsonStore,
    connectivity: Arc<dyn Connectivity>,
    key: String,
    page_size: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for PagedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedCache")
            .field("key", &self.key)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl PagedCache {
    pub fn new(
        store: JsonStore,
        connectivity: Arc<dyn Connectivity>,
        key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            connectivity,
            key: key.into(),
            page_size: page_size.max(1),
            state: Mutex::new(State {
                items: Vec::new(),
                seen: HashSet::new(),
                next_page: 1,
                has_more: true,
                origin: Origin::Cache,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reload from the cache, then replace with page 1 when online.
    ///
    /// `fetch_page` receives the 1-based page number and the page size.
    pub async fn refresh<F, Fut>(&self, fetch_page: F) -> Result<Page>
    where
        F: FnOnce(u32, usize) -> Fut,
        Fut: Future<Output = std::result::Result<Value, RemoteError>>,
    {
        let mut state = self.state.lock().await;

        let cached: Vec<Value> = self.store.get_json(&self.key).await?.unwrap_or_default();
        state.reset(cached);
        state.origin = Origin::Cache;
        state.has_more = false;

        if !self.connectivity.is_online().await {
            tracing::debug!(key = %self.key, items = state.items.len(), "Offline, serving cached pages");
            return Ok(state.page());
        }

        match fetch_page(1, self.page_size).await {
            Ok(response) => {
                let items = normalize(response);
                tracing::debug!(key = %self.key, items = items.len(), "Synced first page");
                state.has_more = items.len() >= self.page_size;
                state.next_page = 2;
                state.origin = Origin::Network;
                self.store.put_json(&self.key, &items).await?;
                state.reset(items);
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "First page fetch failed, serving cache");
            }
        }

        Ok(state.page())
    }

    /// Fetch and append the next page. A no-op offline, when the end has been
    /// reached, or while another load is running.
    pub async fn load_more<F, Fut>(&self, fetch_page: F) -> Result<Page>
    where
        F: FnOnce(u32, usize) -> Fut,
        Fut: Future<Output = std::result::Result<Value, RemoteError>>,
    {
        let Ok(mut state) = self.state.try_lock() else {
            return Ok(self.snapshot().await);
        };
        if !state.has_more || !self.connectivity.is_online().await {
            return Ok(state.page());
        }

        let page_no = state.next_page;
        let fresh = match fetch_page(page_no, self.page_size).await {
            Ok(response) => normalize(response),
            Err(e) => {
                tracing::warn!(key = %self.key, page = page_no, error = %e, "Load more failed");
                return Ok(state.page());
            }
        };

        if fresh.is_empty() {
            state.has_more = false;
            return Ok(state.page());
        }

        let short_page = fresh.len() < self.page_size;
        let mut added = 0;
        for item in fresh {
            let keep = match dedup_key(&item) {
                Some(k) => state.seen.insert(k),
                None => true,
            };
            if keep {
                state.items.push(item);
                added += 1;
            }
        }

        state.next_page += 1;
        if short_page {
            state.has_more = false;
        }
        if added > 0 {
            self.store.put_json(&self.key, &state.items).await?;
        }

        tracing::debug!(key = %self.key, page = page_no, added, "Loaded more items");
        Ok(state.page())
    }

    /// The list as last loaded, without any IO.
    pub async fn snapshot(&self) -> Page {
        self.state.lock().await.page()
    }
}

/// Extract the item list from a bare array, `{data: [...]}` or
/// `{results: [...]}`. Anything else is an empty page.
pub fn normalize(response: Value) -> Vec<Value> {
    match response {
        Value::Array(items) => items,
        Value::Object(mut fields) => match (fields.remove("data"), fields.remove("results")) {
            (Some(Value::Array(items)), _) => items,
            (_, Some(Value::Array(items))) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Identity of a list item: `stocking_id` when set, else `id`.
fn dedup_key(item: &Value) -> Option<String> {
    let usable = |v: &&Value| !matches!(v, Value::Null | Value::Bool(false)) && v.as_i64() != Some(0);
    item.get("stocking_id")
        .filter(usable)
        .or_else(|| item.get("id").filter(usable))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn cache(online: bool, page_size: usize) -> (Arc<ManualConnectivity>, PagedCache) {
        let conn = ManualConnectivity::new_shared(online);
        let store = JsonStore::new(MemoryStore::new_shared());
        (conn.clone(), PagedCache::new(store, conn, "HISTORY_1", page_size))
    }

    fn cycles(ids: std::ops::Range<i64>) -> Value {
        Value::Array(ids.map(|id| json!({"stocking_id": id})).collect())
    }

    #[test]
    fn normalize_accepts_wrapped_lists() {
        assert_eq!(normalize(json!([1, 2])).len(), 2);
        assert_eq!(normalize(json!({"data": [1]})).len(), 1);
        assert_eq!(normalize(json!({"results": [1, 2, 3]})).len(), 3);
        assert!(normalize(json!({"detail": "nope"})).is_empty());
        assert!(normalize(json!(null)).is_empty());
    }

    #[test]
    fn dedup_prefers_stocking_id() {
        assert_eq!(dedup_key(&json!({"stocking_id": 4, "id": 9})), Some("4".into()));
        assert_eq!(dedup_key(&json!({"stocking_id": null, "id": 9})), Some("9".into()));
        assert_eq!(dedup_key(&json!({"id": "abc"})), Some("abc".into()));
        assert_eq!(dedup_key(&json!({"name": "x"})), None);
    }

    #[tokio::test]
    async fn refresh_replaces_cache_with_first_page() {
        let (_, pages) = cache(true, 2);
        pages
            .store
            .put_json("HISTORY_1", &json!([{"stocking_id": 99}]))
            .await
            .unwrap();

        let page = pages.refresh(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.origin, Origin::Network);

        let stored: Vec<Value> = pages.store.get_json("HISTORY_1").await.unwrap().unwrap();
        assert_eq!(stored, normalize(cycles(1..3)));
    }

    #[tokio::test]
    async fn offline_refresh_serves_cache_without_more() {
        let (_, pages) = cache(false, 10);
        pages
            .store
            .put_json("HISTORY_1", &cycles(1..4))
            .await
            .unwrap();

        let fetched = AtomicBool::new(false);
        let page = pages
            .refresh(|_, _| async {
                fetched.store(true, Ordering::SeqCst);
                Ok(json!([]))
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(!page.has_more);

        let more = pages
            .load_more(|_, _| async {
                fetched.store(true, Ordering::SeqCst);
                Ok(json!([]))
            })
            .await
            .unwrap();
        assert_eq!(more.items.len(), 3);
        assert!(!fetched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn load_more_dedups_and_appends() {
        let (_, pages) = cache(true, 2);
        pages.refresh(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();

        let page = pages
            .load_more(|page, size| async move {
                assert_eq!((page, size), (2, 2));
                Ok(json!({"data": [{"stocking_id": 2}, {"stocking_id": 3}]}))
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.has_more);

        let stored: Vec<Value> = pages.store.get_json("HISTORY_1").await.unwrap().unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn empty_or_short_page_ends_paging() {
        let (_, pages) = cache(true, 2);
        pages.refresh(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();

        let page = pages
            .load_more(|_, _| async { Ok(cycles(3..4)) })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(!page.has_more);

        let (_, pages) = cache(true, 2);
        pages.refresh(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();
        let page = pages.load_more(|_, _| async { Ok(json!([])) }).await.unwrap();
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn duplicate_page_still_advances() {
        let (_, pages) = cache(true, 2);
        pages.refresh(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();

        pages.load_more(|_, _| async { Ok(cycles(1..3)) }).await.unwrap();
        pages
            .load_more(|page, _| async move {
                assert_eq!(page, 3);
                Ok(cycles(5..7))
            })
            .await
            .unwrap();

        assert_eq!(pages.snapshot().await.items.len(), 4);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_cache() {
        let (_, pages) = cache(true, 10);
        pages
            .store
            .put_json("HISTORY_1", &cycles(1..2))
            .await
            .unwrap();

        let page = pages
            .refresh(|_, _| async { Err(RemoteError::Timeout) })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.origin, Origin::Cache);
    }
}
