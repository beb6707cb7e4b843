//! Cache-aside fetcher.
//!
//! The single place that decides between the network and the local cache.
//! Network first when online, write-through on success, cache on failure.
//! Offline and failed fetches are normal outcomes, never errors.

use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::remote::RemoteError;
use crate::store::JsonStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bookkeeping field stamped on locally maintained records.
pub const UPDATED_AT_FIELD: &str = "_local_updated_at";

/// Bookkeeping field naming where a record's derived fields came from.
pub const SOURCE_FIELD: &str = "_source";

/// Options for a single fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Go to the network even if the oracle reports offline or the cache is fresh.
    pub force_refresh: bool,
    /// Serve server-sourced cache entries younger than this without a network call.
    pub max_age: Option<Duration>,
}

impl FetchOptions {
    /// Always hit the network.
    pub fn force() -> Self {
        Self {
            force_refresh: true,
            max_age: None,
        }
    }

    /// Trust server-sourced cache entries for `max_age`.
    pub fn fresh_for(max_age: Duration) -> Self {
        Self {
            force_refresh: false,
            max_age: Some(max_age),
        }
    }
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Network,
    Cache,
}

/// A fetch result with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Option<Value>,
    pub origin: Origin,
}

/// Network-first reader with cache fallback.
#[derive(Clone)]
pub struct CacheAside {
    store: JsonStore,
    connectivity: Arc<dyn Connectivity>,
}

impl std::fmt::Debug for CacheAside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside").finish_non_exhaustive()
    }
}

impl CacheAside {
    pub fn new(store: JsonStore, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            store,
            connectivity,
        }
    }

    /// The store this fetcher writes through to.
    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    /// The connectivity oracle consulted before each fetch.
    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    /// Fetch `key`, returning only the value.
    pub async fn get_smart_data<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: FetchOptions,
    ) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, RemoteError>>,
    {
        Ok(self.fetch(key, fetch, options).await?.value)
    }

    /// Fetch `key`, reporting whether the value came from the network.
    pub async fn fetch<F, Fut>(&self, key: &str, fetch: F, options: FetchOptions) -> Result<Fetched>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, RemoteError>>,
    {
        if !options.force_refresh {
            if let Some(max_age) = options.max_age {
                if let Some(cached) = self.store.get_json::<Value>(key).await? {
                    if is_fresh(&cached, max_age, Utc::now()) {
                        tracing::debug!(key = %key, "Serving fresh cache entry");
                        return Ok(Fetched {
                            value: Some(cached),
                            origin: Origin::Cache,
                        });
                    }
                }
            }
        }

        if options.force_refresh || self.connectivity.is_online().await {
            match fetch().await {
                Ok(value) => {
                    self.store.put_json(key, &value).await?;
                    return Ok(Fetched {
                        value: Some(value),
                        origin: Origin::Network,
                    });
                }
                Err(e) => {
                    tracing::info!(key = %key, error = %e, "Network fetch failed, using cache");
                }
            }
        }

        Ok(Fetched {
            value: self.store.get_json(key).await?,
            origin: Origin::Cache,
        })
    }
}

/// Whether a cached record may be served without asking the server.
///
/// Only records the server itself produced age gracefully; anything derived
/// locally is treated as stale so the next online read replaces it.
pub fn is_fresh(cached: &Value, max_age: Duration, now: DateTime<Utc>) -> bool {
    if cached.get(SOURCE_FIELD).and_then(Value::as_str) != Some("server") {
        return false;
    }

    let Some(updated_at) = cached
        .get(UPDATED_AT_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    else {
        return false;
    };

    let age = now.signed_duration_since(updated_at.with_timezone(&Utc));
    match age.to_std() {
        Ok(age) => age <= max_age,
        // Timestamp in the future: clock moved backwards, don't trust it
        Err(_) => false,
    }
}
