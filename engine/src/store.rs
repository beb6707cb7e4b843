//! Store - the durable key-value primitive everything else is built on.
//!
//! [`KeyValueStore`] is the only persistence contract the engine relies on:
//! get/set/remove of strings under string keys, with no transactions and no
//! multi-key atomicity. [`JsonStore`] layers typed JSON access on top.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// A persistent string-keyed store.
///
/// Implementations must be durable across process restarts (the in-memory
/// [`MemoryStore`] is the exception, for tests and embedding).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the raw value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create an empty store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Typed JSON accessor over a [`KeyValueStore`].
///
/// Reads are shape-checked: a value that is not valid JSON, or does not
/// deserialize into the requested type, is reported as absent. Only backend
/// failures are returned as errors.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore").finish_non_exhaustive()
    }
}

impl JsonStore {
    /// Wrap a raw store.
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// The underlying raw store.
    pub fn raw(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner
    }

    /// Read and decode the value under `key`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.inner.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }

    /// Encode and write `value` under `key`.
    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|e| Error::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.inner.set(key, raw).await
    }

    /// Read the raw string under `key`.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    /// Write a raw string under `key`.
    pub async fn put_raw(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.inner.set(key, value.into()).await
    }

    /// Remove `key`.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}
